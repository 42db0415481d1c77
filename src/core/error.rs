//! Typed error taxonomy for the hot-plug watcher and bus lifecycle core.

use std::io;

use thiserror::Error;

/// Errors surfaced by the bus/connector registry, the watcher, and the
/// lock manager.
///
/// This mirrors the kernel-call-adjacent error kinds of [`crate::ddc::DdcError`]
/// but covers the control-plane concerns (locking, watcher state, hot-plug
/// reconciliation) that the DDC/CI packet layer has no opinion about.
#[derive(Debug, Error)]
pub enum HotplugError {
    /// Caller precondition unmet: watcher already running, or no DRM.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Bad argument, e.g. an empty event-class set or an out-of-range busno.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No bus or connector matches the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A kernel call failed; `busno` and `op` identify where.
    #[error("i/o error on bus {busno} during {op}: {source}")]
    Io {
        busno: i32,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The in-process lock for this bus is held by another holder.
    #[error("bus {0} is locked by another holder in this process")]
    Locked(i32),

    /// The advisory file lock could not be acquired within the configured budget.
    #[error("bus {0} could not be flocked within the configured wait")]
    Flocked(i32),

    /// A bus read or write returned fewer bytes than requested.
    #[error("short ddc data transfer on bus {0}")]
    DdcData(i32),

    /// An EDID was read but its checksum did not sum to zero mod 256.
    #[error("edid checksum invalid on bus {0}")]
    EdidChecksum(i32),

    /// The bus is alive, but no EDID is currently readable from it.
    #[error("bus {0} has no display connected")]
    Disconnected(i32),

    /// The bus is alive and EDID-bearing, but DPMS reports a sleep state.
    #[error("bus {0}'s display is in a DPMS sleep state")]
    DpmsAsleep(i32),
}

impl HotplugError {
    pub fn io(busno: i32, op: &'static str, source: io::Error) -> Self {
        HotplugError::Io { busno, op, source }
    }
}

pub type Result<T> = std::result::Result<T, HotplugError>;
