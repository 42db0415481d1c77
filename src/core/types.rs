//! The data model shared by every component of the hot-plug core (spec §3).

use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use crate::ddc::edid::{parse_edid, Edid, EdidParseError};

/// The 128-byte EDID block plus its parsed summary, as read from either
/// sysfs or a direct bus read.
#[derive(Debug, Clone, PartialEq)]
pub struct EdidInfo {
    pub raw: [u8; 128],
    pub parsed: Edid,
}

impl EdidInfo {
    /// Parses a 128-byte (or longer, in which case only the first 128
    /// bytes count towards identity per spec §8.3) EDID block.
    pub fn parse(bytes: &[u8]) -> Result<Self, EdidParseError> {
        let mut raw = [0u8; 128];
        let n = bytes.len().min(128);
        raw[..n].copy_from_slice(&bytes[..n]);
        let parsed = parse_edid(&raw)?;
        Ok(EdidInfo { raw, parsed })
    }

    pub fn mfg_id(&self) -> String {
        self.parsed.mfg_id()
    }

    pub fn model_name(&self) -> Option<String> {
        self.parsed.model_name()
    }

    pub fn serial_ascii(&self) -> String {
        self.parsed.serial_ascii()
    }
}

/// How a bus's DRM connector name was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorSource {
    NotFound,
    ByBusno,
    ByEdid,
}

/// Flags tracked against a [`BusInfo`] (spec §3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusFlags {
    pub exists: bool,
    pub name_checked: bool,
    pub has_valid_name: bool,
    pub probed: bool,
    pub accessible: bool,
    pub addr_0x50_responsive: bool,
    pub addr_0x37_responsive: bool,
    pub edid_from_sysfs: bool,
    pub laptop_panel: bool,
    pub drm_connector_checked: bool,
}

/// One record per `/dev/i2c-N` ever seen in this process (spec §3.1, §3.3).
#[derive(Debug, Clone)]
pub struct BusInfo {
    pub busno: i32,
    pub flags: BusFlags,
    pub driver: Option<String>,
    pub drm_connector_name: Option<String>,
    pub drm_connector_source: ConnectorSource,
    pub drm_connector_id: Option<i32>,
    pub edid: Option<EdidInfo>,
    pub functionality: u32,
    pub open_error: Option<String>,
    pub last_checked_dpms_asleep: bool,
}

impl BusInfo {
    pub fn new(busno: i32) -> Self {
        BusInfo {
            busno,
            flags: BusFlags::default(),
            driver: None,
            drm_connector_name: None,
            drm_connector_source: ConnectorSource::NotFound,
            drm_connector_id: None,
            edid: None,
            functionality: 0,
            open_error: None,
            last_checked_dpms_asleep: false,
        }
    }

    /// Invariant 8.1.3: `edid.is_some()` iff `addr_0x50_responsive`.
    pub fn edid_invariant_holds(&self) -> bool {
        self.edid.is_some() == self.flags.addr_0x50_responsive
    }

    /// Resets everything a disconnect should clear, without forgetting the
    /// record (it stays alive for the lifetime of the process, spec §3.3).
    pub fn reset_on_disconnect(&mut self) {
        self.edid = None;
        self.flags.addr_0x50_responsive = false;
        self.flags.addr_0x37_responsive = false;
        self.flags.edid_from_sysfs = false;
        self.flags.accessible = false;
        self.flags.probed = false;
    }
}

/// An I/O path identifying a bus device (spec §3.1, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPath {
    pub busno: i32,
}

impl IoPath {
    pub fn i2c(busno: i32) -> Self {
        IoPath { busno }
    }
}

/// A stable, reference-counted client handle (spec §3.1). Owns no kernel
/// resources; a reconnect always produces a *new* `DisplayRef`, never
/// resurrects one that has `removed` set (invariant 8.1.2).
#[derive(Debug)]
pub struct DisplayRefInner {
    pub io_path: IoPath,
    pub drm_connector: Mutex<Option<String>>,
    pub removed: Mutex<bool>,
    pub busno: i32,
}

pub type DisplayRef = Arc<DisplayRefInner>;
pub type WeakDisplayRef = Weak<DisplayRefInner>;

impl DisplayRefInner {
    pub fn new(busno: i32, drm_connector: Option<String>) -> DisplayRef {
        Arc::new(DisplayRefInner {
            io_path: IoPath::i2c(busno),
            drm_connector: Mutex::new(drm_connector),
            removed: Mutex::new(false),
            busno,
        })
    }

    pub fn is_removed(&self) -> bool {
        *self.removed.lock().unwrap()
    }

    /// Invariant 8.1.2: once set, `removed` may never be unset.
    pub fn mark_removed(&self) {
        *self.removed.lock().unwrap() = true;
    }
}

/// One record per connector directory under `/sys/class/drm` (spec §3.1, §4.A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRecord {
    pub connector_name: String,
    pub connector_id: i32,
    pub i2c_busno: i32,
    pub base_busno: i32,
    pub edid_bytes: Option<Vec<u8>>,
    pub status: ConnectorStatus,
    pub enabled: bool,
    pub is_dp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl ConnectorRecord {
    pub fn has_usable_edid(&self) -> bool {
        self.edid_bytes.as_ref().is_some_and(|b| b.len() >= 128)
    }
}

/// Event kinds delivered to clients (spec §3.1, §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected = 1,
    Disconnected = 2,
    DpmsAsleep = 3,
    DpmsAwake = 4,
}

/// An event delivered to a sink.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub io_path: IoPath,
    pub drm_connector: Option<String>,
    pub display_ref: Option<DisplayRef>,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn new(
        kind: EventKind,
        busno: i32,
        drm_connector: Option<String>,
        display_ref: Option<DisplayRef>,
        timestamp: SystemTime,
    ) -> Self {
        Event {
            kind,
            io_path: IoPath::i2c(busno),
            drm_connector,
            display_ref,
            timestamp,
        }
    }
}
