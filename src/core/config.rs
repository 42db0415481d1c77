//! Recognised configuration options (spec §6.4).
//!
//! There is no file-format loader here — reading a config file from disk
//! is the command-line tool's job, not the core's. This is just the
//! in-memory shape plus the defaults the rest of the core assumes.

/// Which kernel/userspace signal the watcher uses to learn about hot-plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Choose `Xevent` when a GUI session is detected, `Poll` otherwise.
    Dynamic,
    /// Sleep in a bounded loop and re-scan sysfs every tick.
    Poll,
    /// Block on the udev netlink socket.
    Udev,
    /// Block on an X11 RandR screen-change event.
    Xevent,
}

impl Default for WatchMode {
    fn default() -> Self {
        WatchMode::Dynamic
    }
}

/// The resolved mode a `Dynamic` request settles on; stored alongside the
/// watcher's public `WatchMode` once `start()` has picked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedWatchMode {
    Poll,
    Udev,
    Xevent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Never trust sysfs `edid`; always read via the bus.
    pub force_read_edid: bool,
    /// Enable the advisory file lock layer across processes.
    pub cross_instance_locks_enabled: bool,
    /// Retry interval under file-lock contention, in milliseconds.
    pub flock_poll_millisec: u64,
    /// Total acquire budget for a waiting flock attempt, in milliseconds.
    pub flock_max_wait_millisec: u64,
    /// Delay before resampling on a suspected disconnect, in milliseconds.
    pub extra_stabilisation_millisec: u64,
    /// Interval between stabilisation resamples, in milliseconds.
    pub stabilisation_poll_millisec: u64,
    /// Which watch mechanism the watcher should use.
    pub watch_mode: WatchMode,
    /// Backstop re-scan cadence for udev watch mode: `step()` runs on this
    /// interval even without socket activity, in milliseconds.
    pub udev_watch_loop_millisec: u64,
    /// Poll interval for poll watch mode, in milliseconds.
    pub poll_watch_loop_millisec: u64,
    /// Backstop re-scan cadence for xevent watch mode: `step()` runs on
    /// this interval even without a RandR event, in milliseconds.
    pub xevent_watch_loop_millisec: u64,
    /// Retry `set_slave_address` with the forceful ioctl variant on EBUSY.
    pub i2c_force_slave_addr: bool,
    /// Bus count at or above which the initial probe fan-out parallelises.
    pub i2c_businfo_async_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            force_read_edid: false,
            cross_instance_locks_enabled: true,
            flock_poll_millisec: 50,
            flock_max_wait_millisec: 2_000,
            extra_stabilisation_millisec: 1_000,
            stabilisation_poll_millisec: 100,
            watch_mode: WatchMode::Dynamic,
            udev_watch_loop_millisec: 3_000,
            poll_watch_loop_millisec: 3_000,
            xevent_watch_loop_millisec: 3_000,
            i2c_force_slave_addr: false,
            i2c_businfo_async_threshold: 4,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force_read_edid(mut self, force: bool) -> Self {
        self.force_read_edid = force;
        self
    }

    pub fn with_cross_instance_locks_enabled(mut self, enabled: bool) -> Self {
        self.cross_instance_locks_enabled = enabled;
        self
    }

    pub fn with_watch_mode(mut self, mode: WatchMode) -> Self {
        self.watch_mode = mode;
        self
    }

    pub fn with_i2c_force_slave_addr(mut self, force: bool) -> Self {
        self.i2c_force_slave_addr = force;
        self
    }
}
