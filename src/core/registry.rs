//! Component D — Bus Registry.
//!
//! Holds the process-wide `busno -> BusInfo` mapping. All mutation funnels
//! through here and is serialised by one registry-wide lock, distinct
//! from the per-bus locks in [`crate::core::lock`]. Never hold this lock
//! across a bus open, an EDID read, or a stabilisation sleep — those must
//! snapshot, release, do the I/O, then re-acquire to commit (spec §5).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::gateway::{BusHandle, ReadMode};
use crate::core::lock::LockManager;
use crate::core::sysfs;
use crate::core::types::{BusInfo, ConnectorSource, DisplayRef, DisplayRefInner};

/// A laptop's built-in panel EDID conventionally declares no physical
/// diagonal; combined with a digital video-input byte this is as close to
/// a portable signal as the EDID itself offers once the connector name
/// (`eDP`/`LVDS`) isn't available to decide the question outright.
fn edid_looks_like_laptop_panel(edid: &crate::core::types::EdidInfo) -> bool {
    let digital = edid.parsed.display.video_input & 0x80 != 0;
    digital && edid.parsed.display.width == 0 && edid.parsed.display.height == 0
}

struct Inner {
    buses: HashMap<i32, BusInfo>,
    displays: Vec<DisplayRef>,
    insertion_order: Vec<i32>,
}

/// The bus-registry (component D), guarded by one process-wide mutex.
pub struct Registry {
    inner: Mutex<Inner>,
    locks: LockManager,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                buses: HashMap::new(),
                displays: Vec::new(),
                insertion_order: Vec::new(),
            }),
            locks: LockManager::new(),
        }
    }

    pub fn find_by_busno(&self, busno: i32) -> Option<BusInfo> {
        self.inner.lock().unwrap().buses.get(&busno).cloned()
    }

    /// Returns copies of every `BusInfo`, in insertion order (spec §4.D,
    /// §6.3 `registry snapshot()`).
    pub fn snapshot(&self) -> Vec<BusInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .insertion_order
            .iter()
            .filter_map(|busno| inner.buses.get(busno).cloned())
            .collect()
    }

    /// Returns every `DisplayRef` that is not yet marked *removed*.
    pub fn live_displays(&self) -> Vec<DisplayRef> {
        self.inner
            .lock()
            .unwrap()
            .displays
            .iter()
            .filter(|d| !d.is_removed())
            .cloned()
            .collect()
    }

    /// Creates an empty record if absent, flagging it *exists |
    /// name-checked | has-valid-name*. Never probes (spec §4.D).
    pub fn ensure_businfo(&self, busno: i32) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.buses.contains_key(&busno) {
            let mut info = BusInfo::new(busno);
            info.flags.exists = true;
            info.flags.name_checked = true;
            info.flags.has_valid_name = true;
            inner.insertion_order.push(busno);
            inner.buses.insert(busno, info);
        }
    }

    /// Runs the 9-step probe sequence (spec §4.D.1) for `busno`, unless
    /// already probed. `connectors`, if given, is consulted for a
    /// sysfs-derived EDID and for a by-EDID connector lookup; omit it to
    /// force a direct bus read.
    pub fn probe(
        &self,
        config: &Config,
        busno: i32,
        connectors: Option<&[crate::core::types::ConnectorRecord]>,
    ) -> Result<()> {
        if self.find_by_busno(busno).is_some_and(|b| b.flags.probed) {
            return Ok(());
        }

        self.ensure_businfo(busno);
        let driver = sysfs::driver_of(busno);

        // Resolved independently of `force_read_edid`, which only gates
        // whether the connector's `edid` attribute is trusted — the
        // connector identity itself (spec §3.1's by-busno discovery) is
        // always worth recording when sysfs already names it.
        let connector_by_busno = connectors.and_then(|cs| sysfs::connector_for_busno(cs, busno));

        let mut edid = None;
        let mut edid_from_sysfs = false;
        if !config.force_read_edid {
            if let Some(record) = connector_by_busno {
                if record.has_usable_edid() {
                    if let Some(bytes) = &record.edid_bytes {
                        if let Ok(parsed) = crate::core::types::EdidInfo::parse(bytes) {
                            edid = Some(parsed);
                            edid_from_sysfs = true;
                        }
                    }
                }
            }
        }

        let handle = match BusHandle::open(&self.locks, config, busno, driver.clone(), true) {
            Ok(h) => h,
            Err(e) => {
                crate::core::gateway::log_open_failure_once(busno, &e);
                self.mutate(busno, |info| {
                    info.driver = driver;
                    info.open_error = Some(e.to_string());
                });
                return Ok(());
            }
        };

        let functionality = handle.get_functionality().unwrap_or(0);

        if edid.is_none() {
            edid = handle.read_edid(config, ReadMode::Block).ok();
        }

        let is_laptop_panel = edid.as_ref().is_some_and(edid_looks_like_laptop_panel);

        let addr_0x37_responsive = if is_laptop_panel {
            false
        } else {
            handle.probe_ddc_ci_address(config)
        };

        drop(handle);

        // Only look up by EDID when sysfs didn't already hand us the
        // connector directly by busno (spec §3.1: not-found/by-busno/by-edid
        // are mutually exclusive discovery means for one `BusInfo`).
        let found_by_edid = if connector_by_busno.is_none() {
            connectors.and_then(|connectors| {
                edid.as_ref()
                    .and_then(|e| sysfs::connector_for_edid(connectors, &e.raw))
            })
        } else {
            None
        };

        self.mutate(busno, |info| {
            info.driver = driver;
            info.functionality = functionality;
            info.flags.accessible = true;
            info.flags.addr_0x50_responsive = edid.is_some();
            info.flags.edid_from_sysfs = edid_from_sysfs;
            info.flags.laptop_panel = is_laptop_panel;
            info.flags.addr_0x37_responsive = addr_0x37_responsive;
            info.edid = edid;
            if info.drm_connector_name.is_none() {
                if let Some(record) = connector_by_busno {
                    info.drm_connector_name = Some(record.connector_name.clone());
                    info.drm_connector_id = Some(record.connector_id);
                    info.drm_connector_source = ConnectorSource::ByBusno;
                    info.flags.drm_connector_checked = true;
                } else if let Some(record) = found_by_edid {
                    info.drm_connector_name = Some(record.connector_name.clone());
                    info.drm_connector_id = Some(record.connector_id);
                    info.drm_connector_source = ConnectorSource::ByEdid;
                    info.flags.drm_connector_checked = true;
                }
            }
            info.flags.probed = true;
        });

        Ok(())
    }

    fn mutate(&self, busno: i32, f: impl FnOnce(&mut BusInfo)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.buses.get_mut(&busno) {
            f(info);
        }
    }

    /// Resets the EDID-bearing flags on disconnect and marks any live
    /// `DisplayRef` for this bus *removed* (spec §4.D, invariant 8.1.2).
    pub fn mark_disconnected(&self, busno: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.buses.get_mut(&busno) {
            info.reset_on_disconnect();
        }
        for display in inner.displays.iter() {
            if display.busno == busno && !display.is_removed() {
                display.mark_removed();
            }
        }
    }

    /// Creates a new `DisplayRef` for `busno` (spec §4.D). A reconnect
    /// always calls this again rather than reviving a removed handle
    /// (invariant 8.1.2).
    pub fn add_display(&self, busno: i32, drm_connector: Option<String>) -> DisplayRef {
        let display = DisplayRefInner::new(busno, drm_connector);
        self.inner.lock().unwrap().displays.push(display.clone());
        display
    }

    /// Supplemented operation: drops a `DisplayRef` from the registry's
    /// own bookkeeping without touching its *removed* flag. Clients that
    /// already hold an `Arc` keep a live handle; this only stops the
    /// registry from returning it out of future [`Self::live_displays`]
    /// or [`Self::snapshot`]-adjacent calls.
    pub fn forget_display(&self, display: &DisplayRef) {
        let mut inner = self.inner.lock().unwrap();
        inner.displays.retain(|d| !std::sync::Arc::ptr_eq(d, display));
    }

    /// Removes the `BusInfo` entry entirely, once the device has also
    /// disappeared from `/dev` (spec §4.D).
    pub fn remove_by_busno(&self, busno: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.buses.remove(&busno);
        inner.insertion_order.retain(|b| *b != busno);
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_businfo_is_idempotent_and_does_not_probe() {
        let reg = Registry::new();
        reg.ensure_businfo(4);
        reg.ensure_businfo(4);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(!snap[0].flags.probed);
    }

    #[test]
    fn mark_disconnected_flags_live_displays_removed() {
        let reg = Registry::new();
        reg.ensure_businfo(2);
        let display = reg.add_display(2, Some("card0-DP-1".into()));
        assert!(!display.is_removed());
        reg.mark_disconnected(2);
        assert!(display.is_removed());
    }

    #[test]
    fn remove_by_busno_drops_the_record() {
        let reg = Registry::new();
        reg.ensure_businfo(5);
        assert!(reg.find_by_busno(5).is_some());
        reg.remove_by_busno(5);
        assert!(reg.find_by_busno(5).is_none());
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let reg = Registry::new();
        reg.ensure_businfo(9);
        reg.ensure_businfo(1);
        reg.ensure_businfo(4);
        let order: Vec<_> = reg.snapshot().iter().map(|b| b.busno).collect();
        assert_eq!(order, vec![9, 1, 4]);
    }

    #[test]
    fn forget_display_removes_without_touching_removed_flag() {
        let reg = Registry::new();
        reg.ensure_businfo(3);
        let display = reg.add_display(3, None);
        reg.forget_display(&display);
        assert!(!display.is_removed());
        assert!(reg.live_displays().is_empty());
    }
}
