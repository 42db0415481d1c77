//! Component A — Sysfs Probe.
//!
//! A pure-function snapshot of the kernel's DRM / I²C view. Nothing here
//! mutates the registry; it only reads `/sys/bus/i2c` and `/sys/class/drm`
//! and hands back plain data, the same way the teacher's `ddc::linux`
//! enumerator walked `udev::Enumerator` without touching any shared state.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::busset::BusSet;
use crate::core::types::{ConnectorRecord, ConnectorStatus};

const SYSFS_I2C_DEVICES: &str = "/sys/bus/i2c/devices";
const SYSFS_DRM_CLASS: &str = "/sys/class/drm";

/// Names stolen from ddcutil's `ignorable_i2c_device_sysfs_name`, kept
/// verbatim from the teacher's `ddc::linux::ignore_device_by_name` and
/// extended with the entries spec §4.A names that the teacher's list
/// didn't carry yet (`Synopsys DesignWare`, `AMDGPU SMU`).
const IGNORE_NAME_PREFIXES: &[&str] = &[
    "SMBus",
    "Synopsys DesignWare",
    "soc:i2cdsi",
    "smu",
    "mac-io",
    "u4",
    "AMDGPU SMU",
];

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn ignore_by_name(name: &str) -> bool {
    IGNORE_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn driver_of(busno: i32) -> Option<String> {
    driver_of_at(Path::new(SYSFS_I2C_DEVICES), busno)
}

fn driver_of_at(i2c_root: &Path, busno: i32) -> Option<String> {
    let link = i2c_root.join(format!("i2c-{busno}")).join("device/driver");
    fs::read_link(&link)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
}

fn pci_class_of_at(i2c_root: &Path, busno: i32) -> Option<String> {
    // Walk `device` symlinks until we reach a PCI node exposing `class`.
    let mut dir = i2c_root.join(format!("i2c-{busno}"));
    for _ in 0..8 {
        let device = dir.join("device");
        if !device.exists() {
            break;
        }
        if let Some(class) = read_trimmed(&device.join("class")) {
            return Some(class);
        }
        dir = device;
    }
    None
}

/// Docking-station monitors sometimes enumerate as two `/dev/i2c-N`
/// devices for the same physical port; only one is live. Workaround
/// carried over from the teacher's `ddc::linux::is_phantom_ddc_device`.
fn is_phantom_at(i2c_root: &Path, busno: i32) -> bool {
    let device_path = i2c_root.join(format!("i2c-{busno}"));
    if !device_path.exists() {
        return true;
    }
    let enabled = read_trimmed(&device_path.join("device/enabled"));
    let status = read_trimmed(&device_path.join("device/status"));
    matches!(enabled.as_deref(), Some("disabled")) && matches!(status.as_deref(), Some("disconnected"))
}

/// Returns the set of every non-ignorable `/dev/i2c-N` currently present
/// (spec §4.A `list_attached_buses`).
pub fn list_attached_buses() -> BusSet {
    list_attached_buses_at(Path::new(SYSFS_I2C_DEVICES))
}

fn list_attached_buses_at(i2c_root: &Path) -> BusSet {
    let mut set = BusSet::new();
    let entries = match fs::read_dir(i2c_root) {
        Ok(entries) => entries,
        Err(_) => return set,
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(busno_str) = name.strip_prefix("i2c-") else {
            continue;
        };
        let Ok(busno) = busno_str.parse::<i32>() else {
            continue;
        };

        let sysfs_name = read_trimmed(&entry.path().join("name")).unwrap_or_default();
        if sysfs_name.is_empty() {
            continue;
        }
        if ignore_by_name(&sysfs_name) {
            continue;
        }

        let driver = driver_of_at(i2c_root, busno);
        if driver.as_deref() == Some("nouveau") && !sysfs_name.starts_with("nvkm-") {
            continue;
        }

        match pci_class_of_at(i2c_root, busno) {
            Some(class) => {
                let class = class.trim_start_matches("0x");
                let is_display = class.starts_with("03");
                let is_docking = class.starts_with("0a") || class.starts_with("0A");
                if !is_display && !is_docking {
                    continue;
                }
            }
            None => continue,
        }

        if is_phantom_at(i2c_root, busno) {
            continue;
        }

        set.insert(busno);
    }

    set
}

/// Fixed total order over connector types, per spec §4.A.1.
fn connector_type_rank(ty: &str) -> u32 {
    match ty {
        "eDP" => 0,
        "LVDS" => 1,
        "DP" => 2,
        "HDMI-A" => 3,
        "HDMI-B" => 4,
        "DVI-D" => 5,
        "DVI-I" => 6,
        "DVI-A" => 7,
        "VGA" => 8,
        "TV" => 9,
        "Virtual" => 10,
        _ => 11,
    }
}

/// Parses `cardN-<TYPE>-<M>` into (card, type, suffix).
fn parse_connector_name(name: &str) -> Option<(u32, String, u32)> {
    let rest = name.strip_prefix("card")?;
    let (card_str, rest) = rest.split_once('-')?;
    let card: u32 = card_str.parse().ok()?;
    let (ty, suffix_str) = rest.rsplit_once('-')?;
    let suffix: u32 = suffix_str.parse().ok()?;
    Some((card, ty.to_string(), suffix))
}

fn connector_cmp(a: &ConnectorRecord, b: &ConnectorRecord) -> Ordering {
    let pa = parse_connector_name(&a.connector_name);
    let pb = parse_connector_name(&b.connector_name);
    match (pa, pb) {
        (Some((card_a, ty_a, suf_a)), Some((card_b, ty_b, suf_b))) => card_a
            .cmp(&card_b)
            .then_with(|| connector_type_rank(&ty_a).cmp(&connector_type_rank(&ty_b)))
            .then_with(|| suf_a.cmp(&suf_b)),
        _ => a.connector_name.cmp(&b.connector_name),
    }
}

fn bus_number_from_i2c_dir(dir: &Path) -> Option<i32> {
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix("i2c-") {
            if let Ok(n) = suffix.parse::<i32>() {
                return Some(n);
            }
        }
    }
    None
}

/// Bus number extraction for a connector (spec §4.A.2).
fn extract_busno(connector_dir: &Path, is_dp: bool) -> i32 {
    if is_dp {
        // DP connectors: i2c-N/, then ddc/i2c-dev/, then drm_dp_aux*/.
        if let Some(n) = bus_number_from_i2c_dir(connector_dir) {
            return n;
        }
        let ddc_i2c_dev = connector_dir.join("ddc/i2c-dev");
        if let Some(n) = bus_number_from_i2c_dir(&ddc_i2c_dev) {
            return n;
        }
        if let Ok(entries) = fs::read_dir(connector_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("drm_dp_aux") {
                    if let Some(n) = bus_number_from_i2c_dir(&entry.path()) {
                        return n;
                    }
                }
            }
        }
        -1
    } else {
        let ddc_i2c_dev = connector_dir.join("ddc/i2c-dev");
        bus_number_from_i2c_dir(&ddc_i2c_dev).unwrap_or(-1)
    }
}

fn read_edid_attr(connector_dir: &Path) -> Option<Vec<u8>> {
    let bytes = fs::read(connector_dir.join("edid")).ok()?;
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

/// Produces an ordered list of [`ConnectorRecord`]s (spec §4.A
/// `scan_connectors`). Idempotent at rest: two calls with no kernel change
/// yield byte-identical output (spec §8.2), since the only inputs are
/// sysfs reads with no side effects.
pub fn scan_connectors() -> Vec<ConnectorRecord> {
    scan_connectors_at(Path::new(SYSFS_DRM_CLASS))
}

fn scan_connectors_at(drm_root: &Path) -> Vec<ConnectorRecord> {
    let mut records = Vec::new();
    let entries = match fs::read_dir(drm_root) {
        Ok(entries) => entries,
        Err(_) => return records,
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let connector_name = file_name.to_string_lossy().into_owned();
        if !connector_name.starts_with("card") || !connector_name.contains('-') {
            continue;
        }
        let Some((_, ty, _)) = parse_connector_name(&connector_name) else {
            continue;
        };
        let is_dp = ty == "DP";

        let path = entry.path();
        let connector_id = match read_trimmed(&path.join("connector_id")) {
            Some(s) => match s.parse::<i32>() {
                Ok(n) => n,
                Err(_) => continue,
            },
            None => continue,
        };

        let status = match read_trimmed(&path.join("status")).as_deref() {
            Some("connected") => ConnectorStatus::Connected,
            Some("disconnected") => ConnectorStatus::Disconnected,
            _ => ConnectorStatus::Unknown,
        };
        let enabled = matches!(read_trimmed(&path.join("enabled")).as_deref(), Some("enabled"));
        let edid_bytes = read_edid_attr(&path);
        let i2c_busno = extract_busno(&path, is_dp);

        records.push(ConnectorRecord {
            connector_name,
            connector_id,
            i2c_busno,
            base_busno: i2c_busno,
            edid_bytes,
            status,
            enabled,
            is_dp,
        });
    }

    records.sort_by(connector_cmp);
    records
}

/// Bus numbers whose connector currently reports a usable EDID (spec §4.A
/// `buses_having_edid`).
pub fn buses_having_edid(connectors: &[ConnectorRecord]) -> BusSet {
    connectors
        .iter()
        .filter(|c| c.i2c_busno >= 0 && c.has_usable_edid())
        .map(|c| c.i2c_busno)
        .collect()
}

pub fn connector_for_busno<'a>(
    connectors: &'a [ConnectorRecord],
    busno: i32,
) -> Option<&'a ConnectorRecord> {
    connectors.iter().find(|c| c.i2c_busno == busno)
}

pub fn connector_for_id<'a>(
    connectors: &'a [ConnectorRecord],
    id: i32,
) -> Option<&'a ConnectorRecord> {
    connectors.iter().find(|c| c.connector_id == id)
}

pub fn connector_for_edid<'a>(
    connectors: &'a [ConnectorRecord],
    bytes: &[u8],
) -> Option<&'a ConnectorRecord> {
    let n = bytes.len().min(128);
    connectors.iter().find(|c| {
        c.edid_bytes
            .as_ref()
            .is_some_and(|e| e.len() >= n && e[..n] == bytes[..n])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A scratch directory under the system temp dir, removed on drop, for
    /// driving the `_at`-suffixed sysfs readers against a fixture instead
    /// of the real `/sys` tree.
    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "libmonitor-sysfs-test-{}-{}",
                std::process::id(),
                n
            ));
            fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    /// Builds a 128-byte EDID whose manufacturer id decodes to `"ACI"`
    /// (vendor bytes `0x04, 0x69`, the classic Ancor Communications code —
    /// spec §8.4 scenario 1 names the manufacturer but not exact bytes).
    /// All four descriptor blocks are left zeroed, which this parser reads
    /// back as `Descriptor::Unknown`; only the header is under test here.
    fn synthetic_edid_bytes() -> [u8; 128] {
        let mut bytes = [0u8; 128];
        bytes[0..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        bytes[8] = 0x04;
        bytes[9] = 0x69;
        bytes[10] = 0x01; // product (low byte)
        bytes[11] = 0x00;
        bytes[16] = 1; // week
        bytes[17] = 30; // year offset from 1990
        bytes[18] = 1; // version
        bytes[19] = 3; // revision
        bytes[20] = 0x80; // digital input
        bytes[21] = 34; // width cm
        bytes[22] = 19; // height cm
        let sum: u8 = bytes[..127].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes[127] = (0u8).wrapping_sub(sum);
        bytes
    }

    #[test]
    fn cold_start_one_bus_is_discovered_and_its_edid_identifies_the_manufacturer() {
        let i2c_root = TempDir::new();
        let drm_root = TempDir::new();

        let bus_dir = i2c_root.path().join("i2c-6");
        let device_dir = bus_dir.join("device");
        fs::create_dir_all(&device_dir).unwrap();
        fs::write(bus_dir.join("name"), "AMDGPU DM i2c hw bus 6\n").unwrap();
        fs::write(device_dir.join("class"), "0x030000\n").unwrap();

        let connector_dir = drm_root.path().join("card0-HDMI-A-1");
        let ddc_i2c_dev = connector_dir.join("ddc/i2c-dev/i2c-6");
        fs::create_dir_all(&ddc_i2c_dev).unwrap();
        fs::write(connector_dir.join("connector_id"), "10").unwrap();
        fs::write(connector_dir.join("status"), "connected\n").unwrap();
        fs::write(connector_dir.join("enabled"), "enabled\n").unwrap();
        let edid = synthetic_edid_bytes();
        fs::write(connector_dir.join("edid"), edid).unwrap();

        let buses = list_attached_buses_at(i2c_root.path());
        assert_eq!(buses.iter().collect::<Vec<_>>(), vec![6]);

        let connectors = scan_connectors_at(drm_root.path());
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0].connector_name, "card0-HDMI-A-1");
        assert_eq!(connectors[0].i2c_busno, 6);
        assert!(connectors[0].has_usable_edid());

        let having_edid = buses_having_edid(&connectors);
        assert_eq!(having_edid.iter().collect::<Vec<_>>(), vec![6]);

        let record = connector_for_busno(&connectors, 6).unwrap();
        let parsed = crate::core::types::EdidInfo::parse(record.edid_bytes.as_ref().unwrap()).unwrap();
        assert_eq!(parsed.mfg_id(), "ACI");
    }

    #[test]
    fn smbus_piix4_is_ignored_even_with_display_class() {
        assert!(ignore_by_name("SMBus PIIX4"));
    }

    #[test]
    fn connector_ordering_matches_fixed_type_order() {
        let mk = |name: &str| ConnectorRecord {
            connector_name: name.to_string(),
            connector_id: 0,
            i2c_busno: -1,
            base_busno: -1,
            edid_bytes: None,
            status: ConnectorStatus::Disconnected,
            enabled: false,
            is_dp: name.contains("-DP-"),
        };
        let mut records = vec![
            mk("card0-HDMI-A-1"),
            mk("card0-eDP-1"),
            mk("card0-DP-2"),
            mk("card0-DP-1"),
        ];
        records.sort_by(connector_cmp);
        let names: Vec<_> = records.iter().map(|r| r.connector_name.clone()).collect();
        assert_eq!(
            names,
            vec!["card0-eDP-1", "card0-DP-1", "card0-DP-2", "card0-HDMI-A-1"]
        );
    }

    #[test]
    fn connector_id_zero_is_not_a_sentinel() {
        let record = ConnectorRecord {
            connector_name: "card0-DP-1".into(),
            connector_id: 0,
            i2c_busno: 6,
            base_busno: 6,
            edid_bytes: Some(vec![0u8; 128]),
            status: ConnectorStatus::Connected,
            enabled: true,
            is_dp: true,
        };
        assert_eq!(record.connector_id, 0);
        assert!(record.has_usable_edid());
    }

    #[test]
    fn edid_127_bytes_is_not_usable_128_is() {
        let short = ConnectorRecord {
            edid_bytes: Some(vec![0u8; 127]),
            ..ConnectorRecord {
                connector_name: "x".into(),
                connector_id: 0,
                i2c_busno: 0,
                base_busno: 0,
                edid_bytes: None,
                status: ConnectorStatus::Connected,
                enabled: true,
                is_dp: false,
            }
        };
        assert!(!short.has_usable_edid());
    }
}
