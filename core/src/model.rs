//! In-memory descriptors for arrays and member disks.

use serde::{Deserialize, Serialize};

/// Sentinel for "resync finished" / "no recovery needed".
pub const MAX_SECTOR: u64 = u64::MAX;

/// Raid levels, kernel numbering.
pub mod level {
    pub const LINEAR: i32 = -1;
    pub const MULTIPATH: i32 = -4;
    pub const FAULTY: i32 = -5;
    pub const CONTAINER: i32 = -100;
    pub const UNSET: i32 = -2000;
}

/// `mdu_disk_info_t.state` bits.
pub mod disk_state {
    pub const FAULTY: u32 = 1 << 0;
    pub const ACTIVE: u32 = 1 << 1;
    pub const SYNC: u32 = 1 << 2;
    pub const REMOVED: u32 = 1 << 3;
    pub const WRITEMOSTLY: u32 = 1 << 9;
}

/// Per-device state bits as reported by the sysfs `state` attribute.
pub mod dev_state {
    pub const FAULTY: u32 = 1 << 0;
    pub const INSYNC: u32 = 1 << 1;
    pub const WRITE_MOSTLY: u32 = 1 << 2;
    pub const SPARE: u32 = 1 << 3;
    pub const BLOCKED: u32 = 1 << 4;
    pub const REMOVE: u32 = 1 << 31;
}

static LEVELS: &[(&str, i32)] = &[
    ("linear", level::LINEAR),
    ("multipath", level::MULTIPATH),
    ("faulty", level::FAULTY),
    ("container", level::CONTAINER),
    ("raid0", 0),
    ("raid1", 1),
    ("raid4", 4),
    ("raid5", 5),
    ("raid6", 6),
    ("raid10", 10),
];

pub fn level_name(level: i32) -> Option<&'static str> {
    LEVELS.iter().find(|(_, l)| *l == level).map(|(n, _)| *n)
}

pub fn level_from_name(name: &str) -> Option<i32> {
    let name = name.trim();
    if let Some(l) = LEVELS.iter().find(|(n, _)| *n == name) {
        return Some(l.1);
    }
    // accept bare numbers and the "0"/"1"/... shorthand
    name.parse::<i32>().ok().filter(|l| matches!(l, 0 | 1 | 4 | 5 | 6 | 10))
}

static R5_LAYOUTS: &[(&str, i32)] = &[
    ("left-asymmetric", 0),
    ("right-asymmetric", 1),
    ("left-symmetric", 2),
    ("right-symmetric", 3),
    ("parity-first", 4),
    ("parity-last", 5),
];

pub fn r5layout_name(layout: i32) -> Option<&'static str> {
    R5_LAYOUTS.iter().find(|(_, l)| *l == layout).map(|(n, _)| *n)
}

pub fn r5layout_from_name(name: &str) -> Option<i32> {
    R5_LAYOUTS.iter().find(|(n, _)| *n == name.trim()).map(|(_, l)| *l)
}

/// Array-wide parameters, the identity part of a superblock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrayInfo {
    pub level: i32,
    pub raid_disks: i32,
    pub layout: i32,
    /// bytes
    pub chunk_size: i32,
    pub md_minor: i32,
    pub major_version: i32,
    pub minor_version: i32,
    pub patch_version: i32,
    pub ctime: u64,
    pub utime: u64,
    pub clean: bool,
    pub active_disks: i32,
    pub working_disks: i32,
    pub failed_disks: i32,
    pub spare_disks: i32,
    pub nr_disks: i32,
}

/// Identity of one member disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub number: i32,
    pub major: u32,
    pub minor: u32,
    pub raid_disk: i32,
    pub state: u32,
}

/// One member device as seen through sysfs.
#[derive(Debug, Clone, Default)]
pub struct MdDev {
    pub disk: DiskInfo,
    /// "dev-sda1" style name under `/sys/block/mdX/md/`
    pub sys_name: String,
    /// sectors
    pub data_offset: u64,
    /// sectors
    pub component_size: u64,
    pub recovery_start: u64,
    pub errors: u64,
    pub curr_state: u32,
    pub prev_state: u32,
    pub next_state: u32,
}

/// The in-memory array descriptor.
///
/// `sys_name` (e.g. "md127") is the key used to build sysfs paths;
/// `text_version` is either a metadata version ("1.2"), an external
/// designation ("external:imsm"), or a subarray reference ("/md127/0").
#[derive(Debug, Clone, Default)]
pub struct MdInfo {
    pub array: ArrayInfo,
    pub disk: DiskInfo,
    pub uuid: [u8; 16],
    pub name: String,
    pub events: u64,
    /// sectors
    pub component_size: u64,
    /// sectors; 0 means "kernel default"
    pub custom_array_size: u64,
    /// sectors
    pub data_offset: u64,
    pub resync_start: u64,
    pub recovery_start: u64,
    pub safe_mode_delay_ms: u64,
    pub cache_size: u64,
    pub mismatch_cnt: u64,
    /// 0 none, 1 file, otherwise sector offset from superblock
    pub bitmap_offset: i64,
    pub reshape_active: bool,
    pub reshape_progress: u64,
    pub new_level: i32,
    pub delta_disks: i32,
    pub new_layout: i32,
    pub new_chunk: i32,
    pub text_version: String,
    pub sys_name: String,
    pub devs: Vec<MdDev>,
}

impl MdInfo {
    pub fn is_external(&self) -> bool {
        self.array.major_version == -1 && self.array.minor_version == -2
    }

    pub fn is_container(&self) -> bool {
        self.array.level == level::CONTAINER
    }

    pub fn uuid_hex(&self) -> String {
        uuid_text(&self.uuid)
    }

    pub fn spare_count(&self) -> usize {
        self.devs
            .iter()
            .filter(|d| d.disk.state & (disk_state::SYNC | disk_state::FAULTY) == 0)
            .count()
    }
}

/// `aaaaaaaa:bbbbbbbb:cccccccc:dddddddd` form used in map files and output.
pub fn uuid_text(uuid: &[u8; 16]) -> String {
    let mut words = [0u32; 4];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_be_bytes(uuid[i * 4..i * 4 + 4].try_into().unwrap());
    }
    format!("{:08x}:{:08x}:{:08x}:{:08x}", words[0], words[1], words[2], words[3])
}

pub fn uuid_from_text(s: &str) -> Option<[u8; 16]> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut uuid = [0u8; 16];
    for (i, p) in parts.iter().enumerate() {
        let w = u32::from_str_radix(p, 16).ok()?;
        uuid[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
    }
    Some(uuid)
}

/// How many failed members a level can survive, and therefore whether
/// `avail` (a bool per slot) is enough to start the array.
pub fn enough(level: i32, raid_disks: i32, layout: i32, clean: bool, avail: &[bool]) -> bool {
    let present = avail.iter().filter(|a| **a).count() as i32;
    match level {
        10 => {
            // near-copies in the low byte; each set of `copies` adjacent
            // slots needs at least one member present
            let copies = layout & 0xff;
            if copies < 1 {
                return false;
            }
            let mut first = 0;
            while first < raid_disks {
                let set = (first..(first + copies).min(raid_disks))
                    .any(|i| avail.get(i as usize).copied().unwrap_or(false));
                if !set {
                    return false;
                }
                first += copies;
            }
            true
        }
        level::LINEAR | level::MULTIPATH | 0 => present == raid_disks,
        1 => present >= 1,
        4 | 5 => {
            if clean {
                present >= raid_disks - 1
            } else {
                present >= raid_disks
            }
        }
        6 => {
            if clean {
                present >= raid_disks - 2
            } else {
                present >= raid_disks
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_round_trip() {
        assert_eq!(level_name(5), Some("raid5"));
        assert_eq!(level_from_name("raid5"), Some(5));
        assert_eq!(level_from_name("5"), Some(5));
        assert_eq!(level_name(level::CONTAINER), Some("container"));
    }

    #[test]
    fn uuid_text_round_trip() {
        let uuid: [u8; 16] = *b"0123456789abcdef";
        let s = uuid_text(&uuid);
        assert_eq!(uuid_from_text(&s), Some(uuid));
        assert_eq!(s.len(), 35);
    }

    #[test]
    fn quorum_rules() {
        // raid5 of 3, clean: 2 of 3 is enough, 1 is not
        assert!(enough(5, 3, 2, true, &[true, true, false]));
        assert!(!enough(5, 3, 2, true, &[true, false, false]));
        // dirty raid5 needs all members
        assert!(!enough(5, 3, 2, false, &[true, true, false]));
        // raid6 clean survives two failures
        assert!(enough(6, 4, 2, true, &[true, false, true, false]));
        // raid0 never survives a failure
        assert!(!enough(0, 2, 0, true, &[true, false]));
        // raid1 survives to the last disk
        assert!(enough(1, 2, 0, true, &[false, true]));
    }

    #[test]
    fn raid10_near_copies() {
        // n2 layout on 4 disks: pairs (0,1) and (2,3)
        assert!(enough(10, 4, 0x102, true, &[true, false, false, true]));
        assert!(!enough(10, 4, 0x102, true, &[true, true, false, false]));
    }
}
