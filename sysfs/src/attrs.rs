//! Typed access to `/sys/block/<sys_name>/md/...`.
//!
//! Reads come back as text with exactly one trailing newline trimmed;
//! numeric readers reject trailing garbage. Writes go out without an
//! implicit newline. Frequently-polled attributes keep a persistent fd and
//! are waited on with poll(2) (sysfs change notification arrives as an
//! exceptional condition).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mdctl_core::model::{dev_state, disk_state, level, level_name};
use mdctl_core::{MdDev, MdError, MdInfo, Result};
use nix::poll::{poll, PollFd, PollFlags};

/// Bulk-read options for [`SysArray::read_info`].
pub mod get {
    pub const VERSION: u32 = 1 << 0;
    pub const LEVEL: u32 = 1 << 1;
    pub const LAYOUT: u32 = 1 << 2;
    pub const DISKS: u32 = 1 << 3;
    pub const DEGRADED: u32 = 1 << 4;
    pub const COMPONENT: u32 = 1 << 5;
    pub const CHUNK: u32 = 1 << 6;
    pub const CACHE: u32 = 1 << 7;
    pub const MISMATCH: u32 = 1 << 8;
    pub const SAFEMODE: u32 = 1 << 9;
    pub const BITMAP_LOCATION: u32 = 1 << 10;
    pub const DEVS: u32 = 1 << 11;
    pub const OFFSET: u32 = 1 << 12;
    pub const SIZE: u32 = 1 << 13;
    pub const STATE: u32 = 1 << 14;
    pub const ERROR: u32 = 1 << 15;

    pub const ALL: u32 = !0;
}

#[derive(Debug, Clone)]
pub struct SysArray {
    base: PathBuf,
    pub sys_name: String,
}

impl SysArray {
    pub fn new(sys_name: &str) -> Self {
        SysArray { base: PathBuf::from("/sys/block"), sys_name: sys_name.to_string() }
    }

    pub fn from_info(info: &MdInfo) -> Self {
        Self::new(&info.sys_name)
    }

    /// A sysfs tree rooted elsewhere; used by tests.
    pub fn at(base: &Path, sys_name: &str) -> Self {
        SysArray { base: base.to_path_buf(), sys_name: sys_name.to_string() }
    }

    pub fn attr_path(&self, dev: Option<&str>, attr: &str) -> PathBuf {
        let mut p = self.base.join(&self.sys_name).join("md");
        if let Some(dev) = dev {
            p.push(dev);
        }
        p.push(attr);
        p
    }

    pub fn attribute_available(&self, dev: Option<&str>, attr: &str) -> bool {
        self.attr_path(dev, attr).exists()
    }

    pub fn read_attr(&self, dev: Option<&str>, attr: &str) -> Result<String> {
        let path = self.attr_path(dev, attr);
        let mut buf = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut buf))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MdError::KernelUnsupported("sysfs attribute"),
                _ => MdError::Io(e),
            })?;
        if buf.ends_with('\n') {
            buf.pop();
        }
        Ok(buf)
    }

    pub fn read_u64(&self, dev: Option<&str>, attr: &str) -> Result<u64> {
        let s = self.read_attr(dev, attr)?;
        parse_u64(&s)
    }

    pub fn read_i64(&self, dev: Option<&str>, attr: &str) -> Result<i64> {
        let s = self.read_attr(dev, attr)?;
        let t = s.split_whitespace().next().unwrap_or("");
        t.parse::<i64>()
            .map_err(|_| MdError::IncompatibleMetadata(format!("bad sysfs number '{}'", s)))
    }

    pub fn write_attr(&self, dev: Option<&str>, attr: &str, val: &str) -> Result<()> {
        let path = self.attr_path(dev, attr);
        // O_TRUNC is a no-op on sysfs and keeps regular-file stand-ins honest
        let mut f = OpenOptions::new().write(true).truncate(true).open(&path).map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::NotFound => MdError::KernelUnsupported("sysfs attribute"),
                std::io::ErrorKind::PermissionDenied => {
                    MdError::PermissionDenied(path.display().to_string())
                }
                _ => MdError::Io(e),
            }
        })?;
        f.write_all(val.as_bytes()).map_err(|e| {
            if e.raw_os_error() == Some(nix::libc::EBUSY) {
                MdError::Busy(path.display().to_string())
            } else {
                MdError::Io(e)
            }
        })
    }

    pub fn write_num(&self, dev: Option<&str>, attr: &str, val: u64) -> Result<()> {
        self.write_attr(dev, attr, &val.to_string())
    }

    /// Persistent fd for a polled attribute.
    pub fn open_attr(&self, dev: Option<&str>, attr: &str) -> Result<File> {
        let path = self.attr_path(dev, attr);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|_| File::open(&path))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MdError::KernelUnsupported("sysfs attribute"),
                _ => MdError::Io(e),
            })
    }

    /// Snapshot the array (and optionally its members) into an `MdInfo`.
    pub fn read_info(&self, options: u32) -> Result<MdInfo> {
        let mut info = MdInfo { sys_name: self.sys_name.clone(), ..Default::default() };
        if options & get::VERSION != 0 {
            let v = self.read_attr(None, "metadata_version")?;
            if v == "none" {
                info.array.major_version = -1;
                info.array.minor_version = -1;
            } else if let Some(ext) = v.strip_prefix("external:") {
                info.array.major_version = -1;
                info.array.minor_version = -2;
                info.text_version = ext.to_string();
            } else {
                let mut it = v.splitn(2, '.');
                info.array.major_version =
                    it.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
                info.array.minor_version =
                    it.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
                info.text_version = v;
            }
        }
        if options & get::LEVEL != 0 {
            let lv = self.read_attr(None, "level")?;
            info.array.level =
                mdctl_core::model::level_from_name(&lv).unwrap_or(level::UNSET);
        }
        if options & get::LAYOUT != 0 {
            info.array.layout = self.read_u64(None, "layout")? as i32;
        }
        if options & get::DISKS != 0 {
            info.array.raid_disks = self.read_u64(None, "raid_disks")? as i32;
        }
        if options & get::DEGRADED != 0 {
            info.array.failed_disks = self.read_u64(None, "degraded").unwrap_or(0) as i32;
        }
        if options & get::COMPONENT != 0 {
            // sysfs reports KiB, the model keeps sectors
            info.component_size = self.read_u64(None, "component_size")? * 2;
        }
        if options & get::CHUNK != 0 {
            info.array.chunk_size = self.read_u64(None, "chunk_size")? as i32;
        }
        if options & get::CACHE != 0 {
            info.cache_size = self.read_u64(None, "stripe_cache_size").unwrap_or(0);
        }
        if options & get::MISMATCH != 0 {
            info.mismatch_cnt = self.read_u64(None, "mismatch_cnt").unwrap_or(0);
        }
        if options & get::SAFEMODE != 0 {
            let s = self.read_attr(None, "safe_mode_delay")?;
            info.safe_mode_delay_ms = parse_safe_mode_delay(&s)?;
        }
        if options & get::BITMAP_LOCATION != 0 {
            let s = self.read_attr(None, "bitmap/location")?;
            info.bitmap_offset = if s.starts_with("file") {
                1
            } else if s.starts_with("none") {
                0
            } else if let Some(off) = s.strip_prefix('+') {
                parse_u64(off)? as i64
            } else if s.starts_with('-') {
                s.parse::<i64>()
                    .map_err(|_| MdError::IncompatibleMetadata(format!("bad bitmap location '{}'", s)))?
            } else {
                return Err(MdError::IncompatibleMetadata(format!(
                    "bad bitmap location '{}'",
                    s
                )));
            };
        }
        if options & get::DEVS == 0 {
            return Ok(info);
        }
        let md_dir = self.base.join(&self.sys_name).join("md");
        let entries = std::fs::read_dir(&md_dir).map_err(MdError::Io)?;
        info.array.spare_disks = 0;
        for ent in entries.flatten() {
            let name = ent.file_name().to_string_lossy().into_owned();
            if !name.starts_with("dev-") {
                continue;
            }
            let mut dev = MdDev { sys_name: name.clone(), ..Default::default() };
            match self.read_attr(Some(name.as_str()), "slot") {
                Ok(s) => dev.disk.raid_disk = s.parse().unwrap_or(-1),
                // unreadable slot: the device is on its way out
                Err(_) => continue,
            }
            let Ok(bd) = self.read_attr(Some(name.as_str()), "block/dev") else { continue };
            let mut it = bd.splitn(2, ':');
            dev.disk.major = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            dev.disk.minor = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            if let Ok(s) = self.read_attr(Some(name.as_str()), "block/device/state") {
                if s.starts_with("offline") {
                    continue;
                }
            }
            if options & get::OFFSET != 0 {
                dev.data_offset = self.read_u64(Some(name.as_str()), "offset")?;
            }
            if options & get::SIZE != 0 {
                dev.component_size = self.read_u64(Some(name.as_str()), "size")? * 2;
            }
            if options & get::STATE != 0 {
                let s = self.read_attr(Some(name.as_str()), "state")?;
                dev.curr_state = parse_dev_state(&s);
                if dev.curr_state & dev_state::INSYNC != 0 {
                    dev.disk.state |= disk_state::ACTIVE | disk_state::SYNC;
                }
                if dev.curr_state & dev_state::FAULTY != 0 {
                    dev.disk.state |= disk_state::FAULTY;
                }
                if dev.disk.state == 0 {
                    info.array.spare_disks += 1;
                }
            }
            if options & get::ERROR != 0 {
                dev.errors = self.read_u64(Some(name.as_str()), "errors").unwrap_or(0);
            }
            info.devs.push(dev);
        }
        Ok(info)
    }

    /// Materialise an in-memory description into sysfs for bring-up.
    pub fn set_array(&self, info: &MdInfo) -> Result<()> {
        if info.is_external() {
            let ver = format!("external:{}", info.text_version);
            // preserve a readonly '-' flag the monitor may have set
            let cur = self.read_attr(None, "metadata_version").unwrap_or_default();
            let ver = if cur.len() > 9 && cur.as_bytes().get(9) == Some(&b'-') {
                let mut v = ver.into_bytes();
                v[9] = b'-';
                String::from_utf8(v).unwrap()
            } else {
                ver
            };
            self.write_attr(None, "metadata_version", &ver)?;
        }
        if info.array.level < 0 {
            return Ok(());
        }
        self.write_attr(
            None,
            "level",
            level_name(info.array.level).unwrap_or("unknown"),
        )?;
        let mut raid_disks = info.array.raid_disks;
        if info.reshape_active {
            raid_disks -= info.delta_disks;
        }
        self.write_num(None, "raid_disks", raid_disks as u64)?;
        self.write_num(None, "chunk_size", info.array.chunk_size as u64)?;
        self.write_num(None, "layout", info.array.layout as u64)?;
        self.write_num(None, "component_size", info.component_size / 2)?;
        if info.custom_array_size != 0 {
            match self.write_num(None, "array_size", info.custom_array_size / 2) {
                Err(MdError::KernelUnsupported(_)) => {
                    log::warn!("kernel has no md/array_size; the array may be larger than expected")
                }
                other => other?,
            }
        }
        if info.array.level > 0 {
            self.write_num(None, "resync_start", info.resync_start)?;
        }
        if info.reshape_active {
            self.write_num(None, "reshape_position", info.reshape_progress)?;
            self.write_num(None, "chunk_size", info.new_chunk as u64)?;
            self.write_num(None, "layout", info.new_layout as u64)?;
            self.write_num(None, "raid_disks", info.array.raid_disks as u64)?;
        }
        Ok(())
    }

    /// Hot-add one member: `new_dev`, then per-slot attributes.
    pub fn add_disk(&self, sd: &mut MdDev, container: bool, resume: bool) -> Result<()> {
        self.write_attr(
            None,
            "new_dev",
            &format!("{}:{}", sd.disk.major, sd.disk.minor),
        )?;
        let link = format!("/sys/dev/block/{}:{}", sd.disk.major, sd.disk.minor);
        let target = std::fs::read_link(&link).map_err(MdError::Io)?;
        let dname = target
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| MdError::NoDevice(link.clone()))?;
        sd.sys_name = format!("dev-{}", dname);

        if resume && sd.recovery_start < mdctl_core::model::MAX_SECTOR {
            // probe whether the kernel honours recovery_start
            if self.write_num(Some(sd.sys_name.as_str()), "recovery_start", 0).is_err() {
                let _ = self.write_attr(Some(sd.sys_name.as_str()), "state", "remove");
                return Err(MdError::KernelUnsupported("recovery_start"));
            }
        }
        self.write_num(Some(sd.sys_name.as_str()), "offset", sd.data_offset)?;
        self.write_num(Some(sd.sys_name.as_str()), "size", (sd.component_size + 1) / 2)?;
        if !container {
            if sd.recovery_start == mdctl_core::model::MAX_SECTOR {
                // may fail when the array is not started yet
                let _ = self.write_attr(Some(sd.sys_name.as_str()), "state", "insync");
            }
            if sd.disk.raid_disk >= 0 {
                self.write_num(Some(sd.sys_name.as_str()), "slot", sd.disk.raid_disk as u64)?;
            }
            if resume {
                let _ = self.write_num(Some(sd.sys_name.as_str()), "recovery_start", sd.recovery_start);
            }
        }
        Ok(())
    }

    /// Freeze resync/rebuild: 1 worked, 0 kernel lacks support, -1 busy.
    pub fn freeze(&self) -> i32 {
        let Ok(action) = self.read_attr(None, "sync_action") else {
            return 0;
        };
        if action != "idle" && action != "frozen" {
            return -1;
        }
        match self.write_attr(None, "sync_action", "frozen") {
            Ok(()) => 1,
            Err(_) => 0,
        }
    }

    /// Container freeze treats a missing `sync_action` as already frozen.
    pub fn freeze_container(&self) -> i32 {
        if !self.attribute_available(None, "sync_action") {
            return 1;
        }
        match self.read_attr(None, "sync_action").as_deref() {
            Ok("frozen") => 0,
            Ok("idle") => match self.write_attr(None, "sync_action", "frozen") {
                Ok(()) => 1,
                Err(_) => 0,
            },
            Ok(_) => -1,
            Err(_) => 0,
        }
    }

    pub fn unfreeze(&self, frozen: i32) {
        if frozen > 0 {
            let _ = self.write_attr(None, "sync_action", "idle");
        }
    }

    /// Block until `sync_action` no longer reports a reshape.
    pub fn wait_reshape(&self) -> Result<()> {
        let fd = self.open_attr(None, "sync_action")?;
        loop {
            let action = fd_read_string(&fd)?;
            if !action.starts_with("reshape") {
                return Ok(());
            }
            wait_attr_change(&fd, -1)?;
        }
    }

    pub fn suspend_window(&self, lo: u64, hi: u64) -> Result<()> {
        self.write_num(None, "suspend_hi", hi)?;
        self.write_num(None, "suspend_lo", lo)
    }

    pub fn set_safe_mode_delay(&self, ms: u64) -> Result<()> {
        self.write_attr(
            None,
            "safe_mode_delay",
            &format!("{}.{:03}\n", ms / 1000, ms % 1000),
        )
    }

    pub fn uevent(&self, event: &str) -> Result<()> {
        let path = self.base.join(&self.sys_name).join("uevent");
        std::fs::write(path, event).map_err(MdError::Io)
    }
}

/// Re-read a persistent attribute fd from the start.
pub fn fd_read_string(mut fd: &File) -> Result<String> {
    fd.seek(SeekFrom::Start(0))?;
    let mut buf = String::new();
    fd.read_to_string(&mut buf)?;
    if buf.ends_with('\n') {
        buf.pop();
    }
    Ok(buf)
}

pub fn fd_read_u64(fd: &File) -> Result<u64> {
    parse_u64(&fd_read_string(fd)?)
}

/// Wait for a sysfs change notification on an attribute fd.
/// `timeout_ms` < 0 blocks forever. Returns false on timeout.
pub fn wait_attr_change(fd: &File, timeout_ms: i32) -> Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLPRI | PollFlags::POLLERR)];
    let n = poll(&mut fds, timeout_ms)?;
    Ok(n > 0)
}

fn parse_u64(s: &str) -> Result<u64> {
    // "max" shows up in sync_completed; map it to the sentinel
    let t = s.split_whitespace().next().unwrap_or("");
    if t == "max" || t == "none" {
        return Ok(mdctl_core::model::MAX_SECTOR);
    }
    // "123 / 456" style (sync_completed) takes the first number
    t.parse::<u64>()
        .map_err(|_| MdError::IncompatibleMetadata(format!("bad sysfs number '{}'", s)))
}

/// "12.345" seconds → milliseconds.
pub fn parse_safe_mode_delay(s: &str) -> Result<u64> {
    let (sec, frac) = s.split_once('.').unwrap_or((s, ""));
    let sec: u64 = sec
        .parse()
        .map_err(|_| MdError::IncompatibleMetadata(format!("bad safe_mode_delay '{}'", s)))?;
    let mut ms = 0u64;
    let mut scale = 100;
    for c in frac.chars().take(3) {
        let d = c
            .to_digit(10)
            .ok_or_else(|| MdError::IncompatibleMetadata(format!("bad safe_mode_delay '{}'", s)))?;
        ms += d as u64 * scale;
        scale /= 10;
    }
    Ok(sec * 1000 + ms)
}

pub fn parse_dev_state(s: &str) -> u32 {
    let mut state = 0;
    for word in s.split(',') {
        state |= match word.trim() {
            "faulty" => dev_state::FAULTY,
            "in_sync" => dev_state::INSYNC,
            "write_mostly" => dev_state::WRITE_MOSTLY,
            "spare" => dev_state::SPARE,
            "blocked" => dev_state::BLOCKED,
            _ => 0,
        };
    }
    state
}

/// Array states as written to and read from `array_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum ArrayState {
    Clear,
    Inactive,
    Suspended,
    Readonly,
    ReadAuto,
    Clean,
    Active,
    WritePending,
    ActiveIdle,
    Broken,
}

impl ArrayState {
    pub fn parse(s: &str) -> Option<ArrayState> {
        Some(match s.trim() {
            "clear" => ArrayState::Clear,
            "inactive" => ArrayState::Inactive,
            "suspended" => ArrayState::Suspended,
            "readonly" => ArrayState::Readonly,
            "read-auto" => ArrayState::ReadAuto,
            "clean" => ArrayState::Clean,
            "active" => ArrayState::Active,
            "write-pending" => ArrayState::WritePending,
            "active-idle" => ArrayState::ActiveIdle,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArrayState::Clear => "clear",
            ArrayState::Inactive => "inactive",
            ArrayState::Suspended => "suspended",
            ArrayState::Readonly => "readonly",
            ArrayState::ReadAuto => "read-auto",
            ArrayState::Clean => "clean",
            ArrayState::Active => "active",
            ArrayState::WritePending => "write-pending",
            ArrayState::ActiveIdle => "active-idle",
            ArrayState::Broken => "broken",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Idle,
    Reshape,
    Resync,
    Recover,
    Check,
    Repair,
    Frozen,
}

impl SyncAction {
    pub fn parse(s: &str) -> Option<SyncAction> {
        Some(match s.trim() {
            "idle" => SyncAction::Idle,
            "reshape" => SyncAction::Reshape,
            "resync" => SyncAction::Resync,
            "recover" => SyncAction::Recover,
            "check" => SyncAction::Check,
            "repair" => SyncAction::Repair,
            "frozen" => SyncAction::Frozen,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_md(dir: &Path, name: &str) -> SysArray {
        let md = dir.join(name).join("md");
        std::fs::create_dir_all(&md).unwrap();
        SysArray::at(dir, name)
    }

    fn set(sa: &SysArray, attr: &str, val: &str) {
        let p = sa.attr_path(None, attr);
        std::fs::write(p, val).unwrap();
    }

    #[test]
    fn read_trims_one_newline() {
        let dir = tempfile::tempdir().unwrap();
        let sa = fake_md(dir.path(), "md0");
        set(&sa, "level", "raid5\n");
        assert_eq!(sa.read_attr(None, "level").unwrap(), "raid5");
        set(&sa, "raid_disks", "3\n");
        assert_eq!(sa.read_u64(None, "raid_disks").unwrap(), 3);
        set(&sa, "raid_disks", "3x\n");
        assert!(sa.read_u64(None, "raid_disks").is_err());
    }

    #[test]
    fn missing_attribute_is_kernel_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let sa = fake_md(dir.path(), "md0");
        assert!(matches!(
            sa.read_attr(None, "sync_action"),
            Err(MdError::KernelUnsupported(_))
        ));
    }

    #[test]
    fn freeze_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let sa = fake_md(dir.path(), "md0");
        // attribute missing: old kernel
        assert_eq!(sa.freeze(), 0);
        // busy
        set(&sa, "sync_action", "resync\n");
        assert_eq!(sa.freeze(), -1);
        // idle: freezes and the attribute now reads frozen
        set(&sa, "sync_action", "idle\n");
        assert_eq!(sa.freeze(), 1);
        assert_eq!(sa.read_attr(None, "sync_action").unwrap(), "frozen");
        // unfreeze writes idle only after a successful freeze
        sa.unfreeze(1);
        assert_eq!(sa.read_attr(None, "sync_action").unwrap(), "idle");
        set(&sa, "sync_action", "resync\n");
        sa.unfreeze(0);
        assert_eq!(sa.read_attr(None, "sync_action").unwrap(), "resync");
    }

    #[test]
    fn safe_mode_delay_codec() {
        assert_eq!(parse_safe_mode_delay("0.203").unwrap(), 203);
        assert_eq!(parse_safe_mode_delay("5").unwrap(), 5000);
        assert_eq!(parse_safe_mode_delay("1.5").unwrap(), 1500);
        assert!(parse_safe_mode_delay("abc").is_err());
    }

    #[test]
    fn dev_state_bits() {
        assert_eq!(
            parse_dev_state("in_sync,write_mostly"),
            dev_state::INSYNC | dev_state::WRITE_MOSTLY
        );
        assert_eq!(parse_dev_state("faulty"), dev_state::FAULTY);
        assert_eq!(parse_dev_state(""), 0);
    }

    #[test]
    fn array_state_round_trip() {
        for s in ["clear", "inactive", "read-auto", "write-pending", "active-idle"] {
            assert_eq!(ArrayState::parse(s).unwrap().as_str(), s);
        }
        assert!(ArrayState::parse("bogus").is_none());
        assert!(ArrayState::Inactive < ArrayState::Readonly);
    }

    #[test]
    fn sync_completed_parses_max_and_fraction() {
        assert_eq!(parse_u64("max").unwrap(), mdctl_core::model::MAX_SECTOR);
        assert_eq!(parse_u64("1024 / 2048").unwrap(), 1024);
    }
}
