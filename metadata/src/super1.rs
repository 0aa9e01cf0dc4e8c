//! The v1.x superblock: a variable-size little-endian block whose placement
//! depends on the minor version (1.0 near the end of the device, 1.1 at the
//! start, 1.2 at 4K).

use std::any::Any;
use std::io::Write;

use mdctl_core::model::{disk_state, uuid_text, MAX_SECTOR};
use mdctl_core::{BlockDevice, DiskInfo, MdError, MdInfo, Result};
use static_assertions::const_assert_eq;

use crate::bitmap::{self, BitmapSuper};
use crate::checksum::sum_le_folded;
use crate::endian::{Le32, Le64, OnDisk};
use crate::super0::{fmt_time, now_secs};
use crate::{BitmapParams, CreateInfo, Family, Metadata, Update};

pub const MD_SB_MAGIC: u32 = 0xa92b4efc;
pub const MAX_SB_SIZE: usize = 4096;
pub const MAX_DEVS: usize = (MAX_SB_SIZE - 256) / 2;

pub const ROLE_SPARE: u16 = 0xffff;
pub const ROLE_FAULTY: u16 = 0xfffe;

/// feature_map bits
pub const FEATURE_BITMAP_OFFSET: u32 = 1;
pub const FEATURE_RECOVERY_OFFSET: u32 = 2;
pub const FEATURE_RESHAPE_ACTIVE: u32 = 4;

pub const WRITEMOSTLY1: u8 = 1;

/// The 256-byte fixed part. `dev_roles` follows on disk.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Sb1 {
    // constant array information - 128 bytes
    pub magic: Le32,
    pub major_version: Le32,
    pub feature_map: Le32,
    pub pad0: Le32,
    pub set_uuid: [u8; 16],
    pub set_name: [u8; 32],
    pub ctime: Le64,
    pub level: Le32,
    pub layout: Le32,
    /// used size of component devices, sectors
    pub size: Le64,
    /// sectors
    pub chunksize: Le32,
    pub raid_disks: Le32,
    pub bitmap_offset: Le32,
    pub new_level: Le32,
    pub reshape_position: Le64,
    pub delta_disks: Le32,
    pub new_layout: Le32,
    pub new_chunk: Le32,
    pub pad1: [u8; 4],
    // constant this-device information - 64 bytes
    pub data_offset: Le64,
    pub data_size: Le64,
    pub super_offset: Le64,
    pub recovery_offset: Le64,
    pub dev_number: Le32,
    pub cnt_corrected_read: Le32,
    pub device_uuid: [u8; 16],
    pub devflags: u8,
    pub pad2: [u8; 7],
    // array state information - 64 bytes
    pub utime: Le64,
    pub events: Le64,
    pub resync_offset: Le64,
    pub sb_csum: Le32,
    pub max_dev: Le32,
    pub pad3: [u8; 32],
}

const_assert_eq!(std::mem::size_of::<Sb1>(), 256);
unsafe impl OnDisk for Sb1 {}

impl Default for Sb1 {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

struct Loaded {
    sb: Sb1,
    /// host-order copies of the on-disk LE role words
    roles: Vec<u16>,
    /// device size at load time, for the `DeviceSize` update
    device_size: u64,
}

struct Pending {
    disk: DiskInfo,
    dev: Option<BlockDevice>,
}

pub struct Super1 {
    /// -1 = probe all placements
    minor: i32,
    state: Option<Loaded>,
    bitmap: Option<BitmapSuper>,
    pending: Vec<Pending>,
}

/// Placement of the superblock for a device of `dsize` sectors.
pub fn sb_offset_sectors(minor: i32, dsize: u64) -> u64 {
    match minor {
        0 => (dsize - 8 * 2) & !(4 * 2 - 1),
        1 => 0,
        _ => 4 * 2,
    }
}

/// Space reserved between superblock and data for a bitmap, in sectors.
fn choose_bm_space(devsize: u64) -> u64 {
    if devsize < 64 * 2 {
        return 0;
    }
    if devsize - 64 * 2 >= 200 * 1024 * 1024 * 2 {
        return 128 * 2;
    }
    if devsize - 4 * 2 > 8 * 1024 * 1024 * 2 {
        return 64 * 2;
    }
    4 * 2
}

fn set_name_str(name: &[u8; 32]) -> String {
    let end = name.iter().position(|&b| b == 0).unwrap_or(32);
    String::from_utf8_lossy(&name[..end]).into_owned()
}

fn name_with_host(name: &str, homehost: Option<&str>) -> [u8; 32] {
    let full = match homehost {
        Some(h) if !name.contains(':') && h.len() + 1 + name.len() < 32 => {
            format!("{}:{}", h, name)
        }
        _ => name.to_string(),
    };
    let mut out = [0u8; 32];
    let bytes = full.as_bytes();
    let n = bytes.len().min(31);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

impl Super1 {
    pub fn any_minor() -> Self {
        Super1 { minor: -1, state: None, bitmap: None, pending: Vec::new() }
    }

    pub fn with_minor(minor: i32) -> Self {
        Super1 { minor, state: None, bitmap: None, pending: Vec::new() }
    }

    fn loaded_ref(&self) -> Result<&Loaded> {
        self.state
            .as_ref()
            .ok_or(MdError::IncompatibleMetadata("no superblock loaded".into()))
    }

    fn loaded_mut(&mut self) -> Result<&mut Loaded> {
        self.state
            .as_mut()
            .ok_or(MdError::IncompatibleMetadata("no superblock loaded".into()))
    }

    /// Build the checksummed on-disk image (4096 bytes).
    fn image(&self) -> Result<Vec<u8>> {
        let st = self.loaded_ref()?;
        let mut buf = vec![0u8; MAX_SB_SIZE];
        buf[..256].copy_from_slice(st.sb.as_bytes());
        for (i, r) in st.roles.iter().enumerate().take(MAX_DEVS) {
            let off = 256 + i * 2;
            buf[off..off + 2].copy_from_slice(&r.to_le_bytes());
        }
        let max_dev = st.sb.max_dev.get() as usize;
        let csum_len = (256 + 2 * max_dev).min(MAX_SB_SIZE);
        // zero the checksum field during the sum
        buf[216..220].fill(0);
        let csum = sum_le_folded(&buf[..csum_len]);
        buf[216..220].copy_from_slice(&csum.to_le_bytes());
        Ok(buf)
    }

    fn load_minor(&mut self, dev: &mut BlockDevice, minor: i32) -> Result<Loaded> {
        let dsize = dev.size_sectors()?;
        if dsize < 24 {
            return Err(MdError::TooSmall(dsize));
        }
        let sb_offset = sb_offset_sectors(minor, dsize);
        dev.flush_cache();
        let mut buf = vec![0u8; MAX_SB_SIZE];
        dev.read_at(sb_offset * 512, &mut buf)?;
        let sb = Sb1::read_from(&buf).ok_or(MdError::NoMagic)?;
        if sb.magic.get() != MD_SB_MAGIC {
            return Err(MdError::NoMagic);
        }
        if sb.major_version.get() != 1 {
            return Err(MdError::WrongVersion(format!("{}", sb.major_version.get())));
        }
        if sb.super_offset.get() != sb_offset {
            return Err(MdError::NoMagic);
        }
        let max_dev = sb.max_dev.get() as usize;
        if max_dev > MAX_DEVS {
            return Err(MdError::WrongVersion(format!("max_dev {}", max_dev)));
        }
        let csum_len = 256 + 2 * max_dev;
        let stored = sb.sb_csum.get();
        buf[216..220].fill(0);
        let computed = sum_le_folded(&buf[..csum_len]);
        if stored != computed {
            return Err(MdError::BadChecksum { stored, computed });
        }
        buf[216..220].copy_from_slice(&stored.to_le_bytes());
        let roles = (0..max_dev)
            .map(|i| u16::from_le_bytes(buf[256 + 2 * i..256 + 2 * i + 2].try_into().unwrap()))
            .collect();
        if sb.feature_map.get() & FEATURE_BITMAP_OFFSET != 0 {
            let bm_sector = sb_offset as i64 + sb.bitmap_offset.get() as i32 as i64;
            if bm_sector >= 0 {
                let mut bbuf = vec![0u8; bitmap::BITMAP_SUPER_SIZE];
                if dev.read_at(bm_sector as u64 * 512, &mut bbuf).is_ok() {
                    self.bitmap = BitmapSuper::read_from(&bbuf).filter(|b| b.is_valid());
                }
            }
        }
        Ok(Loaded { sb, roles, device_size: dsize })
    }

    fn this_role(st: &Loaded) -> u16 {
        let d = st.sb.dev_number.get() as usize;
        st.roles.get(d).copied().unwrap_or(ROLE_SPARE)
    }
}

impl Metadata for Super1 {
    fn family(&self) -> Family {
        Family::V1
    }

    fn name(&self) -> String {
        match self.minor {
            -1 => "1.x".into(),
            m => format!("1.{}", m),
        }
    }

    fn text_version(&self) -> String {
        self.name()
    }

    fn loaded(&self) -> bool {
        self.state.is_some()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn load(&mut self, dev: &mut BlockDevice) -> Result<()> {
        self.free_super();
        if self.minor >= 0 {
            let st = self.load_minor(dev, self.minor)?;
            self.state = Some(st);
            return Ok(());
        }
        // probe all placements, newest ctime wins
        let mut best: Option<(i32, Loaded)> = None;
        for minor in 0..=2 {
            match self.load_minor(dev, minor) {
                Ok(st) => {
                    let newer = best
                        .as_ref()
                        .map_or(true, |(_, b)| b.sb.ctime.get() < st.sb.ctime.get());
                    if newer {
                        best = Some((minor, st));
                    }
                }
                Err(e) if e.is_probe_miss() => continue,
                Err(e) => return Err(e),
            }
        }
        match best {
            Some((minor, _)) => {
                // reload the winning placement so the bitmap view matches
                self.bitmap = None;
                let st = self.load_minor(dev, minor)?;
                self.minor = minor;
                self.state = Some(st);
                Ok(())
            }
            None => Err(MdError::NoMagic),
        }
    }

    fn free_super(&mut self) {
        self.state = None;
        self.bitmap = None;
        self.pending.clear();
    }

    fn getinfo(&self) -> Result<MdInfo> {
        let st = self.loaded_ref()?;
        let sb = &st.sb;
        let mut info = MdInfo::default();
        info.array.major_version = 1;
        info.array.minor_version = self.minor.max(0);
        info.array.raid_disks = sb.raid_disks.get() as i32;
        info.array.level = sb.level.get() as i32;
        info.array.layout = sb.layout.get() as i32;
        info.array.md_minor = -1;
        info.array.chunk_size = (sb.chunksize.get() * 512) as i32;
        info.array.ctime = sb.ctime.get();
        info.array.utime = sb.utime.get();
        info.array.clean = sb.resync_offset.get() == MAX_SECTOR;
        info.component_size = sb.size.get();
        info.data_offset = sb.data_offset.get();
        info.events = sb.events.get();
        info.uuid = sb.set_uuid;
        info.name = set_name_str(&sb.set_name);
        info.text_version = self.text_version();
        info.resync_start = sb.resync_offset.get();
        info.bitmap_offset = if sb.feature_map.get() & FEATURE_BITMAP_OFFSET != 0 {
            sb.bitmap_offset.get() as i32 as i64
        } else {
            0
        };
        if sb.feature_map.get() & FEATURE_RESHAPE_ACTIVE != 0 {
            info.reshape_active = true;
            info.reshape_progress = sb.reshape_position.get();
            info.new_level = sb.new_level.get() as i32;
            info.delta_disks = sb.delta_disks.get() as i32;
            info.new_layout = sb.new_layout.get() as i32;
            info.new_chunk = sb.new_chunk.get() as i32;
        }
        info.disk.number = sb.dev_number.get() as i32;
        let role = Self::this_role(st);
        match role {
            ROLE_SPARE => {
                info.disk.raid_disk = -1;
                info.disk.state = 0;
            }
            ROLE_FAULTY => {
                info.disk.raid_disk = -1;
                info.disk.state = disk_state::FAULTY;
            }
            r => {
                info.disk.raid_disk = r as i32;
                info.disk.state = disk_state::ACTIVE | disk_state::SYNC;
            }
        }
        if sb.feature_map.get() & FEATURE_RECOVERY_OFFSET != 0 {
            info.recovery_start = sb.recovery_offset.get();
        } else {
            info.recovery_start = MAX_SECTOR;
        }
        info.array.working_disks = st
            .roles
            .iter()
            .filter(|&&r| r != ROLE_SPARE && r != ROLE_FAULTY)
            .count() as i32;
        info.array.active_disks = info.array.working_disks;
        Ok(info)
    }

    fn uuid(&self) -> Result<[u8; 16]> {
        Ok(self.loaded_ref()?.sb.set_uuid)
    }

    fn match_home(&self, homehost: &str) -> Result<bool> {
        let st = self.loaded_ref()?;
        let name = set_name_str(&st.sb.set_name);
        Ok(name
            .split_once(':')
            .map_or(false, |(host, _)| host.eq_ignore_ascii_case(homehost)))
    }

    fn compare(&mut self, other: &dyn Metadata) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<Super1>()
            .ok_or_else(|| MdError::IncompatibleMetadata("different metadata family".into()))?;
        let ost = other.loaded_ref()?;
        if self.state.is_none() {
            self.minor = other.minor;
            self.state = Some(Loaded {
                sb: ost.sb,
                roles: ost.roles.clone(),
                device_size: ost.device_size,
            });
            self.bitmap = other.bitmap.clone();
            return Ok(());
        }
        let st = self.loaded_ref()?;
        if st.sb.set_uuid != ost.sb.set_uuid {
            return Err(MdError::IncompatibleMetadata("uuid mismatch".into()));
        }
        if st.sb.ctime.get() != ost.sb.ctime.get()
            || st.sb.level.get() != ost.sb.level.get()
            || st.sb.layout.get() != ost.sb.layout.get()
            || st.sb.size.get() != ost.sb.size.get()
            || st.sb.chunksize.get() != ost.sb.chunksize.get()
            || st.sb.raid_disks.get() != ost.sb.raid_disks.get()
        {
            return Err(MdError::IncompatibleMetadata("array parameters differ".into()));
        }
        Ok(())
    }

    fn update(&mut self, info: &mut MdInfo, update: &Update) -> Result<bool> {
        let identity = update.is_identity();
        let old_events = self.loaded_ref()?.sb.events.get();
        let mut rv = false;
        match update {
            Update::Sparc22 | Update::ByteOrder | Update::SuperMinor => {
                // v0.90 specific
            }
            Update::Summaries => {
                // summaries are derived for v1.x; nothing stored
            }
            Update::Force => {
                let st = self.loaded_mut()?;
                st.sb.events.set(info.events);
                if matches!(st.sb.level.get() as i32, 4 | 5 | 6) {
                    st.sb.resync_offset.set(MAX_SECTOR);
                }
                rv = true;
            }
            Update::Assemble => {
                let st = self.loaded_mut()?;
                let d = info.disk.number as usize;
                let want = if info.disk.state == disk_state::ACTIVE | disk_state::SYNC {
                    info.disk.raid_disk as u16
                } else {
                    ROLE_SPARE
                };
                if st.roles.get(d).copied() != Some(want) {
                    if d < st.roles.len() {
                        st.roles[d] = want;
                        rv = true;
                    }
                }
                if info.reshape_active
                    && st.sb.feature_map.get() & FEATURE_RESHAPE_ACTIVE != 0
                {
                    let pos = st.sb.reshape_position.get();
                    if (info.delta_disks >= 0 && info.reshape_progress < pos)
                        || (info.delta_disks < 0 && info.reshape_progress > pos)
                    {
                        st.sb.reshape_position.set(info.reshape_progress);
                        rv = true;
                    }
                }
            }
            Update::NewDev => {
                let st = self.loaded_mut()?;
                let d = info.disk.number as usize;
                if d >= st.roles.len() && d < MAX_DEVS {
                    st.roles.resize(d + 1, ROLE_SPARE);
                    st.sb.max_dev.set(st.roles.len() as u32);
                }
                if d < st.roles.len() {
                    st.roles[d] = if info.disk.raid_disk >= 0 {
                        info.disk.raid_disk as u16
                    } else {
                        ROLE_SPARE
                    };
                    rv = true;
                }
            }
            Update::Grow => {
                let st = self.loaded_mut()?;
                st.sb.raid_disks.set(info.array.raid_disks as u32);
                let d = info.disk.number as usize;
                if d < st.roles.len() {
                    st.roles[d] = info.disk.raid_disk as u16;
                }
                rv = true;
            }
            Update::Resync => {
                self.loaded_mut()?.sb.resync_offset.set(0);
                rv = true;
            }
            Update::Uuid(uuid) => {
                self.loaded_mut()?.sb.set_uuid = *uuid;
                if let Some(bm) = self.bitmap.as_mut() {
                    bm.uuid = *uuid;
                }
                rv = true;
            }
            Update::Name { name, homehost } => {
                let st = self.loaded_mut()?;
                st.sb.set_name = name_with_host(name, homehost.as_deref());
                rv = true;
            }
            Update::HomeHost(host) => {
                let st = self.loaded_mut()?;
                let bare = set_name_str(&st.sb.set_name);
                let bare = bare.split_once(':').map(|(_, n)| n).unwrap_or(&bare);
                st.sb.set_name = name_with_host(bare, Some(host));
                rv = true;
            }
            Update::DeviceSize(devsize) => {
                let st = self.loaded_mut()?;
                if st.sb.super_offset.get() < st.sb.data_offset.get() {
                    st.sb.data_size.set(devsize - st.sb.data_offset.get());
                    rv = true;
                }
            }
            Update::NoBitmap => {
                let st = self.loaded_mut()?;
                st.sb
                    .feature_map
                    .set(st.sb.feature_map.get() & !FEATURE_BITMAP_OFFSET);
                self.bitmap = None;
                rv = true;
            }
            Update::WriteMostly => {
                self.loaded_mut()?.sb.devflags |= WRITEMOSTLY1;
                rv = true;
            }
            Update::ReadWrite => {
                self.loaded_mut()?.sb.devflags &= !WRITEMOSTLY1;
                rv = true;
            }
            Update::ReshapeProgress(pos) => {
                let st = self.loaded_mut()?;
                // a recorded position implies an active reshape
                st.sb
                    .feature_map
                    .set(st.sb.feature_map.get() | FEATURE_RESHAPE_ACTIVE);
                st.sb.reshape_position.set(*pos);
                rv = true;
            }
        }
        let st = self.loaded_mut()?;
        if rv && !identity && st.sb.events.get() <= old_events {
            st.sb.events.set(old_events + 1);
        }
        Ok(rv)
    }

    fn init(&mut self, info: &CreateInfo) -> Result<()> {
        let spares = info.spare_disks;
        if info.raid_disks + spares > MAX_DEVS as i32 {
            return Err(MdError::IncompatibleMetadata(format!(
                "too many devices requested: {}+{} > {}",
                info.raid_disks, spares, MAX_DEVS
            )));
        }
        if self.minor < 0 {
            self.minor = 2;
        }
        let mut sb = Sb1::default();
        sb.magic.set(MD_SB_MAGIC);
        sb.major_version.set(1);
        match info.uuid {
            Some(uuid) => sb.set_uuid = uuid,
            None => sb.set_uuid = *uuid::Uuid::new_v4().as_bytes(),
        }
        let name = if info.name.is_empty() {
            format!("{}", info.md_minor)
        } else {
            info.name.clone()
        };
        sb.set_name = name_with_host(&name, info.homehost.as_deref());
        sb.ctime.set(now_secs());
        sb.level.set(info.level as u32);
        sb.layout.set(info.layout as u32);
        sb.size.set(info.size_sectors);
        sb.chunksize.set((info.chunk_size / 512) as u32);
        sb.raid_disks.set(info.raid_disks as u32);
        sb.utime = sb.ctime;
        sb.events.set(1);
        if info.clean {
            sb.resync_offset.set(MAX_SECTOR);
        } else {
            sb.resync_offset.set(0);
        }
        let sbsize = 256 + 2 * (info.raid_disks + spares) as usize;
        let sbsize = (sbsize + 511) / 512 * 512;
        let max_dev = (sbsize - 256) / 2;
        sb.max_dev.set(max_dev as u32);
        self.state = Some(Loaded {
            sb,
            roles: vec![ROLE_SPARE; max_dev],
            device_size: 0,
        });
        Ok(())
    }

    fn add_to_super(&mut self, dk: &DiskInfo, dev: Option<BlockDevice>) -> Result<()> {
        let st = self.loaded_mut()?;
        let d = dk.number as usize;
        if d >= st.roles.len() {
            if d >= MAX_DEVS {
                return Err(MdError::IncompatibleMetadata(format!(
                    "disk number {} out of range",
                    dk.number
                )));
            }
            st.roles.resize(d + 1, ROLE_SPARE);
            st.sb.max_dev.set(st.roles.len() as u32);
        }
        st.roles[d] = if dk.state & (disk_state::ACTIVE | disk_state::SYNC)
            == disk_state::ACTIVE | disk_state::SYNC
        {
            dk.raid_disk as u16
        } else if dk.state & !disk_state::ACTIVE == 0 {
            ROLE_SPARE
        } else {
            ROLE_FAULTY
        };
        st.sb.dev_number.set(dk.number as u32);
        st.sb.devflags = 0;
        self.pending.push(Pending { disk: dk.clone(), dev });
        Ok(())
    }

    fn remove_from_super(&mut self, dk: &DiskInfo) -> Result<()> {
        let st = self.loaded_mut()?;
        let d = dk.number as usize;
        if d < st.roles.len() {
            st.roles[d] = ROLE_FAULTY;
        }
        Ok(())
    }

    fn store(&mut self, dev: &mut BlockDevice) -> Result<()> {
        let dsize = dev.size_sectors()?;
        if dsize < 24 {
            return Err(MdError::TooSmall(dsize));
        }
        let minor = self.minor.max(0);
        let sb_offset = sb_offset_sectors(minor, dsize);
        {
            let st = self.loaded_mut()?;
            st.sb.super_offset.set(sb_offset);
        }
        let image = self.image()?;
        dev.write_at(sb_offset * 512, &image)?;
        let st = self.loaded_ref()?;
        if st.sb.feature_map.get() & FEATURE_BITMAP_OFFSET != 0 {
            if let Some(bm) = self.bitmap.as_ref() {
                let bm_sector = sb_offset as i64 + st.sb.bitmap_offset.get() as i32 as i64;
                if bm_sector > 0 {
                    dev.write_at(bm_sector as u64 * 512, &bm.to_bytes())?;
                }
            }
        }
        dev.sync()
    }

    fn write_init(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut wrote = 0;
        for p in pending {
            let Some(mut dev) = p.dev else { continue };
            let dsize = dev.size_sectors()?;
            if dsize < 24 {
                return Err(MdError::TooSmall(dsize));
            }
            let minor = self.minor.max(0);
            {
                let st = self.loaded_mut()?;
                st.sb.dev_number.set(p.disk.number as u32);
                if p.disk.state & disk_state::WRITEMOSTLY != 0 {
                    st.sb.devflags |= WRITEMOSTLY1;
                } else {
                    st.sb.devflags &= !WRITEMOSTLY1;
                }
                st.sb.device_uuid = *uuid::Uuid::new_v4().as_bytes();
                st.sb.events.set(1);
                st.device_size = dsize;

                // carve data area: superblock, bitmap headroom, reshape
                // headroom, then 1MiB/4K alignment
                let array_size = st.sb.size.get();
                let mut bm_space = choose_bm_space(array_size);
                let mut headroom = 128 * 1024 * 2u64;
                while headroom << 10 > array_size && headroom > 1 {
                    headroom >>= 1;
                }
                match minor {
                    0 => {
                        let sb_offset = sb_offset_sectors(0, dsize);
                        st.sb.super_offset.set(sb_offset);
                        st.sb.data_offset.set(0);
                        if sb_offset < array_size + bm_space {
                            bm_space = sb_offset - array_size;
                        }
                        st.sb.data_size.set(sb_offset - bm_space);
                        if st.sb.feature_map.get() & FEATURE_BITMAP_OFFSET != 0 {
                            // bitmap sits between data end and the superblock
                            st.sb.bitmap_offset.set((-(bm_space as i32)) as u32);
                        }
                    }
                    m => {
                        let sb_sectors = (MAX_SB_SIZE / 512) as u64;
                        let base = if m == 1 { 0 } else { 4 * 2 };
                        st.sb.super_offset.set(base);
                        let mut reserved = bm_space + base + sb_sectors;
                        if reserved < headroom {
                            reserved = headroom;
                        }
                        if reserved + array_size > dsize {
                            reserved = dsize - array_size;
                        }
                        const ONE_MEG: u64 = 2 * 1024;
                        if reserved > ONE_MEG {
                            reserved = reserved / ONE_MEG * ONE_MEG;
                        }
                        reserved &= !7u64;
                        st.sb.data_offset.set(reserved);
                        st.sb.data_size.set(dsize - reserved);
                        if st.sb.feature_map.get() & FEATURE_BITMAP_OFFSET != 0 {
                            st.sb.bitmap_offset.set(sb_sectors as u32);
                        }
                    }
                }
            }
            match self.store(&mut dev) {
                Ok(()) => wrote += 1,
                Err(e) => {
                    log::warn!("failed to write superblock to {}: {}", dev.path().display(), e)
                }
            }
        }
        if wrote == 0 {
            return Err(MdError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "superblock written to no device",
            )));
        }
        Ok(())
    }

    fn avail_size(&self, dev_sectors: u64) -> u64 {
        if dev_sectors < 24 {
            return 0;
        }
        let bm_space = choose_bm_space(dev_sectors);
        match self.minor.max(0) {
            0 => sb_offset_sectors(0, dev_sectors).saturating_sub(bm_space),
            1 => dev_sectors - 4 * 2 - bm_space,
            _ => dev_sectors - 4 * 2 - 4 * 2 - bm_space,
        }
    }

    fn add_internal_bitmap(&mut self, params: &BitmapParams, size_sectors: u64) -> Result<u32> {
        let uuid = self.loaded_ref()?.sb.set_uuid;
        // near-superblock window for v1.x
        let window = 128 * 1024;
        let (bm, chunk) = bitmap::create(params, size_sectors, window, uuid, 64 * 1024 * 1024)?;
        let st = self.loaded_mut()?;
        st.sb
            .feature_map
            .set(st.sb.feature_map.get() | FEATURE_BITMAP_OFFSET);
        if st.sb.bitmap_offset.get() == 0 {
            st.sb.bitmap_offset.set((MAX_SB_SIZE / 512) as u32);
        }
        self.bitmap = Some(bm);
        Ok(chunk)
    }

    fn locate_bitmap(&self, dev_sectors: u64) -> Option<u64> {
        let st = self.state.as_ref()?;
        if st.sb.feature_map.get() & FEATURE_BITMAP_OFFSET == 0 {
            return None;
        }
        let sb_offset = sb_offset_sectors(self.minor.max(0), dev_sectors) as i64;
        let bm = sb_offset + st.sb.bitmap_offset.get() as i32 as i64;
        (bm >= 0).then_some(bm as u64 * 512)
    }

    fn write_bitmap(&mut self, dev: &mut BlockDevice) -> Result<()> {
        let dsize = dev.size_sectors()?;
        let offset = self
            .locate_bitmap(dsize)
            .ok_or(MdError::IncompatibleMetadata("no bitmap present".into()))?;
        let bm = self
            .bitmap
            .as_ref()
            .ok_or(MdError::IncompatibleMetadata("no bitmap present".into()))?;
        let mut out = bm.to_bytes();
        // all-dirty bits so the first resync covers everything
        let bytes = ((bm.bits() + 7) / 8) as usize;
        out.resize(bitmap::BITMAP_SUPER_SIZE + (bytes + 511) / 512 * 512, 0);
        for b in out[bitmap::BITMAP_SUPER_SIZE..bitmap::BITMAP_SUPER_SIZE + bytes].iter_mut() {
            *b = 0xff;
        }
        dev.write_at(offset, &out)?;
        dev.sync()
    }

    fn examine(&self, w: &mut dyn Write) -> Result<()> {
        let st = self.loaded_ref()?;
        let sb = &st.sb;
        writeln!(w, "          Magic : {:08x}", sb.magic.get())?;
        writeln!(w, "        Version : 1.{}", self.minor.max(0))?;
        writeln!(w, "    Feature Map : 0x{:x}", sb.feature_map.get())?;
        writeln!(w, "     Array UUID : {}", uuid_text(&sb.set_uuid))?;
        writeln!(w, "           Name : {}", set_name_str(&sb.set_name))?;
        writeln!(w, "  Creation Time : {}", fmt_time(sb.ctime.get()))?;
        let lvl = mdctl_core::model::level_name(sb.level.get() as i32).unwrap_or("-unknown-");
        writeln!(w, "     Raid Level : {}", lvl)?;
        writeln!(w, "   Raid Devices : {}", sb.raid_disks.get())?;
        writeln!(w)?;
        writeln!(w, " Avail Dev Size : {} sectors", sb.data_size.get())?;
        writeln!(w, "     Array Size : {} KiB", sb.size.get() / 2)?;
        writeln!(w, "    Data Offset : {} sectors", sb.data_offset.get())?;
        writeln!(w, "   Super Offset : {} sectors", sb.super_offset.get())?;
        writeln!(w, "          State : {}", if sb.resync_offset.get() == MAX_SECTOR { "clean" } else { "active" })?;
        writeln!(w, "    Device UUID : {}", uuid_text(&sb.device_uuid))?;
        if sb.feature_map.get() & FEATURE_BITMAP_OFFSET != 0 {
            writeln!(w, "Internal Bitmap : {} sectors from superblock", sb.bitmap_offset.get() as i32)?;
        }
        if sb.feature_map.get() & FEATURE_RESHAPE_ACTIVE != 0 {
            writeln!(w, "  Reshape pos'n : {}", sb.reshape_position.get())?;
            if sb.delta_disks.get() != 0 {
                writeln!(w, "  Delta Devices : {}", sb.delta_disks.get() as i32)?;
            }
        }
        writeln!(w)?;
        writeln!(w, "    Update Time : {}", fmt_time(sb.utime.get()))?;
        writeln!(w, "       Checksum : {:x} - correct", sb.sb_csum.get())?;
        writeln!(w, "         Events : {}", sb.events.get())?;
        writeln!(w)?;
        if sb.level.get() as i32 == 5 {
            if let Some(l) = mdctl_core::model::r5layout_name(sb.layout.get() as i32) {
                writeln!(w, "         Layout : {}", l)?;
            }
        }
        if matches!(sb.level.get() as i32, 0 | 4 | 5 | 6 | 10) {
            writeln!(w, "     Chunk Size : {}K", sb.chunksize.get() / 2)?;
        }
        writeln!(w)?;
        let role = Self::this_role(st);
        writeln!(
            w,
            "   Device Role : {}",
            match role {
                ROLE_SPARE => "spare".to_string(),
                ROLE_FAULTY => "faulty".to_string(),
                r => format!("Active device {}", r),
            }
        )?;
        write!(w, "   Array State : ")?;
        for i in 0..sb.raid_disks.get() as usize {
            let c = if st.roles.iter().any(|&r| r as usize == i) { 'A' } else { '.' };
            write!(w, "{}", c)?;
        }
        writeln!(w, " ('A' == active, '.' == missing)")?;
        Ok(())
    }

    fn brief_examine(&self, w: &mut dyn Write) -> Result<()> {
        let st = self.loaded_ref()?;
        let name = set_name_str(&st.sb.set_name);
        write!(
            w,
            "ARRAY {} level={} metadata=1.{} num-devices={} UUID={}",
            if name.is_empty() { "/dev/md/?".to_string() } else { format!("/dev/md/{}", name) },
            mdctl_core::model::level_name(st.sb.level.get() as i32).unwrap_or("?"),
            self.minor.max(0),
            st.sb.raid_disks.get(),
            uuid_text(&st.sb.set_uuid)
        )?;
        if !name.is_empty() {
            write!(w, " name={}", name)?;
        }
        writeln!(w)?;
        Ok(())
    }

    fn export_examine(&self, w: &mut dyn Write) -> Result<()> {
        let st = self.loaded_ref()?;
        writeln!(
            w,
            "MD_LEVEL={}",
            mdctl_core::model::level_name(st.sb.level.get() as i32).unwrap_or("?")
        )?;
        writeln!(w, "MD_DEVICES={}", st.sb.raid_disks.get())?;
        writeln!(w, "MD_METADATA=1.{}", self.minor.max(0))?;
        writeln!(w, "MD_UUID={}", uuid_text(&st.sb.set_uuid))?;
        writeln!(w, "MD_NAME={}", set_name_str(&st.sb.set_name))?;
        writeln!(w, "MD_EVENTS={}", st.sb.events.get())?;
        Ok(())
    }

    fn detail(&self, w: &mut dyn Write) -> Result<()> {
        let st = self.loaded_ref()?;
        writeln!(w, "           Name : {}", set_name_str(&st.sb.set_name))?;
        writeln!(w, "           UUID : {}", uuid_text(&st.sb.set_uuid))?;
        writeln!(w, "         Events : {}", st.sb.events.get())?;
        Ok(())
    }

    fn brief_detail(&self, w: &mut dyn Write) -> Result<()> {
        let st = self.loaded_ref()?;
        write!(w, " UUID={}", uuid_text(&st.sb.set_uuid))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dev(sectors: u64) -> (tempfile::NamedTempFile, BlockDevice) {
        let tf = tempfile::NamedTempFile::new().unwrap();
        tf.as_file().set_len(sectors * 512).unwrap();
        let dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        (tf, dev)
    }

    fn raid5_info() -> CreateInfo {
        CreateInfo {
            level: 5,
            raid_disks: 3,
            layout: 2,
            chunk_size: 64 * 1024,
            size_sectors: 1 << 20,
            name: "test".into(),
            clean: true,
            ..Default::default()
        }
    }

    fn active_disk(n: i32) -> DiskInfo {
        DiskInfo {
            number: n,
            major: 8,
            minor: (n as u32) * 16,
            raid_disk: n,
            state: disk_state::ACTIVE | disk_state::SYNC,
        }
    }

    #[test]
    fn placement() {
        assert_eq!(sb_offset_sectors(1, 1 << 21), 0);
        assert_eq!(sb_offset_sectors(2, 1 << 21), 8);
        assert_eq!(sb_offset_sectors(0, 2097152), 2097136);
        // always 4K aligned
        assert_eq!(sb_offset_sectors(0, 2097151) % 8, 0);
    }

    #[test]
    fn create_store_load_round_trip() {
        // three 1GiB-ish scratch devices
        let mut st = Super1::with_minor(2);
        st.init(&raid5_info()).unwrap();
        let uuid = st.uuid().unwrap();

        let mut files = Vec::new();
        for n in 0..3 {
            let (tf, dev) = scratch_dev(1 << 21);
            st.add_to_super(&active_disk(n), Some(dev)).unwrap();
            files.push(tf);
        }
        st.write_init().unwrap();

        for tf in &files {
            let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
            let mut st2 = Super1::any_minor();
            st2.load(&mut dev).unwrap();
            assert_eq!(st2.minor, 2);
            let info = st2.getinfo().unwrap();
            assert_eq!(info.array.level, 5);
            assert_eq!(info.array.raid_disks, 3);
            assert_eq!(info.array.chunk_size, 64 * 1024);
            assert_eq!(info.uuid, uuid);
            assert_eq!(info.name, "test");
            assert!(info.data_offset >= 16);
            assert!(info.data_offset + info.component_size <= 1 << 21);
        }
    }

    #[test]
    fn examine_output_mentions_level_and_chunk() {
        let mut st = Super1::with_minor(2);
        st.init(&raid5_info()).unwrap();
        let (_tf, dev) = scratch_dev(1 << 21);
        st.add_to_super(&active_disk(0), Some(dev)).unwrap();
        st.write_init().unwrap();
        let mut out = Vec::new();
        st.examine(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Raid Level : raid5"), "{}", text);
        assert!(text.contains("Chunk Size : 64K"), "{}", text);
    }

    #[test]
    fn checksum_rejects_any_flipped_byte() {
        let mut st = Super1::with_minor(2);
        st.init(&raid5_info()).unwrap();
        let (tf, dev) = scratch_dev(1 << 21);
        st.add_to_super(&active_disk(0), Some(dev)).unwrap();
        st.write_init().unwrap();

        let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        for probe in [8 * 512 + 17, 8 * 512 + 99, 8 * 512 + 255] {
            let mut byte = [0u8; 1];
            dev.read_at(probe, &mut byte).unwrap();
            let orig = byte[0];
            byte[0] ^= 0x01;
            dev.write_at(probe, &byte).unwrap();
            let mut st2 = Super1::with_minor(2);
            assert!(
                matches!(st2.load(&mut dev), Err(MdError::BadChecksum { .. })),
                "flip at {} not caught",
                probe
            );
            dev.write_at(probe, &[orig]).unwrap();
        }
    }

    #[test]
    fn newest_ctime_wins_on_ambiguous_probe() {
        let (tf, dev) = scratch_dev(1 << 21);
        // older superblock at 1.1 placement
        let mut old = Super1::with_minor(1);
        let mut info = raid5_info();
        old.init(&info).unwrap();
        old.loaded_mut().unwrap().sb.ctime.set(1000);
        old.add_to_super(&active_disk(0), Some(dev)).unwrap();
        old.write_init().unwrap();
        // newer superblock at 1.2 placement
        let dev2 = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        let mut newer = Super1::with_minor(2);
        info.name = "newer".into();
        newer.init(&info).unwrap();
        newer.loaded_mut().unwrap().sb.ctime.set(2000);
        newer.add_to_super(&active_disk(0), Some(dev2)).unwrap();
        newer.write_init().unwrap();

        let mut dev3 = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        let mut st = Super1::any_minor();
        st.load(&mut dev3).unwrap();
        assert_eq!(st.minor, 2);
        assert_eq!(st.getinfo().unwrap().name, "newer");
    }

    #[test]
    fn events_monotonic_and_assemble_updates_roles() {
        let mut st = Super1::with_minor(2);
        st.init(&raid5_info()).unwrap();
        for n in 0..3 {
            st.add_to_super(&active_disk(n), None).unwrap();
        }
        let before = st.loaded_ref().unwrap().sb.events.get();
        let mut info = st.getinfo().unwrap();
        info.disk.number = 2;
        info.disk.raid_disk = -1;
        info.disk.state = 0;
        let changed = st.update(&mut info, &Update::Assemble).unwrap();
        assert!(changed);
        assert_eq!(st.loaded_ref().unwrap().roles[2], ROLE_SPARE);
        assert!(st.loaded_ref().unwrap().sb.events.get() > before);
    }

    #[test]
    fn homehost_rewrites_name_prefix() {
        let mut st = Super1::with_minor(2);
        st.init(&raid5_info()).unwrap();
        let mut info = st.getinfo().unwrap();
        st.update(&mut info, &Update::HomeHost("myhost".into())).unwrap();
        let name = set_name_str(&st.loaded_ref().unwrap().sb.set_name);
        assert_eq!(name, "myhost:test");
        assert!(st.match_home("myhost").unwrap());
        assert!(st.match_home("MYHOST").unwrap());
        assert!(!st.match_home("other").unwrap());
    }
}
