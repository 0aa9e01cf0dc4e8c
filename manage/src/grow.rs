//! The reshape coordinator: size, level, and geometry changes.
//!
//! Size- and level-only changes are synchronous sysfs writes. Geometry
//! changes (chunk, layout, disk count) fork a child that keeps a rolling
//! backup of the critical section while the kernel restripes, because the
//! kernel overwrites the early region before it has been read.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use mdctl_core::model::{disk_state, level_name};
use mdctl_core::util::lcm;
use mdctl_core::{BlockDevice, MdError, MdInfo, Result};
use mdctl_metadata::backup::BackupSuper;
use mdctl_metadata::endian::{Le64, OnDisk};
use mdctl_metadata::Metadata;
use mdctl_sysfs::attrs::fd_read_u64;
use mdctl_sysfs::{wait_attr_change, SysArray};
use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{fork, ForkResult};

use crate::geometry::{data_disks, read_stripes, save_stripes};

#[derive(Debug, Clone, Default)]
pub struct GrowParams {
    pub raid_disks: Option<i32>,
    pub level: Option<i32>,
    /// bytes
    pub chunk_size: Option<i32>,
    pub layout: Option<i32>,
    /// sectors; `Some(0)` means "maximum"
    pub size: Option<u64>,
    pub backup_file: Option<PathBuf>,
}

/// Critical-section size: the smallest amount that is a whole number of both
/// old and new stripes, in array-linear sectors.
pub fn compute_backup_blocks(ochunk: i32, nchunk: i32, odata: i32, ndata: i32) -> u64 {
    lcm(
        (ochunk as u64 / 512) * odata as u64,
        (nchunk as u64 / 512) * ndata as u64,
    )
}

/// Where the backup lives in a spare's data area: at the very end, leaving
/// room for the record pair and trailing slack.
pub fn spare_backup_offset(data_offset: u64, component_size: u64, blocks: u64) -> u64 {
    (data_offset + component_size - blocks - 8) * 512
}

/// Stripe-cache floor before a reshape may run.
pub fn required_stripe_cache(ochunk: i32, nchunk: i32, blocks: u64, odisks: i32) -> u64 {
    let cache = (ochunk.max(nchunk) as u64) * 4 / 4096;
    cache.max(blocks / 8 / odisks as u64 + 16)
}

/// Change only the component size.
pub fn grow_size(sra: &SysArray, size_sectors: u64) -> Result<()> {
    if size_sectors == 0 {
        sra.write_attr(None, "component_size", "0")
    } else {
        sra.write_num(None, "component_size", size_sectors / 2)
    }
}

/// Change only the level. A `Busy` with a bitmap present means the bitmap
/// must go first; surface that.
pub fn grow_level(sra: &SysArray, info: &MdInfo, new_level: i32) -> Result<()> {
    let name = level_name(new_level)
        .ok_or_else(|| MdError::IncompatibleMetadata(format!("unknown level {}", new_level)))?;
    match sra.write_attr(None, "level", name) {
        Err(MdError::Busy(_)) if info.bitmap_offset != 0 => {
            log::error!("bitmap must be removed before the level can be changed");
            Err(MdError::BitmapPresent)
        }
        other => other,
    }
}

struct ReshapeChild {
    sra: SysArray,
    /// indexed by old raid_disk
    sources: Vec<Option<BlockDevice>>,
    /// bytes, per source
    offsets: Vec<u64>,
    dests: Vec<BlockDevice>,
    /// bytes, per dest: where the backup data lands
    dest_offsets: Vec<u64>,
    bsb: BackupSuper,
    odisks: i32,
    /// bytes
    chunk: u64,
    level: i32,
    layout: i32,
    odata: i32,
    degraded: u64,
}

impl ReshapeChild {
    /// Suspend the next window, copy it out, seal and persist the record.
    fn grow_backup(&mut self, offset: u64, stripes: u64, part: usize) -> Result<()> {
        let chunk_sectors = self.chunk / 512;
        let odata = self.odata as u64;
        self.sra
            .write_num(None, "suspend_hi", (offset + stripes * chunk_sectors) * odata)?;

        // a membership change mid-backup would capture the wrong data
        let degraded = self.sra.read_u64(None, "degraded").unwrap_or(0);
        if degraded != self.degraded {
            let info = self.sra.read_info(
                mdctl_sysfs::attrs::get::DEVS | mdctl_sysfs::attrs::get::STATE,
            )?;
            for d in &info.devs {
                if d.curr_state & mdctl_core::model::dev_state::FAULTY != 0
                    && d.disk.raid_disk >= 0
                {
                    if let Some(slot) = self.sources.get_mut(d.disk.raid_disk as usize) {
                        *slot = None;
                    }
                }
            }
            self.degraded = degraded;
        }

        let arraystart = offset * odata;
        let length = stripes * chunk_sectors * odata;
        if part == 1 {
            self.bsb.enable_second_window();
            self.bsb.arraystart2 = Le64::new(arraystart);
            self.bsb.length2 = Le64::new(length);
        } else {
            self.bsb.arraystart = Le64::new(arraystart);
            self.bsb.length = Le64::new(length);
        }
        let devstart2 = self.bsb.devstart2.get();

        for i in 0..self.dests.len() {
            let base = self.dest_offsets[i] + if part == 1 { devstart2 * 512 } else { 0 };
            let mut dests = [(&mut self.dests[i], base)];
            save_stripes(
                &mut self.sources,
                &self.offsets,
                self.odisks,
                self.chunk,
                self.level,
                self.layout,
                &mut dests,
                arraystart * 512,
                length * 512,
            )?;
        }
        if mdctl_core::util::check_env("MDADM_GROW_VERIFY") {
            self.verify_backup(arraystart, length, part, devstart2)?;
        }
        self.bsb.mtime = Le64::new(now());
        for i in 0..self.dests.len() {
            self.bsb.devstart = Le64::new(self.dest_offsets[i] / 512);
            self.bsb.seal();
            let data_len = length * 512 + if part == 1 { devstart2 * 512 } else { 0 };
            self.bsb
                .write_around(&mut self.dests[i], self.dest_offsets[i], data_len)?;
        }
        Ok(())
    }

    /// Regression aid: re-read the first destination and compare it with a
    /// fresh copy of the suspended region.
    fn verify_backup(
        &mut self,
        arraystart: u64,
        length: u64,
        part: usize,
        devstart2: u64,
    ) -> Result<()> {
        let fresh = read_stripes(
            &mut self.sources,
            &self.offsets,
            self.odisks,
            self.chunk,
            self.level,
            self.layout,
            arraystart * 512,
            length * 512,
        )?;
        let Some(first) = self.dests.first_mut() else { return Ok(()) };
        let base = self.dest_offsets[0] + if part == 1 { devstart2 * 512 } else { 0 };
        let mut stored = vec![0u8; (length * 512) as usize];
        first.read_at(base, &mut stored)?;
        if stored != fresh {
            return Err(MdError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backup verification mismatch",
            )));
        }
        Ok(())
    }

    /// Wait for the kernel to pass the backed-up window, then retire it.
    ///
    /// `blocks2` is already-persisted slack added to `sync_max`; pre-2.6.31
    /// kernels under-report `sync_completed` by up to one stripe when the
    /// reshape pauses at `sync_max`, and the slack keeps them moving.
    fn wait_backup(&mut self, offset: u64, blocks: u64, blocks2: u64, part: usize) -> Result<()> {
        let fd = self.sra.open_attr(None, "sync_completed")?;
        self.sra.write_num(None, "sync_max", offset + blocks + blocks2)?;
        if offset == 0 {
            let _ = self.sra.write_attr(None, "sync_action", "reshape");
        }
        loop {
            let completed = fd_read_u64(&fd)?;
            if completed >= offset + blocks {
                break;
            }
            if let Ok(action) = self.sra.read_attr(None, "sync_action") {
                if !action.starts_with("reshape") {
                    break;
                }
            }
            wait_attr_change(&fd, -1)?;
        }
        if part == 1 {
            self.bsb.arraystart2 = Le64::new(0);
            self.bsb.length2 = Le64::new(0);
        } else {
            self.bsb.arraystart = Le64::new(0);
            self.bsb.length = Le64::new(0);
        }
        self.bsb.mtime = Le64::new(now());
        for i in 0..self.dests.len() {
            self.bsb.devstart = Le64::new(self.dest_offsets[i] / 512);
            self.bsb.seal();
            let bytes = self.bsb.as_bytes().to_vec();
            self.dests[i].write_at(self.dest_offsets[i] - 4096, &bytes)?;
            self.dests[i].sync()?;
        }
        Ok(())
    }

    /// Growing: back up the head once, let the kernel run past it, release.
    fn child_grow(&mut self, stripes: u64) -> Result<()> {
        let chunk_sectors = self.chunk / 512;
        self.sra.suspend_window(0, 0)?;
        self.grow_backup(0, stripes, 0)?;
        self.wait_backup(0, stripes * chunk_sectors, stripes * chunk_sectors, 0)?;
        self.sra
            .write_num(None, "suspend_lo", stripes * chunk_sectors * self.odata as u64)?;
        self.sra.write_attr(None, "sync_max", "max")?;
        Ok(())
    }

    /// Shrinking: the kernel runs free until the tail, which is fenced,
    /// backed up, and released.
    fn child_shrink(&mut self, stripes: u64, component_size: u64) -> Result<()> {
        let chunk_sectors = self.chunk / 512;
        let start = component_size - stripes * chunk_sectors;
        self.sra.write_num(None, "sync_max", start)?;
        let _ = self.sra.write_attr(None, "sync_action", "reshape");
        self.sra.suspend_window(0, 0)?;
        self.wait_backup(0, start - stripes * chunk_sectors, stripes * chunk_sectors, 0)?;
        self.grow_backup(0, stripes, 0)?;
        self.wait_backup(start, stripes * chunk_sectors, 0, 0)?;
        self.sra
            .write_num(None, "suspend_lo", stripes * chunk_sectors * self.odata as u64)?;
        self.sra.write_attr(None, "sync_max", "max")?;
        Ok(())
    }

    /// Same-size: two rotating backup windows leap-frog ahead of the kernel.
    fn child_same_size(&mut self, stripes: u64, component_size: u64) -> Result<()> {
        let chunk_sectors = self.chunk / 512;
        let data = self.odata as u64;
        self.sra.suspend_window(0, 0)?;
        self.bsb.devstart2 = Le64::new(stripes * chunk_sectors * data);

        self.grow_backup(0, stripes, 0)?;
        self.grow_backup(stripes * chunk_sectors, stripes, 1)?;
        let mut part = 0usize;
        let mut start = stripes * 2;
        let mut tailstripes = stripes;
        let size = component_size / chunk_sectors;
        while start < size {
            self.wait_backup(
                (start - stripes * 2) * chunk_sectors,
                stripes * chunk_sectors,
                0,
                part,
            )?;
            self.sra
                .write_num(None, "suspend_lo", start * chunk_sectors * data)?;
            if start + stripes > size {
                tailstripes = size - start;
            }
            self.grow_backup(start * chunk_sectors, tailstripes, part)?;
            start += stripes;
            part = 1 - part;
        }
        self.wait_backup((start - stripes * 2) * chunk_sectors, stripes * chunk_sectors, 0, part)?;
        self.sra
            .write_num(None, "suspend_lo", (start - stripes) * chunk_sectors * data)?;
        self.wait_backup(
            (start - stripes) * chunk_sectors,
            tailstripes * chunk_sectors,
            0,
            1 - part,
        )?;
        self.sra.write_num(None, "suspend_lo", size * chunk_sectors * data)?;
        Ok(())
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The geometry-change path. `st` has a superblock loaded from one member.
pub fn grow_reshape(
    mddev: &Path,
    sra: &SysArray,
    st: &mut dyn Metadata,
    params: &GrowParams,
) -> Result<()> {
    let info = sra.read_info(mdctl_sysfs::attrs::get::ALL)?;
    let frozen = sra.freeze();
    if frozen < 0 {
        return Err(MdError::Busy(format!("{} has a resync in progress", mddev.display())));
    }
    match reshape_frozen(sra, st, params, &info) {
        Ok(child_owns_freeze) => {
            if !child_owns_freeze {
                sra.unfreeze(frozen);
            }
            Ok(())
        }
        Err(e) => {
            // restore the original level if we got far enough to change it
            if let (Some(new_level), Some(orig)) = (params.level, level_name(info.array.level)) {
                if new_level != info.array.level {
                    let _ = sra.write_attr(None, "level", orig);
                }
            }
            sra.unfreeze(frozen);
            Err(e)
        }
    }
}

/// Returns whether a forked child now owns unfreezing the array.
fn reshape_frozen(
    sra: &SysArray,
    st: &mut dyn Metadata,
    params: &GrowParams,
    info: &MdInfo,
) -> Result<bool> {
    let odisks = info.array.raid_disks;
    let olevel = info.array.level;
    let ochunk = info.array.chunk_size;
    let olayout = info.array.layout;
    let ndisks = params.raid_disks.unwrap_or(odisks);
    let nlevel = params.level.unwrap_or(olevel);
    let nchunk = params.chunk_size.unwrap_or(ochunk);
    let nlayout = params.layout.unwrap_or(olayout);

    if nlevel != olevel
        && !matches!((olevel, nlevel), (5, 6) | (6, 5) | (1, 5) | (5, 1) | (0, 5) | (5, 0))
    {
        grow_level(sra, info, nlevel)?;
        return Ok(false);
    }

    let odata = data_disks(olevel, odisks);
    let ndata = data_disks(nlevel, ndisks);
    let blocks = compute_backup_blocks(ochunk, nchunk, odata, ndata);
    let stripes = blocks / (ochunk as u64 / 512) / odata as u64;

    let mut blocks = blocks;
    let mut stripes = stripes;
    if ndata == odata {
        // enlarge the unit toward 16MiB for throughput
        while blocks * 32 < info.component_size && blocks < 16 * 1024 * 2 {
            blocks *= 2;
            stripes *= 2;
        }
    } else {
        log::info!("need to backup {}K of critical section", blocks / 2);
    }
    if blocks >= info.component_size / 2 {
        return Err(MdError::IncompatibleMetadata(
            "reshape unit would cover half the array".into(),
        ));
    }

    // open members: in-sync by role, spares as backup destinations
    let mut sources: Vec<Option<BlockDevice>> = (0..odisks).map(|_| None).collect();
    let mut offsets = vec![0u64; odisks as usize];
    let mut dests: Vec<BlockDevice> = Vec::new();
    let mut dest_offsets: Vec<u64> = Vec::new();
    for d in &info.devs {
        if d.disk.state & disk_state::FAULTY != 0 {
            continue;
        }
        let path = PathBuf::from(format!("/dev/block/{}:{}", d.disk.major, d.disk.minor));
        if d.disk.state & disk_state::SYNC != 0 && d.disk.raid_disk >= 0 {
            let dev = BlockDevice::open(&path)?;
            offsets[d.disk.raid_disk as usize] = d.data_offset * 512;
            sources[d.disk.raid_disk as usize] = Some(dev);
        } else if params.backup_file.is_none() {
            let dev = BlockDevice::open_rw(&path)?;
            dest_offsets.push(spare_backup_offset(d.data_offset, info.component_size, blocks));
            dests.push(dev);
        }
    }
    if let Some(bf) = &params.backup_file {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(bf)
            .map_err(|e| {
                log::error!("cannot create backup file {}: {}", bf.display(), e);
                MdError::Io(e)
            })?;
        file.set_len((blocks + 1) * 512 + 4096).map_err(MdError::Io)?;
        file.sync_all().map_err(MdError::Io)?;
        dests.push(BlockDevice::from_file(file, bf));
        dest_offsets.push(8 * 512);
    } else if ndata <= odata {
        return Err(MdError::IncompatibleMetadata(
            "cannot reshape without a backup file".into(),
        ));
    } else if dests.is_empty() {
        return Err(MdError::IncompatibleMetadata(
            "need a spare or backup file for the critical section".into(),
        ));
    }

    // internal stripe cache must hold the whole unit
    let cache = required_stripe_cache(ochunk, nchunk, blocks, odisks);
    if info.cache_size < cache {
        sra.write_num(None, "stripe_cache_size", cache + 1)?;
    }

    // kick the kernel
    let geom = [
        ("chunk_size", nchunk as u64),
        ("layout", nlayout as u64),
        ("raid_disks", ndisks as u64),
    ];
    for (attr, val) in geom {
        match sra.write_num(None, attr, val) {
            Err(MdError::Busy(p)) if info.bitmap_offset != 0 => {
                log::error!("bitmap must be removed before shape can be changed");
                return Err(MdError::Busy(p));
            }
            other => other?,
        }
    }

    if ndisks == 2 && odisks == 2 {
        // no restripe needed
        return Ok(false);
    }

    let mut bsb = BackupSuper::default();
    bsb.set_uuid = st.uuid()?;
    bsb.mtime = Le64::new(now());

    match unsafe { fork() }.map_err(MdError::from)? {
        ForkResult::Child => {
            let _ = mlockall(MlockAllFlags::MCL_FUTURE);
            // the critical section must not be interrupted
            unsafe {
                let _ = signal(Signal::SIGTERM, SigHandler::SigIgn);
                let _ = signal(Signal::SIGINT, SigHandler::SigIgn);
                let _ = signal(Signal::SIGQUIT, SigHandler::SigIgn);
            }
            let mut child = ReshapeChild {
                sra: sra.clone(),
                sources,
                offsets,
                dests,
                dest_offsets,
                bsb,
                odisks,
                chunk: ochunk as u64,
                level: olevel,
                layout: olayout,
                odata,
                degraded: 0,
            };
            let rv = if odata < ndata {
                child.child_grow(stripes)
            } else if odata > ndata {
                child.child_shrink(stripes, info.component_size)
            } else {
                child.child_same_size(stripes, info.component_size)
            };
            unsafe {
                let _ = signal(Signal::SIGTERM, SigHandler::SigDfl);
                let _ = signal(Signal::SIGINT, SigHandler::SigDfl);
                let _ = signal(Signal::SIGQUIT, SigHandler::SigDfl);
            }
            match rv {
                Ok(()) => {
                    if let Some(bf) = &params.backup_file {
                        let _ = std::fs::remove_file(bf);
                    }
                    if params.level.is_some() && params.level != Some(olevel) {
                        let _ = sra.wait_reshape();
                        if let Some(name) = params.level.and_then(level_name) {
                            let _ = sra.write_attr(None, "level", name);
                        }
                    }
                    std::process::exit(0);
                }
                Err(e) => {
                    log::error!("reshape child failed: {}", e);
                    sra.unfreeze(1);
                    std::process::exit(1);
                }
            }
        }
        ForkResult::Parent { .. } => {
            // the child owns unfreezing from here
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_blocks_is_lcm_of_stripe_widths() {
        // 32KiB chunks, raid5 3→4 disks: 64-sector chunks, 2 and 3 data
        // disks, so the unit is 384 sectors
        assert_eq!(compute_backup_blocks(32 * 1024, 32 * 1024, 2, 3), 384);
        // same-size chunk change 64K→512K on 2 data disks
        assert_eq!(
            compute_backup_blocks(64 * 1024, 512 * 1024, 2, 2),
            2 * 1024 * 2
        );
    }

    #[test]
    fn spare_backup_sits_below_component_end() {
        let off = spare_backup_offset(2048, 1 << 20, 384);
        assert_eq!(off, (2048 + (1 << 20) - 384 - 8) * 512);
        assert!(off / 512 + 384 <= 2048 + (1 << 20));
    }

    #[test]
    fn stripe_cache_floor() {
        // floor comes from the larger chunk and from the unit size
        assert_eq!(required_stripe_cache(65536, 65536, 384, 3), 64);
        let big_unit = required_stripe_cache(65536, 65536, 1 << 16, 4);
        assert_eq!(big_unit, (1u64 << 16) / 8 / 4 + 16);
    }
}
