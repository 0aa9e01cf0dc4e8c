//! Incremental assembly: turn "a block device appeared" into zero or more
//! array-state changes.

use std::path::{Path, PathBuf};

use mdctl_core::mapfile::{MapFile, MapLock};
use mdctl_core::model::{disk_state, enough};
use mdctl_core::{BlockDevice, MdError, MdInfo, Result};
use mdctl_metadata::{guess_metadata, Metadata, Update};
use mdctl_monitor::client;
use mdctl_sysfs::{self as sysfs, SysArray};

use crate::mdopen::{choose_name, create_mddev, find_free_devnum, Trust};

#[derive(Debug, Clone, Default)]
pub struct IncrementalOpts {
    /// start as soon as a quorum is present, not only when complete
    pub run: bool,
    pub homehost: Option<String>,
    pub require_homehost: bool,
}

/// Decide how much to trust the array's own name.
pub fn trustworthiness(
    config_match: bool,
    st: &dyn Metadata,
    homehost: Option<&str>,
) -> Trust {
    if config_match {
        return Trust::Local;
    }
    if let Some(hh) = homehost {
        if st.match_home(hh).unwrap_or(false) {
            return Trust::Local;
        }
    }
    if st.match_home("any").unwrap_or(false) {
        return Trust::LocalAny;
    }
    Trust::Foreign
}

/// Members whose events are too old to be trusted at start time.
///
/// Returns (available-per-slot, devices to drop) given each member's
/// metadata view. The highest event count is authoritative; lower-counter
/// members must be re-added, not accepted.
pub fn partition_members(members: &[MdInfo], raid_disks: i32) -> (Vec<bool>, Vec<usize>) {
    let max_events = members.iter().map(|m| m.events).max().unwrap_or(0);
    let mut avail = vec![false; raid_disks.max(0) as usize];
    let mut reject = Vec::new();
    for (i, m) in members.iter().enumerate() {
        let role = m.disk.raid_disk;
        if m.disk.state & disk_state::FAULTY != 0 {
            reject.push(i);
            continue;
        }
        if m.events < max_events {
            reject.push(i);
            continue;
        }
        if role >= 0 && (role as usize) < avail.len() && !avail[role as usize] {
            avail[role as usize] = true;
        }
    }
    (avail, reject)
}

fn member_path(major: u32, minor: u32) -> PathBuf {
    PathBuf::from(format!("/dev/block/{}:{}", major, minor))
}

/// The policy hook for bare devices. The domain policy supplier is an
/// external collaborator; without one, bare devices are rejected.
fn try_spare(devname: &Path) -> Result<()> {
    log::info!(
        "{}: no recognisable metadata and no spare policy applies",
        devname.display()
    );
    Err(MdError::NoMagic)
}

/// The main entry point: classify the new device and attach it.
pub fn incremental(devname: &Path, opts: &IncrementalOpts) -> Result<()> {
    if !mdctl_core::devio::is_block_device(devname)? {
        return Err(MdError::NotBlockDevice(devname.display().to_string()));
    }
    let mut dfd = BlockDevice::open_excl(devname)?;

    let mut st = match guess_metadata(&mut dfd) {
        Ok(st) => st,
        Err(e) if e.is_probe_miss() => return try_spare(devname),
        Err(e) => return Err(e),
    };
    let info = st.getinfo()?;

    if info.is_container() {
        return incremental_container(devname, &mut *st, opts);
    }

    let mut trust = trustworthiness(false, &*st, opts.homehost.as_deref());
    let name_to_use = info.name.clone();
    if !name_to_use.is_empty() && trust != Trust::Local && !opts.require_homehost {
        // an unclaimed name is good enough to adopt
        trust = Trust::Local;
    }

    // everything from here mutates shared state; concurrent invocations
    // serialise on the map lock
    let map = MapFile::system();
    let mut lock = map.lock()?;

    let stat = nix::sys::stat::stat(devname).map_err(MdError::from)?;
    let (major, minor) = (
        nix::sys::stat::major(stat.st_rdev) as u32,
        nix::sys::stat::minor(stat.st_rdev) as u32,
    );

    let existing = lock.by_uuid(&info.uuid).map(|e| (e.devnum, e.path.clone()));
    let (devnum, chosen_name, mdfd) = match existing {
        Some((devnum, path)) => {
            let node = PathBuf::from(format!("/dev/md{}", devnum));
            match std::fs::OpenOptions::new().read(true).write(true).open(&node) {
                Ok(f) => (devnum, path, f),
                Err(_) => create_new_array(&mut lock, &*st, &info, &name_to_use, trust)?,
            }
        }
        None => create_new_array(&mut lock, &*st, &info, &name_to_use, trust)?,
    };
    let sra = SysArray::new(&mdctl_core::util::devnum_to_name(devnum));

    // reject unless the metadata matches a member already attached
    let attached = sra
        .read_info(sysfs::attrs::get::DEVS | sysfs::attrs::get::STATE)
        .map(|i| i.devs)
        .unwrap_or_default();
    if let Some(first) = attached.first() {
        let mut st2 = mdctl_metadata::handler_for_name(&st.name())
            .ok_or(MdError::WrongVersion(st.name()))?;
        let mut member = BlockDevice::open(&member_path(first.disk.major, first.disk.minor))?;
        st2.load(&mut member)?;
        st.compare(&*st2).map_err(|e| {
            log::error!(
                "metadata mismatch between {} and chosen array {}",
                devname.display(),
                chosen_name
            );
            e
        })?;
    }

    // the kernel takes the device from here
    drop(dfd);
    let dk = sysfs::MduDiskInfo {
        number: info.disk.number,
        major: major as i32,
        minor: minor as i32,
        raid_disk: info.disk.raid_disk,
        state: info.disk.state as i32,
    };
    match sysfs::add_new_disk(&mdfd, &dk) {
        Ok(()) => {}
        Err(MdError::Busy(_)) => {
            // a stale member with the same number may be present; evict any
            // whose events are behind and retry once
            find_reject(&sra, &*st, info.disk.number, info.events)?;
            sysfs::add_new_disk(&mdfd, &dk)?;
        }
        Err(e) => return Err(e),
    }

    lock.update(devnum, &st.text_version(), &info.uuid, &chosen_name)?;

    // can it start?
    let members = read_member_metadata(&sra, &*st)?;
    let (avail, stale) = partition_members(&members, info.array.raid_disks);
    for i in stale {
        let m = &members[i];
        log::info!(
            "not using old member {}:{} (events {})",
            m.disk.major,
            m.disk.minor,
            m.events
        );
    }
    let complete = avail.iter().filter(|a| **a).count() as i32 == info.array.raid_disks;
    let quorum = enough(
        info.array.level,
        info.array.raid_disks,
        info.array.layout,
        info.array.clean,
        &avail,
    );
    if !quorum {
        log::info!(
            "{} attached to {}, not enough to start",
            devname.display(),
            chosen_name
        );
        return Ok(());
    }
    if complete || (opts.run && quorum) {
        if trust == Trust::Foreign && !opts.run {
            sra.write_attr(None, "array_state", "read-auto")?;
        } else if sysfs::run_array(&mdfd).is_err() {
            sra.write_attr(None, "array_state", "read-auto")?;
        }
        log::info!(
            "{} attached to {}, which has been started",
            devname.display(),
            chosen_name
        );
    } else {
        log::info!(
            "{} attached to {}, {} of {} present",
            devname.display(),
            chosen_name,
            avail.iter().filter(|a| **a).count(),
            info.array.raid_disks
        );
    }
    Ok(())
}

fn create_new_array(
    lock: &mut MapLock,
    st: &dyn Metadata,
    info: &MdInfo,
    name_to_use: &str,
    trust: Trust,
) -> Result<(i32, String, std::fs::File)> {
    let devnum = find_free_devnum(lock);
    let name = choose_name(lock, name_to_use, trust, devnum);
    let (_node, mdfd) = create_mddev(devnum, &name)?;
    let sra = SysArray::new(&mdctl_core::util::devnum_to_name(devnum));
    let mut kinfo = info.clone();
    kinfo.sys_name = sra.sys_name.clone();
    sra.set_array(&kinfo)?;
    let path = if name.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/md{}", devnum)
    } else {
        format!("/dev/md/{}", name)
    };
    lock.update(devnum, &st.text_version(), &info.uuid, &path)?;
    Ok((devnum, path, mdfd))
}

/// Evict attached members that claim `number` with an older event count.
fn find_reject(sra: &SysArray, st: &dyn Metadata, number: i32, events: u64) -> Result<()> {
    let info = sra.read_info(sysfs::attrs::get::DEVS | sysfs::attrs::get::STATE)?;
    for d in &info.devs {
        let mut handler = mdctl_metadata::handler_for_name(&st.name())
            .ok_or(MdError::WrongVersion(st.name()))?;
        let Ok(mut dev) = BlockDevice::open(&member_path(d.disk.major, d.disk.minor)) else {
            continue;
        };
        if handler.load(&mut dev).is_err() {
            continue;
        }
        let minfo = handler.getinfo()?;
        if minfo.disk.number == number && minfo.events < events {
            let _ = sra.write_attr(Some(d.sys_name.as_str()), "state", "faulty");
            let _ = sra.write_attr(Some(d.sys_name.as_str()), "state", "remove");
        }
    }
    Ok(())
}

fn read_member_metadata(sra: &SysArray, st: &dyn Metadata) -> Result<Vec<MdInfo>> {
    let info = sra.read_info(
        sysfs::attrs::get::DEVS | sysfs::attrs::get::STATE | sysfs::attrs::get::OFFSET,
    )?;
    let mut out = Vec::new();
    for d in &info.devs {
        let mut handler = mdctl_metadata::handler_for_name(&st.name())
            .ok_or(MdError::WrongVersion(st.name()))?;
        let Ok(mut dev) = BlockDevice::open(&member_path(d.disk.major, d.disk.minor)) else {
            continue;
        };
        if handler.load(&mut dev).is_ok() {
            out.push(handler.getinfo()?);
        }
    }
    Ok(out)
}

/// Container path: hand the member to the container device and let the
/// monitor pick it up; then try to assemble the container's volumes.
fn incremental_container(
    devname: &Path,
    st: &mut dyn Metadata,
    _opts: &IncrementalOpts,
) -> Result<()> {
    let info = st.getinfo()?;
    let map = MapFile::system();
    let mut lock = map.lock()?;

    let (devnum, chosen, mdfd) = match lock.by_uuid(&info.uuid).map(|e| (e.devnum, e.path.clone()))
    {
        Some((devnum, path)) => {
            let node = format!("/dev/md{}", devnum);
            let f = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&node)
                .map_err(MdError::Io)?;
            (devnum, path, f)
        }
        None => create_new_array(&mut lock, st, &info, &info.text_version, Trust::Metadata)?,
    };
    let sra = SysArray::new(&mdctl_core::util::devnum_to_name(devnum));
    let stat = nix::sys::stat::stat(devname).map_err(MdError::from)?;
    let dk = sysfs::MduDiskInfo {
        number: info.disk.number,
        major: nix::sys::stat::major(stat.st_rdev) as i32,
        minor: nix::sys::stat::minor(stat.st_rdev) as i32,
        raid_disk: -1,
        state: 0,
    };
    sysfs::add_new_disk(&mdfd, &dk)?;
    lock.update(devnum, &st.text_version(), &info.uuid, &chosen)?;
    let _ = sra.uevent("change");
    drop(lock);

    let working = sra
        .read_info(sysfs::attrs::get::DEVS)
        .map(|i| i.devs.len())
        .unwrap_or(0);
    log::info!("container {} now has {} device(s)", chosen, working);

    // the monitor owns metadata from here; poke it so it can rescan (and,
    // for a degraded member array, try a rebuild)
    let container_name = mdctl_core::util::devnum_to_name(devnum);
    if client::ping_monitor(&container_name).is_err() {
        log::debug!("no monitor answered for {}", container_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(number: i32, role: i32, events: u64, state: u32) -> MdInfo {
        let mut m = MdInfo::default();
        m.disk.number = number;
        m.disk.raid_disk = role;
        m.disk.state = state;
        m.events = events;
        m
    }

    #[test]
    fn highest_events_win() {
        // S2: events 7,7,6 on a 3-disk raid5: slots 0,1 start, slot 2 must
        // be re-added
        let members = vec![
            member(0, 0, 7, disk_state::ACTIVE | disk_state::SYNC),
            member(1, 1, 7, disk_state::ACTIVE | disk_state::SYNC),
            member(2, 2, 6, disk_state::ACTIVE | disk_state::SYNC),
        ];
        let (avail, reject) = partition_members(&members, 3);
        assert_eq!(avail, vec![true, true, false]);
        assert_eq!(reject, vec![2]);
        assert!(enough(5, 3, 2, true, &avail));
    }

    #[test]
    fn lower_events_always_need_re_add() {
        let members = vec![
            member(0, 0, 8, disk_state::ACTIVE | disk_state::SYNC),
            member(1, 1, 7, disk_state::ACTIVE | disk_state::SYNC),
        ];
        let (avail, reject) = partition_members(&members, 2);
        assert_eq!(avail, vec![true, false]);
        assert_eq!(reject, vec![1]);
    }

    #[test]
    fn faulty_members_rejected() {
        let members = vec![
            member(0, 0, 7, disk_state::ACTIVE | disk_state::SYNC),
            member(1, 1, 7, disk_state::FAULTY),
        ];
        let (avail, reject) = partition_members(&members, 2);
        assert_eq!(avail, vec![true, false]);
        assert_eq!(reject, vec![1]);
    }

    #[test]
    fn no_quorum_without_enough_members() {
        let members = vec![member(0, 0, 7, disk_state::ACTIVE | disk_state::SYNC)];
        let (avail, _) = partition_members(&members, 3);
        assert!(!enough(5, 3, 2, true, &avail));
    }
}
