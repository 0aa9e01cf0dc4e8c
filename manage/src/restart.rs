//! Restart-after-crash: find a critical-section backup on a spare or backup
//! file, replay it into the array, and advance the recorded reshape
//! position.

use std::path::Path;

use mdctl_core::{BlockDevice, MdError, MdInfo, Result};
use mdctl_metadata::backup::BackupSuper;
use mdctl_metadata::endian::OnDisk;
use mdctl_metadata::{Metadata, Update};

use crate::geometry::restore_stripes;

fn record_matches(bsb: &BackupSuper, info: &MdInfo, what: &str) -> bool {
    if bsb.verify().is_err() {
        log::debug!("{}: bad backup-metadata checksum", what);
        return false;
    }
    if bsb.set_uuid != info.uuid {
        log::debug!("{}: wrong uuid on backup-metadata", what);
        return false;
    }
    if bsb.check_mtime(info.array.utime).is_err() {
        log::debug!("{}: too-old timestamp on backup-metadata", what);
        return false;
    }
    true
}

/// Does the record cover work the kernel has not redone yet?
fn has_new_data(bsb: &BackupSuper, info: &MdInfo) -> bool {
    let growing = info.delta_disks >= 0;
    let covers = |start: u64, len: u64| {
        if growing {
            start + len >= info.reshape_progress
        } else {
            start < info.reshape_progress
        }
    };
    if covers(bsb.arraystart.get(), bsb.length.get()) {
        return true;
    }
    bsb.has_second_window() && covers(bsb.arraystart2.get(), bsb.length2.get())
}

fn replay(
    bsb: &BackupSuper,
    source: &mut BlockDevice,
    members: &mut [Option<BlockDevice>],
    offsets: &[u64],
    info: &MdInfo,
) -> Result<()> {
    let chunk = if info.new_chunk != 0 { info.new_chunk } else { info.array.chunk_size };
    let level = if info.reshape_active && info.new_level != 0 {
        info.new_level
    } else {
        info.array.level
    };
    let layout = if info.reshape_active && info.new_layout != 0 {
        info.new_layout
    } else {
        info.array.layout
    };
    restore_stripes(
        members,
        offsets,
        info.array.raid_disks,
        chunk as u64,
        level,
        layout,
        source,
        bsb.devstart.get() * 512,
        bsb.arraystart.get() * 512,
        bsb.length.get() * 512,
    )?;
    if bsb.has_second_window() && bsb.length2.get() != 0 {
        restore_stripes(
            members,
            offsets,
            info.array.raid_disks,
            chunk as u64,
            level,
            layout,
            source,
            (bsb.devstart.get() + bsb.devstart2.get()) * 512,
            bsb.arraystart2.get() * 512,
            bsb.length2.get() * 512,
        )?;
    }
    Ok(())
}

/// Inspect every candidate and the backup file; replay the first acceptable
/// record and persist the advanced reshape position to all members.
///
/// Returns `Ok(false)` when every record found was already obsolete (an
/// already-completed reshape restarts as a no-op), `Err(BackupMissing)` when
/// nothing acceptable was found at all.
pub fn grow_restart(
    st: &mut dyn Metadata,
    info: &mut MdInfo,
    members: &mut [Option<BlockDevice>],
    spares: &mut [BlockDevice],
    backup_file: Option<&Path>,
) -> Result<bool> {
    if info.new_level != info.array.level && info.reshape_active {
        // level changes are instantaneous; nothing to replay
        return Err(MdError::BackupMissing);
    }
    let mut saw_obsolete = false;

    // member data offsets, for the replay target geometry
    let mut offsets = vec![0u64; members.len()];
    for (i, m) in members.iter_mut().enumerate() {
        if let Some(dev) = m.as_mut() {
            if st.load(dev).is_ok() {
                offsets[i] = st.getinfo()?.data_offset * 512;
                st.free_super();
            }
        }
    }

    let mut candidates: Vec<(String, Option<usize>)> = Vec::new();
    for i in 0..spares.len() {
        candidates.push((format!("device-{}", i), Some(i)));
    }
    if let Some(bf) = backup_file {
        candidates.push((bf.display().to_string(), None));
    }

    for (what, idx) in candidates {
        let (mut source, record_off) = match idx {
            Some(i) => {
                let dev = &mut spares[i];
                if st.load(dev).is_err() {
                    continue;
                }
                let dinfo = st.getinfo()?;
                st.free_super();
                // the trailing record copy sits 8 sectors before the end of
                // the data area
                let off = (dinfo.data_offset + dinfo.component_size - 8) * 512;
                (None, off)
            }
            None => {
                let bf = backup_file.unwrap();
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .open(bf)
                    .map_err(|e| {
                        log::warn!("backup file {} inaccessible: {}", bf.display(), e);
                        MdError::Io(e)
                    });
                match file {
                    Ok(f) => (Some(BlockDevice::from_file(f, bf)), 0),
                    Err(_) => continue,
                }
            }
        };

        let dev: &mut BlockDevice = match idx {
            Some(i) => &mut spares[i],
            None => source.as_mut().unwrap(),
        };
        let Ok(bsb) = BackupSuper::read_at(dev, record_off) else { continue };
        if !bsb.magic.starts_with(b"md_backup_data") {
            log::debug!("{}: no backup metadata", what);
            continue;
        }
        if !record_matches(&bsb, info, &what) {
            continue;
        }
        if !has_new_data(&bsb, info) {
            log::info!("backup-metadata found on {} but is not needed", what);
            saw_obsolete = true;
            continue;
        }
        // the leading duplicate 4K before the data must agree
        let lead_off = bsb.devstart.get() * 512;
        if lead_off >= 4096 {
            match BackupSuper::read_at(dev, lead_off - 4096) {
                Ok(lead) => {
                    let n = bsb.compare_len();
                    if lead.as_bytes()[..n] != bsb.as_bytes()[..n] {
                        log::warn!("{}: secondary backup-metadata does not match", what);
                        continue;
                    }
                }
                Err(_) => {
                    log::warn!("{}: cannot read secondary backup-metadata", what);
                    continue;
                }
            }
        }

        log::info!("restoring critical section from {}", what);
        replay(&bsb, dev, members, &offsets, info)?;

        // advance the reshape position past the replayed region
        let growing = info.delta_disks >= 0;
        let mut progress = if growing {
            bsb.arraystart.get() + bsb.length.get()
        } else {
            bsb.arraystart.get()
        };
        if bsb.has_second_window() {
            let p2 = if growing {
                bsb.arraystart2.get() + bsb.length2.get()
            } else {
                bsb.arraystart2.get()
            };
            progress = if growing { progress.max(p2) } else { progress.min(p2) };
        }
        info.reshape_progress = progress;

        // persist per-member superblocks
        for m in members.iter_mut().flatten() {
            if st.load(m).is_err() {
                continue;
            }
            let mut minfo = st.getinfo()?;
            minfo.reshape_progress = progress;
            st.update(&mut minfo, &Update::ReshapeProgress(progress))?;
            st.store(m)?;
            st.free_super();
        }
        return Ok(true);
    }

    if saw_obsolete {
        // an already-completed reshape needs nothing replayed
        return Ok(false);
    }
    Err(MdError::BackupMissing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdctl_metadata::endian::Le64;

    fn backup(start: u64, len: u64) -> BackupSuper {
        let mut b = BackupSuper::default();
        b.arraystart = Le64::new(start);
        b.length = Le64::new(len);
        b.seal();
        b
    }

    #[test]
    fn overlap_detection_growing() {
        let mut info = MdInfo::default();
        info.delta_disks = 1;
        info.reshape_progress = 500;
        // ends before progress: obsolete
        assert!(!has_new_data(&backup(0, 384), &info));
        // reaches progress: still needed
        assert!(has_new_data(&backup(200, 300), &info));
    }

    #[test]
    fn overlap_detection_shrinking() {
        let mut info = MdInfo::default();
        info.delta_disks = -1;
        info.reshape_progress = 500;
        assert!(!has_new_data(&backup(500, 100), &info));
        assert!(has_new_data(&backup(400, 100), &info));
    }

    #[test]
    fn second_window_counts() {
        let mut b = backup(0, 100);
        b.enable_second_window();
        b.arraystart2 = Le64::new(600);
        b.length2 = Le64::new(100);
        b.seal();
        let mut info = MdInfo::default();
        info.delta_disks = 1;
        info.reshape_progress = 500;
        assert!(has_new_data(&b, &info));
    }
}
