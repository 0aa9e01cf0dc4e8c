//! Crash-recovery: a valid backup record on a spare is found, replayed into
//! the array with the new geometry, and the recorded reshape position moves
//! past the replayed region. Running it again changes nothing.

use mdctl_core::model::disk_state;
use mdctl_core::{BlockDevice, DiskInfo};
use mdctl_manage::geometry::geo_map;
use mdctl_manage::grow_restart;
use mdctl_metadata::backup::BackupSuper;
use mdctl_metadata::endian::Le64;
use mdctl_metadata::super1::Super1;
use mdctl_metadata::{CreateInfo, Metadata};

const CHUNK: u64 = 32 * 1024;
const COMPONENT: u64 = 1 << 20; // sectors
const BLOCKS: u64 = 384; // critical-section sectors, lcm of 2- and 3-wide stripes

struct Rig {
    files: Vec<tempfile::NamedTempFile>,
    uuid: [u8; 16],
    data_offset: u64,
    utime: u64,
}

fn dev_of(tf: &tempfile::NamedTempFile) -> BlockDevice {
    BlockDevice::from_file(tf.reopen().unwrap(), tf.path())
}

/// Four members (new geometry) plus one spare, all carrying v1.2
/// superblocks for the same raid5 array.
fn build_rig() -> Rig {
    let mut st = Super1::with_minor(2);
    st.init(&CreateInfo {
        level: 5,
        raid_disks: 4,
        spare_disks: 1,
        layout: 2,
        chunk_size: CHUNK as i32,
        size_sectors: COMPONENT,
        name: "grown".into(),
        clean: true,
        ..Default::default()
    })
    .unwrap();
    let uuid = st.uuid().unwrap();

    let mut files = Vec::new();
    for n in 0..5 {
        let tf = tempfile::NamedTempFile::new().unwrap();
        tf.as_file().set_len((1 << 21) * 512).unwrap();
        let dk = DiskInfo {
            number: n,
            major: 8,
            minor: n as u32 * 16,
            raid_disk: if n < 4 { n } else { -1 },
            state: if n < 4 { disk_state::ACTIVE | disk_state::SYNC } else { 0 },
        };
        st.add_to_super(&dk, Some(dev_of(&tf))).unwrap();
        files.push(tf);
    }
    st.write_init().unwrap();

    let mut dev = dev_of(&files[0]);
    let mut probe = Super1::with_minor(2);
    probe.load(&mut dev).unwrap();
    let info = probe.getinfo().unwrap();
    Rig { files, uuid, data_offset: info.data_offset, utime: info.array.utime }
}

fn write_backup(rig: &Rig) -> Vec<u8> {
    // the spare carries the record pair around a patterned data region
    let devstart = rig.data_offset + COMPONENT - BLOCKS - 8;
    let mut spare = dev_of(&rig.files[4]);
    let payload: Vec<u8> = (0..BLOCKS * 512).map(|i| (i % 251) as u8).collect();
    spare.write_at(devstart * 512, &payload).unwrap();

    let mut bsb = BackupSuper::default();
    bsb.set_uuid = rig.uuid;
    bsb.mtime = Le64::new(rig.utime);
    bsb.devstart = Le64::new(devstart);
    bsb.arraystart = Le64::new(0);
    bsb.length = Le64::new(BLOCKS);
    bsb.seal();
    bsb.write_around(&mut spare, devstart * 512, BLOCKS * 512).unwrap();
    payload
}

fn restart_info(rig: &Rig) -> mdctl_core::MdInfo {
    let mut info = mdctl_core::MdInfo::default();
    info.uuid = rig.uuid;
    info.array.utime = rig.utime;
    info.array.level = 5;
    info.array.layout = 2;
    info.array.raid_disks = 4;
    info.array.chunk_size = CHUNK as i32;
    info.new_level = 5;
    info.new_chunk = CHUNK as i32;
    info.new_layout = 2;
    info.delta_disks = 1;
    info.reshape_active = true;
    info.reshape_progress = 0;
    info.component_size = COMPONENT;
    info
}

#[test]
fn replay_restores_data_and_advances_progress() {
    let rig = build_rig();
    let payload = write_backup(&rig);
    let mut info = restart_info(&rig);

    let mut members: Vec<Option<BlockDevice>> =
        rig.files[..4].iter().map(|tf| Some(dev_of(tf))).collect();
    let mut spares = vec![dev_of(&rig.files[4])];
    let mut st = Super1::with_minor(2);

    let replayed =
        grow_restart(&mut st, &mut info, &mut members, &mut spares, None).unwrap();
    assert!(replayed);
    assert_eq!(info.reshape_progress, BLOCKS);

    // the replayed bytes landed where the new 4-disk geometry puts them
    let chunks = (BLOCKS * 512) / CHUNK;
    for ci in 0..chunks {
        let stripe = ci / 3;
        let block = (ci % 3) as i32;
        let disk = geo_map(block, stripe, 4, 5, 2) as usize;
        let mut got = vec![0u8; CHUNK as usize];
        members[disk]
            .as_mut()
            .unwrap()
            .read_at((rig.data_offset + stripe * (CHUNK / 512)) * 512, &mut got)
            .unwrap();
        let want = &payload[(ci * CHUNK) as usize..((ci + 1) * CHUNK) as usize];
        assert_eq!(got, want, "chunk {} on disk {}", ci, disk);
    }

    // per-member superblocks recorded the new position
    for tf in &rig.files[..4] {
        let mut dev = dev_of(tf);
        let mut probe = Super1::with_minor(2);
        probe.load(&mut dev).unwrap();
        let minfo = probe.getinfo().unwrap();
        assert_eq!(minfo.reshape_progress, BLOCKS);
    }
}

#[test]
fn completed_reshape_restart_is_a_noop() {
    let rig = build_rig();
    let _payload = write_backup(&rig);
    let mut info = restart_info(&rig);
    // the kernel already passed the backed-up region
    info.reshape_progress = BLOCKS + 1;

    let mut members: Vec<Option<BlockDevice>> =
        rig.files[..4].iter().map(|tf| Some(dev_of(tf))).collect();
    let mut spares = vec![dev_of(&rig.files[4])];
    let mut st = Super1::with_minor(2);

    let before: Vec<Vec<u8>> = rig.files[..4]
        .iter()
        .map(|tf| {
            let mut dev = dev_of(tf);
            let mut buf = vec![0u8; 64 * 1024];
            dev.read_at(rig.data_offset * 512, &mut buf).unwrap();
            buf
        })
        .collect();

    let replayed =
        grow_restart(&mut st, &mut info, &mut members, &mut spares, None).unwrap();
    assert!(!replayed);
    assert_eq!(info.reshape_progress, BLOCKS + 1);

    for (i, tf) in rig.files[..4].iter().enumerate() {
        let mut dev = dev_of(tf);
        let mut buf = vec![0u8; 64 * 1024];
        dev.read_at(rig.data_offset * 512, &mut buf).unwrap();
        assert_eq!(buf, before[i], "member {} was written during a no-op restart", i);
    }
}

#[test]
fn stale_or_corrupt_backups_are_ignored() {
    let rig = build_rig();
    write_backup(&rig);
    // corrupt the trailing record
    {
        let mut spare = dev_of(&rig.files[4]);
        let off = (rig.data_offset + COMPONENT - 8) * 512 + 20;
        let mut b = [0u8; 1];
        spare.read_at(off, &mut b).unwrap();
        b[0] ^= 0xff;
        spare.write_at(off, &b).unwrap();
    }
    let mut info = restart_info(&rig);
    let mut members: Vec<Option<BlockDevice>> =
        rig.files[..4].iter().map(|tf| Some(dev_of(tf))).collect();
    let mut spares = vec![dev_of(&rig.files[4])];
    let mut st = Super1::with_minor(2);
    let err = grow_restart(&mut st, &mut info, &mut members, &mut spares, None);
    assert!(matches!(err, Err(mdctl_core::MdError::BackupMissing)));
}
