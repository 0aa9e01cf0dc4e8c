//! Cross-family discovery: a device is recognised by exactly the family
//! that wrote it, in the fixed probe order, and families never mix.

use mdctl_core::model::level;
use mdctl_core::{BlockDevice, DiskInfo, MdError};
use mdctl_metadata::{guess_metadata, CreateInfo, Family, Metadata};

fn scratch(sectors: u64) -> (tempfile::NamedTempFile, BlockDevice) {
    let tf = tempfile::NamedTempFile::new().unwrap();
    tf.as_file().set_len(sectors * 512).unwrap();
    let dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
    (tf, dev)
}

fn disk(n: i32) -> DiskInfo {
    DiskInfo {
        number: n,
        major: 8,
        minor: n as u32 * 16,
        raid_disk: n,
        state: mdctl_core::model::disk_state::ACTIVE | mdctl_core::model::disk_state::SYNC,
    }
}

#[test]
fn blank_device_has_no_magic() {
    let (_tf, mut dev) = scratch(1 << 18);
    assert!(matches!(guess_metadata(&mut dev), Err(MdError::NoMagic)));
}

#[test]
fn v1_is_recognised() {
    let mut st = mdctl_metadata::super1::Super1::with_minor(2);
    st.init(&CreateInfo {
        level: 1,
        raid_disks: 2,
        chunk_size: 64 * 1024,
        size_sectors: 1 << 16,
        name: "probe".into(),
        ..Default::default()
    })
    .unwrap();
    let (tf, dev) = scratch(1 << 18);
    st.add_to_super(&disk(0), Some(dev)).unwrap();
    st.write_init().unwrap();

    let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
    let found = guess_metadata(&mut dev).unwrap();
    assert_eq!(found.family(), Family::V1);
    assert_eq!(found.name(), "1.2");
}

#[test]
fn v090_is_recognised() {
    let mut st = mdctl_metadata::super0::Super0::new();
    st.init(&CreateInfo {
        level: 1,
        raid_disks: 2,
        chunk_size: 64 * 1024,
        size_sectors: 1 << 16,
        md_minor: 7,
        ..Default::default()
    })
    .unwrap();
    let (tf, mut dev) = scratch(1 << 18);
    st.store(&mut dev).unwrap();

    let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
    let found = guess_metadata(&mut dev).unwrap();
    assert_eq!(found.family(), Family::V090);
}

#[test]
fn imsm_is_recognised() {
    let mut st = mdctl_metadata::imsm::Imsm::new();
    st.init(&CreateInfo { level: level::CONTAINER, ..Default::default() }).unwrap();
    let (tf, dev) = scratch(1 << 18);
    st.add_to_super(&DiskInfo { number: 0, major: 8, minor: 0, ..Default::default() }, Some(dev))
        .unwrap();
    st.write_init().unwrap();

    let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
    let found = guess_metadata(&mut dev).unwrap();
    assert_eq!(found.family(), Family::Imsm);
    assert!(found.is_external());
}

#[test]
fn ddf_is_recognised() {
    let mut st = mdctl_metadata::ddf::Ddf::new();
    st.init(&CreateInfo { level: level::CONTAINER, ..Default::default() }).unwrap();
    let (tf, dev) = scratch(1 << 18);
    st.add_to_super(&DiskInfo { number: 0, major: 8, minor: 0, ..Default::default() }, Some(dev))
        .unwrap();
    st.write_init().unwrap();

    let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
    let found = guess_metadata(&mut dev).unwrap();
    assert_eq!(found.family(), Family::Ddf);
}

#[test]
fn families_refuse_to_mix() {
    let mut v1 = mdctl_metadata::super1::Super1::with_minor(2);
    v1.init(&CreateInfo {
        level: 1,
        raid_disks: 2,
        chunk_size: 64 * 1024,
        size_sectors: 1 << 16,
        name: "a".into(),
        ..Default::default()
    })
    .unwrap();
    let mut v0 = mdctl_metadata::super0::Super0::new();
    v0.init(&CreateInfo {
        level: 1,
        raid_disks: 2,
        chunk_size: 64 * 1024,
        size_sectors: 1 << 16,
        ..Default::default()
    })
    .unwrap();
    assert!(matches!(
        v1.compare(&v0),
        Err(MdError::IncompatibleMetadata(_))
    ));
}
