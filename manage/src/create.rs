//! Creating a fresh array: initialise metadata, add members, persist, and
//! bring the kernel device up.

use std::path::{Path, PathBuf};

use mdctl_core::mapfile::MapFile;
use mdctl_core::model::disk_state;
use mdctl_core::{BlockDevice, DiskInfo, MdError, Result};
use mdctl_metadata::{handler_for_name, BitmapParams, CreateInfo, Metadata};
use mdctl_sysfs::SysArray;

use crate::mdopen::{choose_name, create_mddev, find_free_devnum, Trust};

#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub metadata: String,
    pub level: i32,
    pub raid_disks: i32,
    /// bytes; 0 picks the family default
    pub chunk_size: i32,
    pub layout: Option<i32>,
    /// sectors; 0 derives from the smallest member
    pub size: u64,
    pub name: String,
    pub homehost: Option<String>,
    pub internal_bitmap: bool,
    pub run: bool,
}

/// Build the array described by `opts` over `devices`. Returns the chosen
/// /dev path.
pub fn create(devices: &[PathBuf], opts: &CreateOpts) -> Result<PathBuf> {
    let meta_name = if opts.metadata.is_empty() { "default" } else { &opts.metadata };
    let mut st = handler_for_name(meta_name)
        .ok_or_else(|| MdError::WrongVersion(meta_name.to_string()))?;

    let mut opened: Vec<BlockDevice> = Vec::new();
    for path in devices {
        opened.push(BlockDevice::open_excl(path)?);
    }
    let (layout_default, chunk_default) = st.default_geometry(opts.level);
    let chunk = if opts.chunk_size != 0 { opts.chunk_size } else { chunk_default };
    let layout = opts.layout.unwrap_or(layout_default);

    // component size: smallest usable member, rounded down to the chunk
    let size = if opts.size != 0 {
        opts.size
    } else {
        let mut size = u64::MAX;
        for dev in &opened {
            size = size.min(st.avail_size(dev.size_sectors()?));
        }
        if chunk > 0 {
            size -= size % (chunk as u64 / 512);
        }
        size
    };
    if size == 0 || size == u64::MAX {
        return Err(MdError::TooSmall(0));
    }

    let ci = CreateInfo {
        level: opts.level,
        raid_disks: opts.raid_disks,
        spare_disks: devices.len() as i32 - opts.raid_disks,
        layout,
        chunk_size: chunk,
        size_sectors: size,
        name: opts.name.clone(),
        homehost: opts.homehost.clone(),
        uuid: None,
        md_minor: 0,
        clean: false,
    };
    st.init(&ci)?;
    if opts.internal_bitmap {
        st.add_internal_bitmap(&BitmapParams::default(), size)?;
    }

    for (number, dev) in opened.into_iter().enumerate() {
        let stat = nix::sys::stat::stat(dev.path()).map_err(MdError::from)?;
        let dk = DiskInfo {
            number: number as i32,
            major: nix::sys::stat::major(stat.st_rdev) as u32,
            minor: nix::sys::stat::minor(stat.st_rdev) as u32,
            raid_disk: number as i32,
            state: if (number as i32) < opts.raid_disks {
                disk_state::ACTIVE | disk_state::SYNC
            } else {
                0
            },
        };
        st.add_to_super(&dk, Some(dev))?;
    }
    st.write_init()?;
    activate(&mut *st, opts)
}

fn activate(st: &mut dyn Metadata, opts: &CreateOpts) -> Result<PathBuf> {
    let info = st.getinfo()?;
    let map = MapFile::system();
    let mut lock = map.lock()?;
    let devnum = find_free_devnum(&lock);
    let name = choose_name(&lock, &info.name, Trust::Local, devnum);
    let (node, mdfd) = create_mddev(devnum, &name)?;
    let sra = SysArray::new(&mdctl_core::util::devnum_to_name(devnum));
    let mut kinfo = info.clone();
    kinfo.sys_name = sra.sys_name.clone();
    sra.set_array(&kinfo)?;
    let path = if name.chars().all(|c| c.is_ascii_digit()) {
        node.display().to_string()
    } else {
        format!("/dev/md/{}", name)
    };
    lock.update(devnum, &st.text_version(), &info.uuid, &path)?;
    if opts.run {
        mdctl_sysfs::run_array(&mdfd)?;
    }
    Ok(PathBuf::from(path))
}

/// Examine one device: load whatever family is present and print it.
pub fn examine(devname: &Path, brief: bool, export: bool) -> Result<String> {
    let mut dev = BlockDevice::open(devname)?;
    let st = mdctl_metadata::guess_metadata(&mut dev)?;
    let mut out = Vec::new();
    if export {
        st.export_examine(&mut out)?;
    } else if brief {
        st.brief_examine(&mut out)?;
    } else {
        use std::io::Write;
        writeln!(out, "{}:", devname.display()).map_err(MdError::Io)?;
        st.examine(&mut out)?;
    }
    String::from_utf8(out).map_err(|_| MdError::AllocationFailure)
}
