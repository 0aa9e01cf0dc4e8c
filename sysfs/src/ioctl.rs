//! Typed md ioctls. The request numbers are kernel ABI, consumed as the
//! opaque integers from the kernel headers.

use std::fs::File;
use std::os::fd::AsRawFd;

use mdctl_core::{MdError, Result};
use nix::libc::c_int;

pub const MD_MAJOR: u32 = 9;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MduVersion {
    pub major: c_int,
    pub minor: c_int,
    pub patchlevel: c_int,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MduArrayInfo {
    pub major_version: c_int,
    pub minor_version: c_int,
    pub patch_version: c_int,
    pub ctime: c_int,
    pub level: c_int,
    /// component size in KiB (32-bit; use sysfs `component_size` for truth)
    pub size: c_int,
    pub nr_disks: c_int,
    pub raid_disks: c_int,
    pub md_minor: c_int,
    pub not_persistent: c_int,
    pub utime: c_int,
    pub state: c_int,
    pub active_disks: c_int,
    pub working_disks: c_int,
    pub failed_disks: c_int,
    pub spare_disks: c_int,
    pub layout: c_int,
    /// bytes
    pub chunk_size: c_int,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MduDiskInfo {
    pub number: c_int,
    pub major: c_int,
    pub minor: c_int,
    pub raid_disk: c_int,
    pub state: c_int,
}

nix::ioctl_read!(raid_version, MD_MAJOR, 0x10, MduVersion);
nix::ioctl_read!(get_array_info_ioctl, MD_MAJOR, 0x11, MduArrayInfo);
nix::ioctl_read!(get_disk_info_ioctl, MD_MAJOR, 0x12, MduDiskInfo);
nix::ioctl_write_ptr!(add_new_disk_ioctl, MD_MAJOR, 0x21, MduDiskInfo);
nix::ioctl_write_ptr!(set_array_info_ioctl, MD_MAJOR, 0x23, MduArrayInfo);
nix::ioctl_none_bad!(run_array_ioctl, nix::request_code_none!(MD_MAJOR, 0x30));
nix::ioctl_none_bad!(stop_array_ioctl, nix::request_code_none!(MD_MAJOR, 0x32));
nix::ioctl_write_int_bad!(set_bitmap_file_ioctl, nix::request_code_none!(MD_MAJOR, 0x2b));

#[repr(C)]
pub struct MduBitmapFile {
    pub pathname: [u8; 4096],
}

nix::ioctl_read!(get_bitmap_file_ioctl, MD_MAJOR, 0x15, MduBitmapFile);

fn wrap(e: nix::Error, what: &str) -> MdError {
    match e {
        nix::Error::EBUSY => MdError::Busy(what.to_string()),
        nix::Error::ENOTTY | nix::Error::ENODEV => MdError::KernelUnsupported("md ioctl"),
        other => MdError::Io(std::io::Error::from_raw_os_error(other as i32)),
    }
}

/// True when the open file is an md device (`RAID_VERSION` answers).
pub fn md_get_version(fd: &File) -> Result<MduVersion> {
    let mut v = MduVersion::default();
    unsafe { raid_version(fd.as_raw_fd(), &mut v) }.map_err(|e| wrap(e, "version"))?;
    Ok(v)
}

/// `None` means the array is not active (ENODEV with the device open).
pub fn get_array_info(fd: &File) -> Result<Option<MduArrayInfo>> {
    let mut info = MduArrayInfo::default();
    match unsafe { get_array_info_ioctl(fd.as_raw_fd(), &mut info) } {
        Ok(_) => Ok(Some(info)),
        Err(nix::Error::ENODEV) => Ok(None),
        Err(e) => Err(wrap(e, "array info")),
    }
}

pub fn set_array_info(fd: &File, info: &MduArrayInfo) -> Result<()> {
    unsafe { set_array_info_ioctl(fd.as_raw_fd(), info) }
        .map(|_| ())
        .map_err(|e| wrap(e, "set array info"))
}

pub fn get_disk_info(fd: &File, number: i32) -> Result<MduDiskInfo> {
    let mut info = MduDiskInfo { number, ..Default::default() };
    unsafe { get_disk_info_ioctl(fd.as_raw_fd(), &mut info) }
        .map_err(|e| wrap(e, "disk info"))?;
    Ok(info)
}

pub fn add_new_disk(fd: &File, info: &MduDiskInfo) -> Result<()> {
    unsafe { add_new_disk_ioctl(fd.as_raw_fd(), info) }
        .map(|_| ())
        .map_err(|e| wrap(e, "add disk"))
}

pub fn run_array(fd: &File) -> Result<()> {
    unsafe { run_array_ioctl(fd.as_raw_fd()) }
        .map(|_| ())
        .map_err(|e| wrap(e, "run array"))
}

pub fn stop_array(fd: &File) -> Result<()> {
    unsafe { stop_array_ioctl(fd.as_raw_fd()) }
        .map(|_| ())
        .map_err(|e| wrap(e, "stop array"))
}

pub fn set_bitmap_file(fd: &File, bitmap: &File) -> Result<()> {
    unsafe { set_bitmap_file_ioctl(fd.as_raw_fd(), bitmap.as_raw_fd()) }
        .map(|_| ())
        .map_err(|e| wrap(e, "set bitmap file"))
}

/// Path of the external bitmap file, if one is attached.
pub fn get_bitmap_file(fd: &File) -> Result<Option<String>> {
    let mut buf = MduBitmapFile { pathname: [0; 4096] };
    unsafe { get_bitmap_file_ioctl(fd.as_raw_fd(), &mut buf) }
        .map_err(|e| wrap(e, "get bitmap file"))?;
    let end = buf.pathname.iter().position(|&b| b == 0).unwrap_or(0);
    if end == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf.pathname[..end]).into_owned()))
}
