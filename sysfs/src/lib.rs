//! The narrow, typed boundary to the kernel's MD driver: sysfs attribute
//! access and the md ioctl set.

pub mod attrs;
pub mod ioctl;
pub mod mdstat;

pub use attrs::{
    fd_read_string, fd_read_u64, wait_attr_change, ArrayState, SyncAction, SysArray,
};
pub use ioctl::{
    add_new_disk, get_array_info, get_disk_info, md_get_version, run_array, set_array_info,
    set_bitmap_file, stop_array, MduArrayInfo, MduDiskInfo,
};

use mdctl_core::Result;
use std::path::Path;

/// Check that `devnum` is the one and only holder of the component device
/// `major:minor`; protects against attaching a disk that some other array
/// already claims.
pub fn unique_holder(devnum: i32, major: u32, minor: u32) -> Result<bool> {
    let dir = format!("/sys/dev/block/{}:{}/holders", major, minor);
    let entries = match std::fs::read_dir(Path::new(&dir)) {
        Ok(e) => e,
        Err(_) => return Ok(false),
    };
    let mut found = false;
    for ent in entries.flatten() {
        let name = ent.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match mdctl_core::util::devnum_from_name(&name) {
            Some(n) if n == devnum => found = true,
            _ => return Ok(false),
        }
    }
    Ok(found)
}
