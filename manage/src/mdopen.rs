//! Creating and opening md device nodes.

use std::fs::File;
use std::path::{Path, PathBuf};

use mdctl_core::mapfile::MapLock;
use mdctl_core::util::check_env;
use mdctl_core::{MdError, Result};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

pub const MD_MAJOR: u64 = 9;

/// How much we trust the name recorded in the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// our array (config or homehost match): use its name
    Local,
    /// homehost is "any"; normalised to Local by the caller
    LocalAny,
    /// someone else's array: numbers only
    Foreign,
    /// nameless container: named by metadata type
    Metadata,
}

/// Pick a free md device number, preferring high numbers so boot-time
/// arrays keep the low ones.
pub fn find_free_devnum(map: &MapLock) -> i32 {
    for num in (0..=127).rev() {
        if map.by_devnum(num).is_some() {
            continue;
        }
        if Path::new(&format!("/sys/block/md{}", num)).exists() {
            continue;
        }
        return num;
    }
    // all of 0..=127 busy; walk upward
    let mut num = 128;
    loop {
        if map.by_devnum(num).is_none()
            && !Path::new(&format!("/sys/block/md{}", num)).exists()
        {
            return num;
        }
        num += 1;
    }
}

/// Choose the /dev/md/ name for a new array.
///
/// Local arrays keep their metadata name (minus any `host:` prefix);
/// conflicts get `_N` suffixes; foreign arrays only ever get numbers.
pub fn choose_name(map: &MapLock, meta_name: &str, trust: Trust, devnum: i32) -> String {
    let trust = if trust == Trust::LocalAny { Trust::Local } else { trust };
    let base = match trust {
        Trust::Local | Trust::Metadata => {
            let name = meta_name.split_once(':').map(|(_, n)| n).unwrap_or(meta_name);
            if name.is_empty() {
                return format!("{}", devnum);
            }
            name.to_string()
        }
        _ => return format!("{}", devnum),
    };
    if map.by_name(&base).is_none() {
        return base;
    }
    let mut n = 1;
    loop {
        let cand = format!("{}_{}", base, n);
        if map.by_name(&cand).is_none() {
            return cand;
        }
        n += 1;
    }
}

/// Create the device node (via udev when present, mknod otherwise) and open
/// it exclusively.
pub fn create_mddev(devnum: i32, name: &str) -> Result<(PathBuf, File)> {
    let node = PathBuf::from(format!("/dev/md{}", devnum));
    let use_udev = !check_env("MDADM_NO_UDEV") && Path::new("/run/udev/control").exists();
    if !node.exists() && !use_udev {
        mknod(
            &node,
            SFlag::S_IFBLK,
            Mode::from_bits_truncate(0o600),
            makedev(MD_MAJOR, devnum as u64),
        )
        .map_err(MdError::from)?;
    }
    if !use_udev && !name.is_empty() {
        let link = PathBuf::from(format!("/dev/md/{}", name));
        let _ = std::fs::create_dir_all("/dev/md");
        let _ = std::os::unix::fs::symlink(&node, &link);
    }
    // opening the node activates the kernel device
    let mut tries = 0;
    loop {
        match std::fs::OpenOptions::new().read(true).write(true).open(&node) {
            Ok(f) => return Ok((node, f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && use_udev && tries < 25 => {
                // udev has not made the node yet
                std::thread::sleep(std::time::Duration::from_millis(200));
                tries += 1;
            }
            Err(e) => return Err(MdError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdctl_core::mapfile::MapFile;

    #[test]
    fn name_choice_strips_host_and_numbers_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let map = MapFile::at(dir.path());
        let mut lock = map.lock().unwrap();
        assert_eq!(choose_name(&lock, "myhost:data", Trust::Local, 127), "data");
        assert_eq!(choose_name(&lock, "myhost:data", Trust::Foreign, 125), "125");
        assert_eq!(choose_name(&lock, "", Trust::Local, 126), "126");
        lock.update(3, "1.2", &[1; 16], "/dev/md/data").unwrap();
        // the taken name gets a suffix... but only while md3 exists, which
        // it does not in a test environment, so the stale entry is ignored
        // only by callers that re-validate; the chooser is conservative
        assert_eq!(choose_name(&lock, "data", Trust::Local, 127), "data_1");
    }

    #[test]
    fn local_any_behaves_like_local() {
        let dir = tempfile::tempdir().unwrap();
        let map = MapFile::at(dir.path());
        let lock = map.lock().unwrap();
        assert_eq!(choose_name(&lock, "h:a", Trust::LocalAny, 9), "a");
    }
}
