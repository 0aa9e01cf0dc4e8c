//! Pid-file handshake: exactly one monitor per container.

use std::io::Read;
use std::path::PathBuf;

use mdctl_core::{MdError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::msg::MDMON_DIR;

pub fn pid_path(devname: &str) -> PathBuf {
    PathBuf::from(format!("{}/{}.pid", MDMON_DIR, devname))
}

/// Create the pid file with `O_EXCL`; EEXIST means an incumbent holds the
/// container.
pub fn make_pidfile(devname: &str) -> Result<()> {
    std::fs::create_dir_all(MDMON_DIR).map_err(MdError::Io)?;
    let path = pid_path(devname);
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts.open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            MdError::AlreadyAssembled(path.display().to_string())
        } else {
            MdError::Io(e)
        }
    })?;
    use std::io::Write;
    writeln!(f, "{}", std::process::id()).map_err(MdError::Io)?;
    Ok(())
}

pub fn read_pid(devname: &str) -> Option<i32> {
    let mut buf = String::new();
    std::fs::File::open(pid_path(devname))
        .ok()?
        .read_to_string(&mut buf)
        .ok()?;
    buf.trim().parse().ok()
}

pub fn remove_pidfile(devname: &str) {
    let _ = std::fs::remove_file(pid_path(devname));
    let _ = std::fs::remove_file(format!("{}/{}.sock", MDMON_DIR, devname));
}

/// Kill a previous incumbent, but only after verifying it really is a
/// monitor process (first rule of survival: don't off yourself).
pub fn try_kill_monitor(pid: i32, monitor_name: &str) -> bool {
    if pid == std::process::id() as i32 {
        return false;
    }
    let mut cmdline = String::new();
    let path = format!("/proc/{}/cmdline", pid);
    match std::fs::File::open(&path).and_then(|mut f| f.read_to_string(&mut cmdline)) {
        Ok(_) if cmdline.contains(monitor_name) => {
            kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
        }
        _ => false,
    }
}
