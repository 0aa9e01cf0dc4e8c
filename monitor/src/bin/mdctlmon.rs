//! mdctlmon: monitor one external-metadata container.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use mdctl_core::util::{check_env, devnum_from_name, devnum_to_name};
use mdctl_core::{MdError, Result};
use mdctl_metadata::ContainerMember;
use mdctl_monitor::{client, context, manage, monitor, pidfile};
use mdctl_sysfs::SysArray;
use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{fork, setsid, ForkResult};

static SIGTERM_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_sig: i32) {
    SIGTERM_SEEN.store(true, Ordering::Release);
}

fn usage() -> ! {
    eprintln!("Usage: mdctlmon [--takeover] CONTAINER");
    std::process::exit(2);
}

fn main() {
    env_logger::init();
    let mut takeover = false;
    let mut container: Option<String> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--takeover" | "-t" => takeover = true,
            "--help" | "-h" => usage(),
            other if !other.starts_with('-') => container = Some(other.to_string()),
            _ => usage(),
        }
    }
    let Some(container) = container else { usage() };
    match run(&container, takeover) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("mdctlmon: {}: {}", container, e);
            std::process::exit(e.exit_code());
        }
    }
}

fn container_devnum(name: &str) -> Result<(String, i32)> {
    if let Some(devnum) = devnum_from_name(name.trim_start_matches("/dev/")) {
        return Ok((devnum_to_name(devnum), devnum));
    }
    let st = nix::sys::stat::stat(name).map_err(MdError::from)?;
    let minor = nix::sys::stat::minor(st.st_rdev) as i32;
    Ok((devnum_to_name(minor), minor))
}

fn run(container_arg: &str, takeover: bool) -> Result<()> {
    let (devname, devnum) = container_devnum(container_arg)?;
    let sra = SysArray::new(&devname);
    let info = sra.read_info(
        mdctl_sysfs::attrs::get::VERSION
            | mdctl_sysfs::attrs::get::LEVEL
            | mdctl_sysfs::attrs::get::DEVS,
    )?;
    if !info.is_external() {
        return Err(MdError::IncompatibleMetadata(format!(
            "{} does not use external metadata",
            devname
        )));
    }
    let mut st = mdctl_metadata::handler_for_name(&info.text_version)
        .ok_or_else(|| MdError::WrongVersion(info.text_version.clone()))?;

    // become a daemon unless debugging
    if !check_env("MDADM_NO_MDMON") {
        match unsafe { fork() }.map_err(MdError::from)? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {
                let _ = setsid();
            }
        }
    }

    // SIGUSR1-style wakeups are channels now; only SIGTERM stays a signal
    unsafe {
        let term = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
        let _ = sigaction(Signal::SIGTERM, &term);
        let ign = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let _ = sigaction(Signal::SIGPIPE, &ign);
    }

    // dislodge any incumbent before claiming the pid file
    if let Some(victim) = pidfile::read_pid(&devname) {
        if !takeover {
            if client::ping_monitor(&devname).is_ok() {
                return Err(MdError::AlreadyAssembled(format!(
                    "{} already managed",
                    devname
                )));
            }
        }
        if pidfile::try_kill_monitor(victim, "mdctlmon") {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        pidfile::remove_pidfile(&devname);
    }

    let members: Vec<ContainerMember> = info
        .devs
        .iter()
        .map(|d| ContainerMember {
            major: d.disk.major,
            minor: d.disk.minor,
            path: PathBuf::from(format!("/dev/block/{}:{}", d.disk.major, d.disk.minor)),
        })
        .collect();
    st.load_container(&members)?;

    pidfile::make_pidfile(&devname)?;
    let listener = manage::make_control_sock(&devname)?;

    // the monitor must never be paged out
    let _ = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE);

    let container_path = PathBuf::from(format!("/dev/{}", devname));
    let (mon, mgr) = context::wire(st, &devname, devnum, container_path)?;
    let sigterm = mon.sigterm.clone();
    std::thread::Builder::new()
        .name("monitor".into())
        .spawn(move || monitor::monitor_loop(mon))
        .map_err(MdError::Io)?;

    // mirror the latched signal into the shared flag
    std::thread::spawn(move || loop {
        if SIGTERM_SEEN.load(Ordering::Acquire) {
            sigterm.store(true, Ordering::Release);
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    manage::manager_loop(mgr, listener);
    pidfile::remove_pidfile(&devname);
    Ok(())
}
