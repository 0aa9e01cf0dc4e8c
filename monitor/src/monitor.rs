//! The monitor thread: watch kernel state, reflect it into metadata, and
//! activate spares. Only this thread ever writes metadata.
//!
//! It may block only in poll(2) and in device I/O during `sync_metadata`.

use std::io::Read;
use std::sync::atomic::Ordering;

use mdctl_core::model::{dev_state, MAX_SECTOR};
use mdctl_core::{MdError, Result};
use mdctl_metadata::Metadata;
use mdctl_sysfs::attrs::parse_dev_state;
use mdctl_sysfs::{fd_read_string, fd_read_u64, ArrayState, SyncAction};
use nix::poll::{poll, PollFd, PollFlags};

use crate::context::{ActiveArray, ManagerMsg, MonitorSide};
use crate::msg::Command;
use crate::pidfile::remove_pidfile;

fn read_state(a: &ActiveArray) -> ArrayState {
    fd_read_string(&a.state_fd)
        .ok()
        .and_then(|s| ArrayState::parse(&s))
        .unwrap_or(ArrayState::Broken)
}

fn read_action(a: &ActiveArray) -> SyncAction {
    fd_read_string(&a.action_fd)
        .ok()
        .and_then(|s| SyncAction::parse(&s))
        .unwrap_or(SyncAction::Idle)
}

fn get_resync_start(a: &mut ActiveArray) {
    if let Some(fd) = a.resync_fd.as_ref() {
        if let Ok(v) = fd_read_u64(fd) {
            a.resync_start = v;
        }
    }
}

fn is_resync_complete(a: &ActiveArray) -> bool {
    a.resync_start >= a.info.component_size
}

/// One wakeup's worth of work on one array: read everything, diff, update
/// metadata, effect kernel state changes.
fn read_and_act(st: &mut Box<dyn Metadata>, a: &mut ActiveArray) -> Result<()> {
    a.next_state = None;
    a.next_action = None;
    a.curr_state = read_state(a);
    a.curr_action = read_action(a);
    for d in a.devs.iter_mut() {
        d.dev.next_state = 0;
        if let Some(fd) = d.state_fd.as_ref() {
            if let Ok(s) = fd_read_string(fd) {
                d.dev.curr_state = parse_dev_state(&s);
            }
        }
    }

    let mut deactivate = false;
    if a.curr_state <= ArrayState::Inactive && a.prev_state > ArrayState::Inactive {
        // array has been stopped: record clean and clear it
        st.set_array_state(a.inst, true, a.resync_start)?;
        a.next_state = Some(ArrayState::Clear);
        deactivate = true;
    }
    if a.curr_state == ArrayState::WritePending {
        get_resync_start(a);
        st.set_array_state(a.inst, false, a.resync_start)?;
        a.next_state = Some(ArrayState::Active);
    }
    if a.curr_state == ArrayState::Readonly {
        // ready to manage it, so read-auto is enough; a genuinely dirty
        // array goes active so the resync is tracked
        get_resync_start(a);
        if a.resync_start == MAX_SECTOR {
            a.next_state = Some(ArrayState::ReadAuto);
        } else {
            st.set_array_state(a.inst, false, a.resync_start)?;
            a.next_state = Some(ArrayState::Active);
        }
    }
    if a.curr_action == SyncAction::Idle && a.prev_action == SyncAction::Resync {
        // resync endpoint is in resync_start; metadata is updated when the
        // array quiesces, but spares may need attention now
        get_resync_start(a);
        st.set_array_state(a.inst, is_resync_complete(a), a.resync_start)?;
        a.check_degraded = true;
    }
    if a.curr_action == SyncAction::Idle && a.prev_action == SyncAction::Recover {
        for i in 0..a.devs.len() {
            let (slot, state) = (a.devs[i].dev.disk.raid_disk, a.devs[i].dev.curr_state);
            if slot >= 0 {
                st.set_disk(a.inst, slot, state)?;
            }
            if state & dev_state::INSYNC == 0 {
                a.check_degraded = true;
            }
        }
    }
    for i in 0..a.devs.len() {
        if a.devs[i].dev.curr_state & dev_state::FAULTY != 0 {
            let slot = a.devs[i].dev.disk.raid_disk;
            if slot >= 0 {
                st.set_disk(a.inst, slot, a.devs[i].dev.curr_state)?;
            }
            a.check_degraded = true;
            a.devs[i].dev.next_state = dev_state::REMOVE;
        }
    }

    if a.check_degraded {
        a.check_degraded = false;
        match st.activate_spare(a.inst) {
            Ok(Some(assign)) => {
                st.process_update(&assign.update)?;
                log::info!(
                    "activating spare {}:{} in slot {} of {}",
                    assign.disk.major,
                    assign.disk.minor,
                    assign.disk.raid_disk,
                    a.sra.sys_name
                );
                let mut sd = mdctl_core::MdDev {
                    disk: assign.disk.clone(),
                    data_offset: assign.data_offset,
                    component_size: a.info.component_size,
                    recovery_start: 0,
                    ..Default::default()
                };
                if let Err(e) = a.sra.add_disk(&mut sd, false, false) {
                    log::warn!("spare activation add failed: {}", e);
                } else {
                    let state_fd = a.sra.open_attr(Some(sd.sys_name.as_str()), "state").ok();
                    a.devs.push(crate::context::ActiveDev { dev: sd, state_fd });
                    a.next_action = Some(SyncAction::Recover);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("spare activation failed: {}", e),
        }
    }

    // persist whatever the family drivers dirtied
    st.sync_metadata()?;

    // now effect state changes in the kernel
    if let Some(next) = a.next_state {
        let _ = a.sra.write_attr(None, "array_state", next.as_str());
    }
    if let Some(SyncAction::Recover) = a.next_action {
        let _ = a.sra.write_attr(None, "sync_action", "recover");
    }
    for d in a.devs.iter_mut() {
        if d.dev.next_state == dev_state::REMOVE && !d.dev.sys_name.is_empty() {
            let name = d.dev.sys_name.as_str();
            let _ = a.sra.write_attr(Some(name), "state", "-blocked");
            if a.sra.write_attr(Some(name), "state", "remove").is_ok() {
                d.state_fd = None;
            }
        }
        if d.dev.next_state & dev_state::INSYNC != 0 && !d.dev.sys_name.is_empty() {
            let _ = a.sra.write_attr(Some(d.dev.sys_name.as_str()), "state", "+in_sync");
        }
        d.dev.prev_state = d.dev.curr_state;
        d.dev.next_state = 0;
    }
    a.prev_state = a.curr_state;
    a.prev_action = a.curr_action;
    if deactivate {
        a.deactivated = true;
    }
    Ok(())
}

fn handle_command(ctx: &mut MonitorSide, cmd: Command) -> i32 {
    match cmd {
        Command::PingMonitor => 0,
        Command::RemoveDevice(rdev) => {
            let major = nix::sys::stat::major(rdev) as u32;
            let minor = nix::sys::stat::minor(rdev) as u32;
            // refuse while any array still holds a state fd for the disk
            for a in &ctx.arrays {
                for d in &a.devs {
                    if d.dev.disk.major == major
                        && d.dev.disk.minor == minor
                        && d.state_fd.is_some()
                    {
                        return -nix::libc::EBUSY;
                    }
                }
            }
            let dk = mdctl_core::DiskInfo { major, minor, ..Default::default() };
            match ctx.st.remove_from_super(&dk).and_then(|()| ctx.st.sync_metadata()) {
                Ok(()) => 0,
                Err(MdError::Io(e)) => -e.raw_os_error().unwrap_or(nix::libc::EIO),
                Err(_) => -nix::libc::EINVAL,
            }
        }
    }
}

/// Failures propagate container-wide: any other array using the failed disk
/// gets it marked faulty too.
fn reconcile_failed(arrays: &mut [ActiveArray]) {
    let mut failed: Vec<(u32, u32)> = Vec::new();
    for a in arrays.iter() {
        for d in &a.devs {
            if d.dev.curr_state & dev_state::FAULTY != 0 {
                failed.push((d.dev.disk.major, d.dev.disk.minor));
            }
        }
    }
    for (major, minor) in failed {
        for a in arrays.iter_mut() {
            for d in a.devs.iter_mut() {
                if d.dev.disk.major == major
                    && d.dev.disk.minor == minor
                    && d.dev.curr_state & dev_state::FAULTY == 0
                {
                    if !d.dev.sys_name.is_empty() {
                        let _ = a.sra.write_attr(Some(d.dev.sys_name.as_str()), "state", "faulty");
                    }
                }
            }
        }
    }
}

/// Try to leave: nothing monitored and nothing else holding the container.
fn try_exit(ctx: &MonitorSide) -> bool {
    if !ctx.arrays.is_empty() || !ctx.manager_ready.load(Ordering::Acquire) {
        return false;
    }
    use std::os::unix::fs::OpenOptionsExt;
    match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_EXCL)
        .open(&ctx.container_path)
    {
        Ok(_) => true,
        Err(e) if e.raw_os_error() == Some(nix::libc::EBUSY) => false,
        Err(_) => true,
    }
}

pub fn monitor_loop(mut ctx: MonitorSide) {
    loop {
        // queued work from the manager
        while let Ok(msg) = ctx.from_mgr.try_recv() {
            match msg {
                ManagerMsg::NewArray(a) => {
                    log::info!("monitoring {}", a.sra.sys_name);
                    ctx.arrays.push(*a);
                }
                ManagerMsg::Update(u) => {
                    if let Err(e) = ctx
                        .st
                        .process_update(&u)
                        .and_then(|()| ctx.st.sync_metadata())
                    {
                        log::warn!("metadata update failed: {}", e);
                    }
                }
                ManagerMsg::Command { cmd, reply } => {
                    let rv = handle_command(&mut ctx, cmd);
                    let _ = reply.send(rv);
                }
            }
        }

        if ctx.sigterm.load(Ordering::Acquire) || try_exit(&ctx) {
            remove_pidfile(&ctx.container_name);
            std::process::exit(0);
        }

        // wait for any state change or a manager poke
        {
            let mut fds: Vec<PollFd> = Vec::new();
            fds.push(PollFd::new(&ctx.wake_rx, PollFlags::POLLIN));
            for a in &ctx.arrays {
                fds.push(PollFd::new(
                    &a.state_fd,
                    PollFlags::POLLPRI | PollFlags::POLLERR,
                ));
                fds.push(PollFd::new(
                    &a.action_fd,
                    PollFlags::POLLPRI | PollFlags::POLLERR,
                ));
                for d in &a.devs {
                    if let Some(fd) = d.state_fd.as_ref() {
                        fds.push(PollFd::new(fd, PollFlags::POLLPRI | PollFlags::POLLERR));
                    }
                }
            }
            let _ = poll(&mut fds, 1000);
        }
        // drain the wakeup pipe
        let mut sink = [0u8; 64];
        while (&ctx.wake_rx).read(&mut sink).is_ok() {}

        for a in ctx.arrays.iter_mut() {
            if let Err(e) = read_and_act(&mut ctx.st, a) {
                log::warn!("{}: monitor pass failed: {}", a.sra.sys_name, e);
            }
        }

        reconcile_failed(&mut ctx.arrays);

        // hand deactivated arrays to the manager, one at a time through the
        // single discard slot
        while let Some(pos) = ctx.arrays.iter().position(|a| a.deactivated) {
            let dead = ctx.arrays.remove(pos);
            if let Err(e) = ctx.discard_tx.try_send(dead) {
                // slot full: keep it until the manager has collected the
                // previous one
                let dead = match e {
                    std::sync::mpsc::TrySendError::Full(d) => d,
                    std::sync::mpsc::TrySendError::Disconnected(d) => d,
                };
                ctx.arrays.push(dead);
                break;
            }
        }
    }
}
