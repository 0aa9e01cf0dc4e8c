//! The manager thread: discover new member arrays via mdstat, service the
//! control socket, and do the allocation the monitor's hot path must not.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

use mdctl_core::Result;
use nix::poll::{poll, PollFd, PollFlags};

use crate::context::{ActiveArray, ManagerMsg, ManagerSide};
use crate::msg::{ack, nack, receive_message, Command, Message, HANDSHAKE_TMO, MDMON_DIR, OP_TMO};

pub fn make_control_sock(devname: &str) -> Result<UnixListener> {
    std::fs::create_dir_all(MDMON_DIR).ok();
    let path = format!("{}/{}.sock", MDMON_DIR, devname);
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn wake_monitor(ctx: &ManagerSide) {
    use std::io::Write;
    let _ = (&ctx.wake_tx).write(&[1u8]);
}

/// A member of this container shows up in mdstat as
/// `external:/<container>/<inst>`.
pub fn parse_member_version(metadata_version: &str, container: &str) -> Option<usize> {
    let rest = metadata_version.strip_prefix("external:/")?;
    let (cont, inst) = rest.split_once('/')?;
    if cont != container {
        return None;
    }
    inst.parse().ok()
}

fn scan_mdstat(ctx: &ManagerSide, known: &mut Vec<i32>) {
    let Ok(entries) = mdctl_sysfs::mdstat::read() else { return };
    for ent in entries {
        if ent.devnum == ctx.container_devnum {
            continue;
        }
        let Some(ver) = ent.metadata_version.as_deref() else { continue };
        let Some(inst) = parse_member_version(ver, &ctx.container_name) else { continue };
        if known.contains(&ent.devnum) {
            continue;
        }
        match ActiveArray::open(ent.devnum, inst) {
            Ok(a) => {
                known.push(ent.devnum);
                if ctx.to_mon.send(ManagerMsg::NewArray(Box::new(a))).is_ok() {
                    wake_monitor(ctx);
                }
            }
            Err(e) => log::warn!("cannot open new array md{}: {}", ent.devnum, e),
        }
    }
}

/// Forward a command to the monitor and wait (bounded) for its verdict.
fn forward(ctx: &ManagerSide, cmd: Command) -> i32 {
    let (reply_tx, reply_rx) = mpsc::channel();
    if ctx
        .to_mon
        .send(ManagerMsg::Command { cmd, reply: reply_tx })
        .is_err()
    {
        return -nix::libc::EPIPE;
    }
    wake_monitor(ctx);
    reply_rx
        .recv_timeout(Duration::from_secs(OP_TMO as u64))
        .unwrap_or(-nix::libc::ETIMEDOUT)
}

fn serve_connection(ctx: &ManagerSide, sock: UnixStream, known: &mut Vec<i32>) {
    if sock.set_nonblocking(true).is_err() {
        return;
    }
    loop {
        match receive_message(&sock, HANDSHAKE_TMO) {
            Ok(Message::Ack) => {
                // a bare ack is a liveness probe
                if ack(&sock, HANDSHAKE_TMO).is_err() {
                    break;
                }
            }
            Ok(Message::PingManager) => {
                scan_mdstat(ctx, known);
                if ack(&sock, HANDSHAKE_TMO).is_err() {
                    break;
                }
            }
            Ok(Message::Data(payload)) => match Command::parse(&payload) {
                Some(cmd) => {
                    let rv = forward(ctx, cmd);
                    let done = if rv == 0 {
                        ack(&sock, HANDSHAKE_TMO)
                    } else {
                        nack(&sock, rv, HANDSHAKE_TMO)
                    };
                    if done.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = nack(&sock, -nix::libc::EINVAL, HANDSHAKE_TMO);
                    break;
                }
            },
            Err(_) => {
                let _ = nack(&sock, -nix::libc::EBADMSG, HANDSHAKE_TMO);
                break;
            }
        }
    }
}

pub fn manager_loop(ctx: ManagerSide, listener: UnixListener) {
    let mut known: Vec<i32> = Vec::new();
    let mut mdstat_watch = mdctl_sysfs::mdstat::MdstatWatch::open().ok();

    // the initial scan makes the monitor's exit test meaningful
    scan_mdstat(&ctx, &mut known);
    ctx.manager_ready.store(true, Ordering::Release);

    loop {
        if ctx.sigterm.load(Ordering::Acquire) {
            wake_monitor(&ctx);
            return;
        }
        // free anything the monitor discarded
        while let Ok(dead) = ctx.discard_rx.try_recv() {
            log::info!("released {}", dead.sra.sys_name);
            known.retain(|&d| d != dead.devnum);
            drop(dead);
        }

        {
            let mut fds: Vec<PollFd> = Vec::new();
            fds.push(PollFd::new(&listener, PollFlags::POLLIN));
            if let Some(w) = mdstat_watch.as_ref() {
                fds.push(PollFd::new(
                    w,
                    PollFlags::POLLPRI | PollFlags::POLLERR,
                ));
            }
            let _ = poll(&mut fds, 1000);
        }

        scan_mdstat(&ctx, &mut known);
        match listener.accept() {
            Ok((sock, _)) => serve_connection(&ctx, sock, &mut known),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_version_parse() {
        assert_eq!(parse_member_version("external:/md127/0", "md127"), Some(0));
        assert_eq!(parse_member_version("external:/md127/3", "md127"), Some(3));
        assert_eq!(parse_member_version("external:/md9/0", "md127"), None);
        assert_eq!(parse_member_version("external:imsm", "md127"), None);
        assert_eq!(parse_member_version("1.2", "md127"), None);
    }
}
