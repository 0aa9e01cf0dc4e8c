//! Client side of the control socket, used by the administrative tool.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use mdctl_core::{MdError, Result};

use crate::msg::{
    ack, receive_message, send_message, Command, Message, HANDSHAKE_TMO, MDMON_DIR, OP_TMO,
};

/// `md127` or a subarray reference like `/md127/0` both address the
/// container's socket.
pub fn socket_path(devname: &str) -> PathBuf {
    let container = if let Some(rest) = devname.strip_prefix('/') {
        rest.split('/').next().unwrap_or(rest)
    } else {
        devname
    };
    PathBuf::from(format!("{}/{}.sock", MDMON_DIR, container))
}

pub fn connect_monitor(devname: &str) -> Result<UnixStream> {
    let path = socket_path(devname);
    let sock = UnixStream::connect(&path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                MdError::NoDevice(path.display().to_string())
            }
            _ => MdError::Io(e),
        })?;
    sock.set_nonblocking(true).map_err(MdError::Io)?;
    Ok(sock)
}

fn expect_ack(sock: &UnixStream, tmo: i32) -> Result<()> {
    match receive_message(sock, tmo)? {
        Message::Ack => Ok(()),
        Message::Data(d) if d.len() >= 4 => {
            let err = i32::from_le_bytes(d[..4].try_into().unwrap());
            if -err == nix::libc::EBUSY {
                Err(MdError::Busy("device still in use by the monitor".into()))
            } else {
                Err(MdError::Io(std::io::Error::from_raw_os_error(-err)))
            }
        }
        _ => Err(MdError::NoMagic),
    }
}

/// Give the monitor a chance to update the metadata.
pub fn ping_monitor(devname: &str) -> Result<()> {
    let sock = connect_monitor(devname)?;
    fping_monitor(&sock)
}

pub fn fping_monitor(sock: &UnixStream) -> Result<()> {
    send_message(sock, &Message::Data(Command::PingMonitor.to_bytes()), OP_TMO)?;
    expect_ack(sock, OP_TMO)
}

/// Encourage the manager to rescan while an exclusive open is held.
pub fn ping_manager(devname: &str) -> Result<()> {
    let sock = connect_monitor(devname)?;
    send_message(&sock, &Message::PingManager, OP_TMO)?;
    expect_ack(&sock, OP_TMO)
}

/// Ask the monitor to drop a member disk; `Busy` while any array still
/// holds it.
pub fn send_remove_device(devname: &str, rdev: u64) -> Result<()> {
    let sock = connect_monitor(devname)?;
    send_message(
        &sock,
        &Message::Data(Command::RemoveDevice(rdev).to_bytes()),
        HANDSHAKE_TMO,
    )?;
    expect_ack(&sock, OP_TMO)
}

/// Ack once on a fresh connection: used by a starting monitor to verify an
/// incumbent is alive.
pub fn handshake(sock: &UnixStream) -> Result<()> {
    ack(sock, OP_TMO)?;
    expect_ack(sock, OP_TMO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_paths() {
        assert_eq!(
            socket_path("md127"),
            PathBuf::from("/var/run/mdadm/md127.sock")
        );
        assert_eq!(
            socket_path("/md127/0"),
            PathBuf::from("/var/run/mdadm/md127.sock")
        );
    }
}
