//! The control-socket message protocol between the administrative tool and
//! a running monitor.
//!
//! Frame layout, all little-endian:
//!
//! ```text
//! start_magic  u32 = 0x5a5aa5a5
//! length       i32   payload bytes; 0 = ack, -1 = manager ping
//! payload      length bytes, opaque here
//! end_magic    u32 = 0xa5a55a5a
//! ```
//!
//! Both ends run the socket non-blocking and poll with a timeout; a send or
//! receive that times out closes the socket.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;

use mdctl_core::{MdError, Result};
use nix::poll::{poll, PollFd, PollFlags};

pub const START_MAGIC: u32 = 0x5a5a_a5a5;
pub const END_MAGIC: u32 = 0xa5a5_5a5a;
pub const MSG_MAX_LEN: i32 = 64 * 1024;

/// Seconds: socket handshake, and one full operation.
pub const HANDSHAKE_TMO: i32 = 3;
pub const OP_TMO: i32 = 20;

/// Where pid and socket files live, one pair per container.
pub const MDMON_DIR: &str = "/var/run/mdadm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// zero-length frame
    Ack,
    /// length -1: wake the manager
    PingManager,
    Data(Vec<u8>),
}

/// Requests carried in the payload; the leading action tag selects the
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PingMonitor,
    RemoveDevice(u64),
}

impl Command {
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            Command::PingMonitor => 0u32.to_le_bytes().to_vec(),
            Command::RemoveDevice(rdev) => {
                let mut b = 1u32.to_le_bytes().to_vec();
                b.extend_from_slice(&rdev.to_le_bytes());
                b
            }
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Command> {
        if buf.len() < 4 {
            return None;
        }
        match u32::from_le_bytes(buf[..4].try_into().unwrap()) {
            0 => Some(Command::PingMonitor),
            1 if buf.len() >= 12 => Some(Command::RemoveDevice(u64::from_le_bytes(
                buf[4..12].try_into().unwrap(),
            ))),
            _ => None,
        }
    }
}

fn timeout_err() -> MdError {
    MdError::Io(std::io::Error::new(ErrorKind::TimedOut, "socket timeout"))
}

fn send_buf(sock: &UnixStream, mut buf: &[u8], tmo_secs: i32) -> Result<()> {
    while !buf.is_empty() {
        let mut fds = [PollFd::new(sock, PollFlags::POLLOUT)];
        if poll(&mut fds, tmo_secs * 1000)? <= 0 {
            return Err(timeout_err());
        }
        match (&*sock).write(buf) {
            Ok(0) => return Err(timeout_err()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(MdError::Io(e)),
        }
    }
    Ok(())
}

fn recv_buf(sock: &UnixStream, buf: &mut [u8], tmo_secs: i32) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let mut fds = [PollFd::new(sock, PollFlags::POLLIN)];
        if poll(&mut fds, tmo_secs * 1000)? <= 0 {
            return Err(timeout_err());
        }
        match (&*sock).read(&mut buf[pos..]) {
            Ok(0) => return Err(timeout_err()),
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(MdError::Io(e)),
        }
    }
    Ok(())
}

pub fn send_message(sock: &UnixStream, msg: &Message, tmo_secs: i32) -> Result<()> {
    let (len, payload): (i32, &[u8]) = match msg {
        Message::Ack => (0, &[]),
        Message::PingManager => (-1, &[]),
        Message::Data(d) => (d.len() as i32, d),
    };
    send_buf(sock, &START_MAGIC.to_le_bytes(), tmo_secs)?;
    send_buf(sock, &len.to_le_bytes(), tmo_secs)?;
    if len > 0 {
        send_buf(sock, payload, tmo_secs)?;
    }
    send_buf(sock, &END_MAGIC.to_le_bytes(), tmo_secs)
}

pub fn receive_message(sock: &UnixStream, tmo_secs: i32) -> Result<Message> {
    let mut word = [0u8; 4];
    recv_buf(sock, &mut word, tmo_secs)?;
    if u32::from_le_bytes(word) != START_MAGIC {
        return Err(MdError::NoMagic);
    }
    recv_buf(sock, &mut word, tmo_secs)?;
    let len = i32::from_le_bytes(word);
    if len > MSG_MAX_LEN || len < -1 {
        return Err(MdError::NoMagic);
    }
    let payload = if len > 0 {
        let mut buf = vec![0u8; len as usize];
        recv_buf(sock, &mut buf, tmo_secs)?;
        Some(buf)
    } else {
        None
    };
    recv_buf(sock, &mut word, tmo_secs)?;
    if u32::from_le_bytes(word) != END_MAGIC {
        return Err(MdError::NoMagic);
    }
    Ok(match (len, payload) {
        (-1, _) => Message::PingManager,
        (_, None) => Message::Ack,
        (_, Some(d)) => Message::Data(d),
    })
}

pub fn ack(sock: &UnixStream, tmo_secs: i32) -> Result<()> {
    send_message(sock, &Message::Ack, tmo_secs)
}

/// Negative errno as a 4-byte reply.
pub fn nack(sock: &UnixStream, err: i32, tmo_secs: i32) -> Result<()> {
    send_message(sock, &Message::Data(err.to_le_bytes().to_vec()), tmo_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn framing_round_trip() {
        let (a, b) = pair();
        let payload = Command::RemoveDevice(0x0808).to_bytes();
        send_message(&a, &Message::Data(payload.clone()), 1).unwrap();
        match receive_message(&b, 1).unwrap() {
            Message::Data(d) => {
                assert_eq!(d, payload);
                assert_eq!(Command::parse(&d), Some(Command::RemoveDevice(0x0808)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ack_and_manager_ping() {
        let (a, b) = pair();
        ack(&a, 1).unwrap();
        assert_eq!(receive_message(&b, 1).unwrap(), Message::Ack);
        send_message(&a, &Message::PingManager, 1).unwrap();
        assert_eq!(receive_message(&b, 1).unwrap(), Message::PingManager);
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let (a, b) = pair();
        send_buf(&a, &0xdeadbeefu32.to_le_bytes(), 1).unwrap();
        send_buf(&a, &0i32.to_le_bytes(), 1).unwrap();
        send_buf(&a, &END_MAGIC.to_le_bytes(), 1).unwrap();
        assert!(matches!(receive_message(&b, 1), Err(MdError::NoMagic)));
    }

    #[test]
    fn oversize_length_is_rejected() {
        let (a, b) = pair();
        send_buf(&a, &START_MAGIC.to_le_bytes(), 1).unwrap();
        send_buf(&a, &(MSG_MAX_LEN + 1).to_le_bytes(), 1).unwrap();
        assert!(receive_message(&b, 1).is_err());
    }

    #[test]
    fn receive_times_out_on_silence() {
        let (_a, b) = pair();
        let t0 = std::time::Instant::now();
        assert!(receive_message(&b, 1).is_err());
        assert!(t0.elapsed() >= std::time::Duration::from_millis(900));
    }
}
