//! Wire framing for the RPC socket.
//!
//! Each message is one SOCK_SEQPACKET datagram holding a little-endian
//! u32 length prefix followed by a serde_json body. File descriptors
//! ride alongside a frame as SCM_RIGHTS control messages.

use crate::config::types::{Result, StarterError};
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

/// Upper bound on one frame, prefix included.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Most descriptors one frame may carry.
pub const MAX_PASSED_FDS: usize = 8;

/// Serialize and send one message, attaching `fds` when non-empty.
pub fn send_message<T: Serialize>(fd: RawFd, message: &T, fds: &[RawFd]) -> Result<()> {
    let body = serde_json::to_vec(message)
        .map_err(|e| StarterError::Rpc(format!("encoding message failed: {e}")))?;
    if body.len() + 4 > MAX_MESSAGE_SIZE {
        return Err(StarterError::Rpc(format!(
            "message of {} bytes exceeds the frame limit",
            body.len()
        )));
    }
    if fds.len() > MAX_PASSED_FDS {
        return Err(StarterError::Rpc(format!(
            "cannot attach {} descriptors to one frame",
            fds.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    let iov = [IoSlice::new(&frame)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };

    sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|e| StarterError::Rpc(format!("sending message failed: {e}")))?;
    Ok(())
}

/// Receive one message. Returns `None` when the peer closed the
/// connection. Any received descriptors are returned alongside.
pub fn recv_message<T: DeserializeOwned>(fd: RawFd) -> Result<Option<(T, Vec<RawFd>)>> {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    let mut fds = Vec::new();

    let received = {
        let mut iov = [IoSliceMut::new(&mut buffer)];
        let mut cmsg_buffer = cmsg_space!([RawFd; MAX_PASSED_FDS]);
        let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
            .map_err(|e| StarterError::Rpc(format!("receiving message failed: {e}")))?;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received);
            }
        }
        msg.bytes
    };

    if received == 0 {
        return Ok(None);
    }
    if received < 4 {
        return Err(StarterError::Rpc("truncated frame header".to_string()));
    }

    let body_len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if 4 + body_len != received {
        return Err(StarterError::Rpc(format!(
            "frame length {body_len} does not match received {received} bytes"
        )));
    }

    let message = serde_json::from_slice(&buffer[4..4 + body_len])
        .map_err(|e| StarterError::Rpc(format!("decoding message failed: {e}")))?;
    Ok(Some((message, fds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::types::{MkdirArgs, Request};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::close;
    use std::path::PathBuf;

    fn pair() -> (RawFd, RawFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    #[test]
    fn frames_round_trip() {
        let (a, b) = pair();
        let req = Request::Mkdir(MkdirArgs {
            path: PathBuf::from("/tmp/frame"),
            mode: 0o700,
        });
        send_message(a, &req, &[]).unwrap();
        let (back, fds) = recv_message::<Request>(b).unwrap().unwrap();
        assert_eq!(req, back);
        assert!(fds.is_empty());
        let _ = close(a);
        let _ = close(b);
    }

    #[test]
    fn closed_peer_reads_as_none() {
        let (a, b) = pair();
        let _ = close(a);
        let end = recv_message::<Request>(b).unwrap();
        assert!(end.is_none());
        let _ = close(b);
    }

    #[test]
    fn descriptors_transfer_with_the_frame() {
        let (a, b) = pair();
        let file = tempfile::tempfile().unwrap();
        use std::os::unix::io::AsRawFd;
        send_message(a, &"fd ahead".to_string(), &[file.as_raw_fd()]).unwrap();
        let (text, fds) = recv_message::<String>(b).unwrap().unwrap();
        assert_eq!(text, "fd ahead");
        assert_eq!(fds.len(), 1);
        assert_ne!(fds[0], file.as_raw_fd());
        for fd in fds {
            let _ = close(fd);
        }
        let _ = close(a);
        let _ = close(b);
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let (a, b) = pair();
        let big = "x".repeat(MAX_MESSAGE_SIZE);
        assert!(send_message(a, &big, &[]).is_err());
        let _ = close(a);
        let _ = close(b);
    }
}
