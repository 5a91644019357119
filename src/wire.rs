// SPDX-License-Identifier: MIT
//
// Handshake frame codec: 8 bytes of i64 payload, plus zero or one file
// descriptor carried as SCM_RIGHTS ancillary data. Mirrors
// `ivshmsg_send_one_msg` / `ivshmsg_recv_one_msg` from the protocol this
// crate reimplements, built on `nix`'s safe `sendmsg`/`recvmsg` rather than
// hand-rolled `cmsghdr` arithmetic.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};

use crate::error::{FabricError, Result};

/// One handshake/control frame: an 8-byte payload and an optional FD.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub payload: i64,
    pub fd: Option<RawFd>,
}

impl Frame {
    pub fn data(payload: i64) -> Self {
        Self { payload, fd: None }
    }

    pub fn with_fd(payload: i64, fd: RawFd) -> Self {
        Self {
            payload,
            fd: Some(fd),
        }
    }
}

/// Send a single frame. Returns `Ok(())` only if all 8 payload bytes (and
/// the FD, if present) went out in one `sendmsg` call.
pub fn send_frame<Fd: AsRawFd>(socket: &Fd, frame: Frame) -> Result<()> {
    let bytes = frame.payload.to_ne_bytes();
    let iov = [IoSlice::new(&bytes)];

    let sent = match frame.fd {
        Some(fd) => {
            let fds = [fd];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        }
        None => sendmsg::<()>(socket.as_raw_fd(), &iov, &[], MsgFlags::empty(), None),
    }
    .map_err(FabricError::Sys)?;

    if sent != bytes.len() {
        return Err(FabricError::MalformedFrame);
    }
    Ok(())
}

/// Receive a single frame. `None` means the peer closed the connection
/// (zero-length read), distinct from an io/protocol error.
pub fn recv_frame<Fd: AsRawFd>(socket: &Fd) -> Result<Option<Frame>> {
    let mut buf = [0u8; 8];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(FabricError::Sys)?;

    if msg.bytes == 0 {
        return Ok(None);
    }
    if msg.bytes != 8 {
        return Err(FabricError::MalformedFrame);
    }

    let mut fd = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&first) = fds.first() {
                fd = Some(first);
            }
        }
    }
    let payload = i64::from_ne_bytes(buf);

    Ok(Some(Frame { payload, fd }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn round_trips_a_plain_data_frame() {
        let (a, b) = UnixStream::pair().unwrap();
        send_frame(&a, Frame::data(42)).unwrap();
        let got = recv_frame(&b).unwrap().unwrap();
        assert_eq!(got.payload, 42);
        assert!(got.fd.is_none());
    }

    #[test]
    fn round_trips_a_frame_with_an_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let tmp = tempfile::tempfile().unwrap();
        send_frame(&a, Frame::with_fd(-1, tmp.as_raw_fd())).unwrap();
        let got = recv_frame(&b).unwrap().unwrap();
        assert_eq!(got.payload, -1);
        assert!(got.fd.is_some());
        unsafe { libc::close(got.fd.unwrap()) };
    }

    #[test]
    fn recv_on_closed_socket_returns_none() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(recv_frame(&b).unwrap().is_none());
    }
}
