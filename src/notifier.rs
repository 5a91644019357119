// SPDX-License-Identifier: MIT
//
// Counting event notifier backed by Linux eventfd(2).
// Mirrors the IVSHMSG_Event_Notifier / EventNotifier role from the QEMU
// ivshmem client-server protocol: a single FD whose read and write ends
// are the same descriptor, used to wake a peer without going through the
// mailbox itself.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// A counting signal on a single kernel file descriptor.
///
/// Created in non-blocking, non-semaphore ("counter") mode: each `signal`
/// adds 1 to an internal 64-bit counter; `drain` reads and resets it to 0,
/// returning the accumulated count (coalesced signals collapse to one
/// wake with `count >= 1`).
pub struct EventNotifier {
    fd: RawFd,
    /// Whether this handle owns the FD (and should close it on drop).
    owned: bool,
}

impl EventNotifier {
    /// Create a fresh eventfd-backed notifier.
    pub fn create(initial: u32) -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(initial, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, owned: true })
    }

    /// Wrap an FD received from another process (e.g. over SCM_RIGHTS).
    /// The wrapper owns the FD and will close it on drop.
    pub fn from_existing(fd: RawFd) -> Self {
        Self { fd, owned: true }
    }

    /// Borrow this notifier's FD without taking ownership (for `dup`-free
    /// sharing inside a single process, e.g. advertising the same FD to
    /// multiple reactor registrations).
    pub fn borrowed(fd: RawFd) -> Self {
        Self { fd, owned: false }
    }

    pub fn as_raw_fd_value(&self) -> RawFd {
        self.fd
    }

    /// Add 1 to the counter. Returns `Ok(false)` (not an error) if the
    /// write would block (`EAGAIN`) — this happens only if the counter is
    /// already at `u64::MAX - 1`, effectively never in practice.
    pub fn signal(&self) -> io::Result<bool> {
        let bytes = 1u64.to_ne_bytes();
        loop {
            let ret = unsafe { libc::write(self.fd, bytes.as_ptr() as *const _, bytes.len()) };
            if ret == bytes.len() as isize {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Read and reset the counter. Returns `(false, 0)` if the counter was
    /// zero (non-blocking read would have blocked).
    pub fn drain(&self) -> io::Result<(bool, u64)> {
        let mut buf = [0u8; 8];
        loop {
            let ret = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if ret == buf.len() as isize {
                return Ok((true, u64::from_ne_bytes(buf)));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok((false, 0)),
                _ => return Err(err),
            }
        }
    }

    /// Idempotently close the underlying FD.
    pub fn close(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

impl AsRawFd for EventNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ring a notifier by raw fd without needing an owning `EventNotifier`.
/// Used by the dispatcher, which only ever holds borrowed references to
/// notifiers owned by the peer registry.
pub fn signal_fd(fd: RawFd) -> io::Result<bool> {
    let bytes = 1u64.to_ne_bytes();
    loop {
        let ret = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
        if ret == bytes.len() as isize {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(false),
            _ => return Err(err),
        }
    }
}
