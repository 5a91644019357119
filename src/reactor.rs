// SPDX-License-Identifier: MIT
//
// Single-threaded, single-process event loop multiplexing the listening
// socket (broker only), per-peer data sockets, and every notifier read FD
// the process owns. No threads, no async runtime: one poll(2) call per
// iteration, handlers run to completion before the next one starts.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use crate::error::{FabricError, Result};

/// What woke the reactor on a given iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Listener,
    Peer(u64),
    Notifier(u64),
    /// Interactive command input (peer process only).
    Stdin,
}

struct Registration {
    fd: RawFd,
    source: Source,
}

/// Tracks the set of FDs to multiplex and rebuilds the `poll` argument
/// vector fresh each iteration, since peers and notifiers come and go.
pub struct ReactorGlue {
    registrations: Vec<Registration>,
}

impl ReactorGlue {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    pub fn register(&mut self, fd: RawFd, source: Source) {
        self.registrations.push(Registration { fd, source });
    }

    /// Block until one or more registered FDs are readable (or the given
    /// timeout elapses), returning the sources that fired.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Source>> {
        let borrowed_fds: Vec<BorrowedFd> = self
            .registrations
            .iter()
            .map(|r| unsafe { BorrowedFd::borrow_raw(r.fd) })
            .collect();
        let mut pollfds: Vec<PollFd> = borrowed_fds
            .iter()
            .map(|borrowed| PollFd::new(borrowed, PollFlags::POLLIN))
            .collect();

        let timeout_ms: i32 = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = poll(&mut pollfds, timeout_ms).map_err(FabricError::Sys)?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut fired = Vec::new();
        for (reg, pfd) in self.registrations.iter().zip(pollfds.iter()) {
            if let Some(revents) = pfd.revents() {
                if revents.contains(PollFlags::POLLIN) || revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    fired.push(reg.source);
                }
            }
        }
        Ok(fired)
    }
}

impl Default for ReactorGlue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_reports_a_writable_notifier() {
        let n = crate::notifier::EventNotifier::create(0).unwrap();
        n.signal().unwrap();

        let mut reactor = ReactorGlue::new();
        reactor.register(n.as_raw_fd(), Source::Notifier(1));

        let fired = reactor.wait(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(fired, vec![Source::Notifier(1)]);
    }

    #[test]
    fn wait_times_out_with_nothing_ready() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut reactor = ReactorGlue::new();
        reactor.register(a.as_raw_fd(), Source::Peer(1));
        let fired = reactor.wait(Some(Duration::from_millis(20))).unwrap();
        assert!(fired.is_empty());
    }
}
