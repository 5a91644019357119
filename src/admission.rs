// SPDX-License-Identifier: MIT
//
// Peer-admission state machine: the broker-side batch advertisement that
// hands out notifier FDs to a newly connected peer (and that peer to
// everyone already admitted), and the peer-side mirror that collects
// those batches until it sees its own ID echoed back as a sentinel.
// Grounded in `twisted_server.py::connectionMade` / `send_initial_info`
// and the peer-side collection loop implied by `twisted_client.py`.

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use crate::error::Result;
use crate::notifier::EventNotifier;
use crate::registry::{Peer, PeerRegistry};
use crate::wire::{recv_frame, send_frame, Frame};

pub const PROTOCOL_VERSION: i64 = 0;
/// Payload value that always accompanies the shared-memory FD frame.
pub const SHM_FD_MARKER: i64 = -1;

/// Result of a broker-side admission attempt.
pub enum AdmissionOutcome {
    /// The peer was admitted with this id; socket moved into the registry.
    Admitted(u64),
    /// Client set already at capacity; the connection was sent the
    /// version-mismatch rejection and should be closed by the caller.
    Rejected,
}

/// Drive one freshly accepted connection through the full broker-side
/// handshake: ID allocation (or recycle reuse), initial info, mutual
/// notifier advertisement, optional broker-as-peer advertisement, and the
/// new peer's self-echo sentinel batch.
#[allow(clippy::too_many_arguments)]
pub fn admit_broker_side(
    registry: &mut PeerRegistry,
    stream: UnixStream,
    mailbox_fd: RawFd,
    n_events: u64,
    server_id: u64,
    broker_peer: Option<(u64, &[EventNotifier])>,
) -> Result<AdmissionOutcome> {
    let (maybe_id, sid0, cid0) = registry.create_new_peer_id();

    let Some(id) = maybe_id else {
        send_frame(&stream, Frame::data(-1))?;
        return Ok(AdmissionOutcome::Rejected);
    };

    let recycled = registry.take_recycled(id);
    let was_recycled = recycled.is_some();
    let (new_peer_notifiers, recycled_attrs) = match recycled {
        Some(p) => (p.notifiers, Some(p.peer_attrs)),
        None => (fresh_notifier_vector(n_events)?, None),
    };

    // Step 3: initial info (version, id, shm fd).
    send_frame(&stream, Frame::data(PROTOCOL_VERSION))?;
    send_frame(&stream, Frame::data(id as i64))?;
    send_frame(&stream, Frame::with_fd(SHM_FD_MARKER, mailbox_fd))?;

    // Step 4: advertise the new peer to everyone already admitted. A
    // recycled peer's FDs were already handed out on its first admission
    // and never torn down, so re-advertising them would duplicate entries
    // on the survivors' side; skip for the recycle path.
    if !was_recycled {
        for other in registry.iter() {
            for n in &new_peer_notifiers {
                send_frame(&other.socket, Frame::with_fd(id as i64, n.as_raw_fd_value()))?;
            }
        }
    }

    // Step 5: advertise every already-admitted peer to the new one.
    for other in registry.iter() {
        for n in &other.notifiers {
            send_frame(&stream, Frame::with_fd(other.id as i64, n.as_raw_fd_value()))?;
        }
    }

    // Step 6: broker-as-peer advertisement.
    if let Some((broker_id, broker_notifiers)) = broker_peer {
        for n in broker_notifiers {
            send_frame(&stream, Frame::with_fd(broker_id as i64, n.as_raw_fd_value()))?;
        }
    }

    // Step 7: advertise the new peer to itself (sentinel: id == payload).
    for n in &new_peer_notifiers {
        send_frame(&stream, Frame::with_fd(id as i64, n.as_raw_fd_value()))?;
    }

    let mut peer = Peer::new(id, stream);
    peer.notifiers = new_peer_notifiers;
    peer.cid0 = cid0;
    peer.sid0 = sid0;
    if let Some(attrs) = recycled_attrs {
        peer.peer_attrs = attrs;
    }
    registry.insert(peer);

    Ok(AdmissionOutcome::Admitted(id))
}

fn fresh_notifier_vector(n_events: u64) -> Result<Vec<EventNotifier>> {
    (0..n_events)
        .map(|_| EventNotifier::create(0).map_err(crate::error::FabricError::Io))
        .collect()
}

/// Fan out a disconnect notice (bare id, no FD) to every surviving peer.
pub fn notify_disconnect(registry: &PeerRegistry, departing_id: u64) -> Result<()> {
    for peer in registry.iter() {
        send_frame(&peer.socket, Frame::data(departing_id as i64))?;
    }
    Ok(())
}

/// Peer-side mirror of the handshake: collects `(peer_id, fd)` batches
/// until the batch for `own_id` completes, at which point the collected
/// FDs (in receive order) are handed back as the peer's own notifier
/// vector (wrapped, not duped — caller owns them from here).
pub struct PeerAdmission {
    own_id: u64,
    n_events: u64,
    current_peer: Option<u64>,
    current_batch: Vec<RawFd>,
}

pub enum PeerBatchEvent {
    /// A non-self batch completed: a new peer joined; these are its
    /// notifier FDs (not ours).
    PeerJoined { peer_id: u64, fds: Vec<RawFd> },
    /// A peer disconnected (bare frame, no fd).
    PeerLeft { peer_id: u64 },
    /// Our own batch completed: handshake is over.
    SelfComplete { fds: Vec<RawFd> },
    /// Not enough frames yet to resolve a full batch; the caller should
    /// wait for the socket to become readable again.
    Pending,
    /// The socket hit EOF (zero-length read): the broker hung up.
    Closed,
}

impl PeerAdmission {
    pub fn new(own_id: u64, n_events: u64) -> Self {
        Self {
            own_id,
            n_events,
            current_peer: None,
            current_batch: Vec::new(),
        }
    }

    /// Read and process exactly one frame from the handshake socket.
    pub fn step(&mut self, socket: &UnixStream) -> Result<PeerBatchEvent> {
        let frame = match recv_frame(socket)? {
            Some(f) => f,
            None => return Ok(PeerBatchEvent::Closed),
        };

        let peer_id = frame.payload as u64;

        match frame.fd {
            None => {
                // Bare frame: that peer disconnected.
                return Ok(PeerBatchEvent::PeerLeft { peer_id });
            }
            Some(fd) => {
                if self.current_peer != Some(peer_id) {
                    self.current_peer = Some(peer_id);
                    self.current_batch.clear();
                }
                self.current_batch.push(fd);

                if self.current_batch.len() as u64 == self.n_events {
                    let fds = std::mem::take(&mut self.current_batch);
                    self.current_peer = None;
                    if peer_id == self.own_id {
                        return Ok(PeerBatchEvent::SelfComplete { fds });
                    }
                    return Ok(PeerBatchEvent::PeerJoined { peer_id, fds });
                }
            }
        }

        Ok(PeerBatchEvent::Pending)
    }
}

/// Initial three-frame exchange read by a connecting peer: protocol
/// version, assigned id, and the shared-memory FD.
pub struct InitialInfo {
    pub version: i64,
    pub id: u64,
    pub mailbox_fd: RawFd,
}

pub fn receive_initial_info(socket: &UnixStream) -> Result<Option<InitialInfo>> {
    let version_frame = match recv_frame(socket)? {
        Some(f) => f,
        None => return Ok(None),
    };
    if version_frame.payload != PROTOCOL_VERSION {
        return Ok(None);
    }
    let id_frame = recv_frame(socket)?
        .ok_or(crate::error::FabricError::MalformedFrame)?;
    let shm_frame = recv_frame(socket)?
        .ok_or(crate::error::FabricError::MalformedFrame)?;
    let mailbox_fd = shm_frame
        .fd
        .ok_or(crate::error::FabricError::MalformedFrame)?;

    Ok(Some(InitialInfo {
        version: version_frame.payload,
        id: id_frame.payload as u64,
        mailbox_fd,
    }))
}
