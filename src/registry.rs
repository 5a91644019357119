// SPDX-License-Identifier: MIT
//
// Broker-side bookkeeping of admitted peers: identity, socket, notifier
// vector, and the attribute map populated by request traffic. Grounded in
// `twisted_server.py`'s `SI.clients` / `SI.recycled` dictionaries and
// `ProtocolIVSHMSGServer.create_new_peer_id`.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use rand::seq::IteratorRandom;

use crate::notifier::EventNotifier;

pub const LOWEST_ID: u64 = 1;
pub const DEFAULT_SID: u64 = 27;

/// A single admitted peer as tracked by the broker.
pub struct Peer {
    pub id: u64,
    pub socket: UnixStream,
    /// Index j: "this peer rings peer j". Populated during admission.
    pub notifiers: Vec<EventNotifier>,
    pub peer_attrs: HashMap<String, String>,
    pub cid0: u64,
    pub sid0: u64,
}

/// Attribute value a peer proxy carries until its own `Link CTL ACK`
/// overwrites it with the real component class.
pub const UNCONFIGURED_CCLASS: &str = "Driverless QEMU";

impl Peer {
    pub fn new(id: u64, socket: UnixStream) -> Self {
        let mut peer_attrs = HashMap::new();
        peer_attrs.insert("cclass".to_string(), UNCONFIGURED_CCLASS.to_string());
        Self {
            id,
            socket,
            notifiers: Vec::new(),
            peer_attrs,
            cid0: 0,
            sid0: 0,
        }
    }
}

/// Tracks admitted peers in insertion order (advertisement order matters)
/// plus an optional recycle cache keyed by id.
pub struct PeerRegistry {
    clients: Vec<Peer>,
    recycled: HashMap<u64, Peer>,
    server_id: u64,
    smart: bool,
    norecycle: bool,
}

impl PeerRegistry {
    pub fn new(server_id: u64, smart: bool, norecycle: bool) -> Self {
        Self {
            clients: Vec::new(),
            recycled: HashMap::new(),
            server_id,
            smart,
            norecycle,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.clients.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.clients.iter_mut()
    }

    pub fn get(&self, id: u64) -> Option<&Peer> {
        self.clients.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Peer> {
        self.clients.iter_mut().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of every currently admitted peer id, for iterating while
    /// mutating the registry (e.g. disconnecting everyone on quit).
    pub fn ids(&self) -> Vec<u64> {
        self.clients.iter().map(|p| p.id).collect()
    }

    /// Determine the next peer ID. Returns `None` (the original's `id = -1`
    /// sentinel) when the client set is already at capacity.
    ///
    /// Smart mode picks uniformly at random from the eligible set and also
    /// assigns `SID0`/`CID0`; dumb mode picks the minimum eligible id, with
    /// the `sorted(available)[0]` vs. hardcoded-`1` branching from the
    /// original kept verbatim even though both branches compute the same
    /// value when the client set is empty.
    pub fn create_new_peer_id(&self) -> (Option<u64>, u64, u64) {
        let active: std::collections::HashSet<u64> = self.clients.iter().map(|p| p.id).collect();
        let eligible: Vec<u64> = (LOWEST_ID..self.server_id)
            .filter(|id| !active.contains(id))
            .collect();

        if eligible.is_empty() {
            return (None, 0, 0);
        }

        if self.smart {
            let id = *eligible
                .iter()
                .choose(&mut rand::thread_rng())
                .expect("eligible is non-empty");
            (Some(id), DEFAULT_SID, id * 100)
        } else {
            let id = if self.clients.is_empty() {
                1
            } else {
                *eligible.iter().min().expect("eligible is non-empty")
            };
            (Some(id), 0, 0)
        }
    }

    /// Pull a recycled entry for `id`, if one exists (and recycling is on).
    pub fn take_recycled(&mut self, id: u64) -> Option<Peer> {
        if self.norecycle {
            return None;
        }
        self.recycled.remove(&id)
    }

    pub fn insert(&mut self, peer: Peer) {
        self.clients.push(peer);
    }

    /// Remove a peer on disconnect. If recycling is enabled and the broker
    /// isn't shutting down, park it in the recycle cache (preserving its
    /// notifier vector) instead of dropping it outright.
    pub fn remove(&mut self, id: u64, quitting: bool) -> Option<Peer> {
        let idx = self.clients.iter().position(|p| p.id == id)?;
        let peer = self.clients.remove(idx);
        if !self.norecycle && !quitting {
            self.recycled.insert(id, peer);
            None
        } else {
            Some(peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_socket() -> UnixStream {
        let (a, _b) = UnixStream::pair().unwrap();
        a
    }

    #[test]
    fn dumb_mode_allocates_lowest_free_id() {
        let mut reg = PeerRegistry::new(5, false, false);
        let (id1, _, _) = reg.create_new_peer_id();
        assert_eq!(id1, Some(1));
        reg.insert(Peer::new(1, dummy_socket()));

        let (id2, _, _) = reg.create_new_peer_id();
        assert_eq!(id2, Some(2));
    }

    #[test]
    fn allocation_fails_when_full() {
        let mut reg = PeerRegistry::new(3, false, false);
        reg.insert(Peer::new(1, dummy_socket()));
        reg.insert(Peer::new(2, dummy_socket()));
        let (id, _, _) = reg.create_new_peer_id();
        assert_eq!(id, None);
    }

    #[test]
    fn smart_mode_assigns_cid0_and_sid0() {
        let reg = PeerRegistry::new(5, true, false);
        let (id, sid0, cid0) = reg.create_new_peer_id();
        let id = id.unwrap();
        assert_eq!(sid0, DEFAULT_SID);
        assert_eq!(cid0, id * 100);
    }

    #[test]
    fn disconnect_without_recycle_drops_the_peer() {
        let mut reg = PeerRegistry::new(5, false, true);
        reg.insert(Peer::new(1, dummy_socket()));
        let removed = reg.remove(1, false);
        assert!(removed.is_some());
        assert!(reg.take_recycled(1).is_none());
    }

    #[test]
    fn disconnect_with_recycle_parks_the_peer() {
        let mut reg = PeerRegistry::new(5, false, false);
        reg.insert(Peer::new(1, dummy_socket()));
        let removed = reg.remove(1, false);
        assert!(removed.is_none());
        assert!(reg.take_recycled(1).is_some());
    }

    #[test]
    fn quitting_bypasses_recycle() {
        let mut reg = PeerRegistry::new(5, false, false);
        reg.insert(Peer::new(1, dummy_socket()));
        let removed = reg.remove(1, true);
        assert!(removed.is_some());
        assert!(reg.take_recycled(1).is_none());
    }
}
