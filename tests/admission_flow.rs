// SPDX-License-Identifier: MIT
//
// End-to-end admission handshake tests, run broker-side and peer-side in
// the same process over `UnixStream::pair()` instead of a real accept()
// loop. Grounded in `twisted_server.py::connectionMade` /
// `twisted_client.py::retrieve_initial_info` and the two-peer scenario
// walked through in `ivshmsg_twisted`'s README.

use std::os::unix::net::UnixStream;

use famez::admission::{
    admit_broker_side, notify_disconnect, receive_initial_info, AdmissionOutcome,
    PeerAdmission, PeerBatchEvent,
};
use famez::mailbox::MailboxRegion;
use famez::registry::PeerRegistry;

fn scratch_mailbox(label: &str, n_clients: u64, smart: bool) -> (std::path::PathBuf, MailboxRegion) {
    let path = std::env::temp_dir().join(format!(
        "famez_test_admission_{label}_{}",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let mailbox = MailboxRegion::create(&path, n_clients, smart).unwrap();
    (path, mailbox)
}

/// Drive a peer-side handshake socket until its own batch completes,
/// collecting any other peers' batches seen along the way.
fn drain_self_batch(socket: &UnixStream, own_id: u64, n_events: u64) -> Vec<i32> {
    let mut admission = PeerAdmission::new(own_id, n_events);
    loop {
        match admission.step(socket).unwrap() {
            PeerBatchEvent::SelfComplete { fds } => return fds,
            PeerBatchEvent::PeerJoined { .. } | PeerBatchEvent::PeerLeft { .. } => continue,
            PeerBatchEvent::Pending => continue,
            PeerBatchEvent::Closed => panic!("socket closed before self batch completed"),
        }
    }
}

#[test]
fn two_peers_admit_and_see_each_others_notifiers() {
    let (path, mailbox) = scratch_mailbox("two_peer", 4, true);
    let mut registry = PeerRegistry::new(mailbox.server_id(), true, false);
    let n_events = mailbox.n_events();

    let (broker_sock1, peer_sock1) = UnixStream::pair().unwrap();
    let id1 = match admit_broker_side(
        &mut registry,
        broker_sock1,
        mailbox.backing_fd(),
        n_events,
        mailbox.server_id(),
        None,
    )
    .unwrap()
    {
        AdmissionOutcome::Admitted(id) => id,
        AdmissionOutcome::Rejected => panic!("first peer should not be rejected"),
    };

    let info1 = receive_initial_info(&peer_sock1).unwrap().unwrap();
    assert_eq!(info1.id, id1);
    let peer1_own_fds = drain_self_batch(&peer_sock1, id1, n_events);
    assert_eq!(peer1_own_fds.len() as u64, n_events);

    let (broker_sock2, peer_sock2) = UnixStream::pair().unwrap();
    let id2 = match admit_broker_side(
        &mut registry,
        broker_sock2,
        mailbox.backing_fd(),
        n_events,
        mailbox.server_id(),
        None,
    )
    .unwrap()
    {
        AdmissionOutcome::Admitted(id) => id,
        AdmissionOutcome::Rejected => panic!("second peer should not be rejected"),
    };
    assert_ne!(id1, id2);

    // Peer 1 should see peer 2's advertisement arrive on its still-open
    // handshake socket.
    let mut admission1 = PeerAdmission::new(id1, n_events);
    let joined = loop {
        match admission1.step(&peer_sock1).unwrap() {
            PeerBatchEvent::PeerJoined { peer_id, fds } => break (peer_id, fds),
            _ => continue,
        }
    };
    assert_eq!(joined.0, id2);
    assert_eq!(joined.1.len() as u64, n_events);

    // Peer 2 should see peer 1 advertised to it before its own batch.
    let info2 = receive_initial_info(&peer_sock2).unwrap().unwrap();
    assert_eq!(info2.id, id2);
    let mut admission2 = PeerAdmission::new(id2, n_events);
    let saw_peer1 = loop {
        match admission2.step(&peer_sock2).unwrap() {
            PeerBatchEvent::PeerJoined { peer_id, fds } => break (peer_id, fds),
            PeerBatchEvent::SelfComplete { .. } => panic!("expected peer 1 before self"),
            _ => continue,
        }
    };
    assert_eq!(saw_peer1.0, id1);

    for fd in peer1_own_fds {
        unsafe { libc::close(fd) };
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn admission_rejects_when_client_set_is_full() {
    let (path, mailbox) = scratch_mailbox("full", 1, false);
    // server_id == n_clients + 1 == 2, so only id 1 is ever eligible.
    let mut registry = PeerRegistry::new(mailbox.server_id(), false, false);
    let n_events = mailbox.n_events();

    let (broker_sock1, _peer_sock1) = UnixStream::pair().unwrap();
    match admit_broker_side(
        &mut registry,
        broker_sock1,
        mailbox.backing_fd(),
        n_events,
        mailbox.server_id(),
        None,
    )
    .unwrap()
    {
        AdmissionOutcome::Admitted(1) => {}
        AdmissionOutcome::Admitted(id) => panic!("expected id 1, got {id}"),
        AdmissionOutcome::Rejected => panic!("first peer should not be rejected"),
    }

    let (broker_sock2, peer_sock2) = UnixStream::pair().unwrap();
    match admit_broker_side(
        &mut registry,
        broker_sock2,
        mailbox.backing_fd(),
        n_events,
        mailbox.server_id(),
        None,
    )
    .unwrap()
    {
        AdmissionOutcome::Rejected => {}
        AdmissionOutcome::Admitted(_) => panic!("client set is full, second peer must be rejected"),
    }

    // The rejected peer reads a version-mismatch-shaped frame and gives up.
    assert!(receive_initial_info(&peer_sock2).unwrap().is_none());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn disconnect_is_fanned_out_to_survivors() {
    let (path, mailbox) = scratch_mailbox("disconnect", 4, true);
    let mut registry = PeerRegistry::new(mailbox.server_id(), true, true); // norecycle
    let n_events = mailbox.n_events();

    let (broker_sock1, peer_sock1) = UnixStream::pair().unwrap();
    let id1 = match admit_broker_side(&mut registry, broker_sock1, mailbox.backing_fd(), n_events, mailbox.server_id(), None).unwrap() {
        AdmissionOutcome::Admitted(id) => id,
        _ => panic!("admission failed"),
    };
    let _ = receive_initial_info(&peer_sock1).unwrap().unwrap();
    let _ = drain_self_batch(&peer_sock1, id1, n_events);

    let (broker_sock2, peer_sock2) = UnixStream::pair().unwrap();
    let id2 = match admit_broker_side(&mut registry, broker_sock2, mailbox.backing_fd(), n_events, mailbox.server_id(), None).unwrap() {
        AdmissionOutcome::Admitted(id) => id,
        _ => panic!("admission failed"),
    };
    let _ = receive_initial_info(&peer_sock2).unwrap().unwrap();
    // Drain peer 2's view of peer 1 joining before its own batch completes.
    let mut admission2 = PeerAdmission::new(id2, n_events);
    loop {
        match admission2.step(&peer_sock2).unwrap() {
            PeerBatchEvent::SelfComplete { .. } => break,
            _ => continue,
        }
    }

    mailbox.clear(id1);
    notify_disconnect(&registry, id1).unwrap();
    registry.remove(id1, true);

    // Peer 2 should see a bare (no-fd) frame naming peer 1.
    let mut admission2b = PeerAdmission::new(id2, n_events);
    match admission2b.step(&peer_sock2).unwrap() {
        PeerBatchEvent::PeerLeft { peer_id } => assert_eq!(peer_id, id1),
        _ => panic!("expected PeerLeft for peer {id1}"),
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn recycled_peer_keeps_its_original_notifier_fds() {
    let (path, mailbox) = scratch_mailbox("recycle", 4, false);
    let mut registry = PeerRegistry::new(mailbox.server_id(), false, false); // recycling on

    let (broker_sock1, peer_sock1) = UnixStream::pair().unwrap();
    let id1 = match admit_broker_side(&mut registry, broker_sock1, mailbox.backing_fd(), mailbox.n_events(), mailbox.server_id(), None).unwrap() {
        AdmissionOutcome::Admitted(id) => id,
        _ => panic!("admission failed"),
    };
    let _ = receive_initial_info(&peer_sock1).unwrap().unwrap();
    let first_fds = drain_self_batch(&peer_sock1, id1, mailbox.n_events());

    mailbox.clear(id1);
    registry.remove(id1, false); // parks in the recycle cache

    let (broker_sock1b, peer_sock1b) = UnixStream::pair().unwrap();
    let id1_again = match admit_broker_side(&mut registry, broker_sock1b, mailbox.backing_fd(), mailbox.n_events(), mailbox.server_id(), None).unwrap() {
        AdmissionOutcome::Admitted(id) => id,
        _ => panic!("re-admission failed"),
    };
    assert_eq!(id1_again, id1, "dumb-mode allocator should hand the lowest free id back out");

    let _ = receive_initial_info(&peer_sock1b).unwrap().unwrap();
    let second_fds = drain_self_batch(&peer_sock1b, id1_again, mailbox.n_events());

    assert_eq!(first_fds, second_fds, "recycled admission must reuse the exact same notifier FDs");

    for fd in second_fds {
        unsafe { libc::close(fd) };
    }
    let _ = std::fs::remove_file(&path);
}
