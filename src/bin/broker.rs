// SPDX-License-Identifier: MIT
//
// Broker process: owns the shared-memory mailbox and the listening UNIX
// socket, admits peers, and runs the fabric-management request dispatcher
// for requests addressed to it when acting as a peer itself.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};

use famez::admission::{admit_broker_side, notify_disconnect, AdmissionOutcome};
use famez::config::{BrokerConfig, DEFAULT_MAILBOX_NAME, DEFAULT_SOCKET_PATH};
use famez::dispatch::{tokenize, DispatchResult, Dispatcher, HandlerEnv, LocalIdentity};
use famez::mailbox::MailboxRegion;
use famez::notifier::EventNotifier;
use famez::reactor::{ReactorGlue, Source};
use famez::registry::{PeerRegistry, DEFAULT_SID};

const POLL_TICK: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "famez-broker", about = "Shared-memory fabric broker")]
struct Args {
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socketpath: PathBuf,

    #[arg(long, default_value = DEFAULT_MAILBOX_NAME)]
    mailbox: String,

    #[arg(long = "nclients", default_value_t = 14)]
    nclients: u64,

    #[arg(long)]
    silent: bool,

    #[arg(long = "no-pfm")]
    no_pfm: bool,

    #[arg(long)]
    norecycle: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = BrokerConfig::new(
        args.socketpath,
        args.mailbox,
        args.nclients,
        args.silent,
        args.no_pfm,
        args.norecycle,
        args.verbose,
    )?;

    run(config)
}

static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_quit_signal(_: libc::c_int) {
    QUIT_REQUESTED.store(true, Ordering::Release);
}

fn install_quit_handler() -> Result<()> {
    let handler = SigHandler::Handler(on_quit_signal);
    unsafe {
        signal::signal(Signal::SIGINT, handler)?;
        signal::signal(Signal::SIGTERM, handler)?;
    }
    Ok(())
}

fn run(config: BrokerConfig) -> Result<()> {
    install_quit_handler().context("failed to install SIGINT/SIGTERM handler")?;

    let mailbox = MailboxRegion::create(&config.mailbox_path(), config.n_clients, config.smart())
        .context("failed to initialize shared-memory mailbox")?;

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o666))?;
    let lock_path = config.socket_path.with_extension("lock");
    let _ = std::os::unix::fs::symlink(std::process::id().to_string(), &lock_path);

    let mut registry = PeerRegistry::new(mailbox.server_id(), config.smart(), config.norecycle);
    let mut dispatcher = Dispatcher::new();

    let mut identity = LocalIdentity {
        cclass: "FabricSwitch".to_string(),
        ..Default::default()
    };
    if config.smart() {
        identity.is_pfm = true;
        identity.sid0 = DEFAULT_SID;
        identity.cid0 = mailbox.server_id() * 100;
    }

    let broker_notifiers: Option<Vec<EventNotifier>> = if config.silent {
        None
    } else {
        let mut v = Vec::with_capacity(mailbox.n_events() as usize);
        for _ in 0..mailbox.n_events() {
            v.push(EventNotifier::create(0)?);
        }
        Some(v)
    };

    log::info!(
        "broker listening on {} ({} clients, smart={})",
        config.socket_path.display(),
        config.n_clients,
        config.smart()
    );

    let mut reactor = ReactorGlue::new();
    let mut quitting = false;

    loop {
        reactor.clear();
        reactor.register(listener.as_raw_fd(), Source::Listener);
        for peer in registry.iter() {
            reactor.register(peer.socket.as_raw_fd(), Source::Peer(peer.id));
        }
        if let Some(ns) = &broker_notifiers {
            for (i, n) in ns.iter().enumerate().skip(1) {
                reactor.register(n.as_raw_fd(), Source::Notifier(i as u64));
            }
        }

        let fired = reactor.wait(Some(POLL_TICK))?;

        for source in fired {
            match source {
                Source::Listener => {
                    if let Err(e) = accept_one(&listener, &mut registry, &mailbox, config.silent, &broker_notifiers, mailbox.server_id())
                    {
                        log::warn!("admission failed: {e}");
                    }
                }
                Source::Peer(id) => {
                    if socket_looks_closed(&registry, id) {
                        disconnect_peer(&mut registry, &mailbox, id, quitting);
                    }
                }
                Source::Notifier(source_id) => {
                    if let Some(ns) = &broker_notifiers {
                        let _ = ns[source_id as usize].drain();
                    }
                    handle_broker_request(
                        &mailbox,
                        &mut registry,
                        &mut dispatcher,
                        &mut identity,
                        source_id,
                        mailbox.server_id(),
                    );
                }
                Source::Stdin => unreachable!("the broker never registers stdin"),
            }
        }

        if !quitting && should_quit() {
            quitting = true;
            log::info!("quit requested, disconnecting all peers");
            for id in registry.ids() {
                disconnect_peer(&mut registry, &mailbox, id, true);
            }
        }
        if quitting {
            break;
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(&lock_path);
    Ok(())
}

fn should_quit() -> bool {
    QUIT_REQUESTED.load(Ordering::Acquire)
}

fn socket_looks_closed(registry: &PeerRegistry, id: u64) -> bool {
    let Some(peer) = registry.get(id) else {
        return false;
    };
    let mut buf = [0u8; 1];
    let ret = unsafe {
        libc::recv(
            peer.socket.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_PEEK,
        )
    };
    if ret == 0 {
        true
    } else if ret > 0 {
        false
    } else {
        let err = std::io::Error::last_os_error();
        err.kind() != std::io::ErrorKind::WouldBlock
    }
}

fn disconnect_peer(registry: &mut PeerRegistry, mailbox: &MailboxRegion, id: u64, quitting: bool) {
    mailbox.clear(id);
    if let Err(e) = notify_disconnect(registry, id) {
        log::warn!("failed to notify survivors of peer {id}'s disconnect: {e}");
    }
    registry.remove(id, quitting);
    log::info!("peer {id} disconnected");
}

fn accept_one(
    listener: &UnixListener,
    registry: &mut PeerRegistry,
    mailbox: &MailboxRegion,
    silent: bool,
    broker_notifiers: &Option<Vec<EventNotifier>>,
    server_id: u64,
) -> Result<()> {
    let (stream, _addr) = listener.accept()?;
    stream.set_nonblocking(false)?;

    let broker_peer = if silent {
        None
    } else {
        broker_notifiers.as_ref().map(|v| (server_id, v.as_slice()))
    };

    match admit_broker_side(
        registry,
        stream,
        mailbox.backing_fd(),
        mailbox.n_events(),
        server_id,
        broker_peer,
    )? {
        AdmissionOutcome::Admitted(id) => {
            log::info!("admitted peer {id}");
        }
        AdmissionOutcome::Rejected => {
            log::info!("rejected a connection: client set full");
        }
    }
    Ok(())
}

fn handle_broker_request(
    mailbox: &MailboxRegion,
    registry: &mut PeerRegistry,
    dispatcher: &mut Dispatcher,
    identity: &mut LocalIdentity,
    source_id: u64,
    server_id: u64,
) {
    let request = mailbox.retrieve(source_id);
    let Ok(text) = String::from_utf8(request) else {
        log::warn!("malformed (non-utf8) request from {source_id}");
        return;
    };
    let (tokens, ezt) = tokenize(&text);
    if tokens.is_empty() {
        return;
    }
    if let Some(ezt) = ezt {
        dispatcher.set_tracker(ezt);
    }

    let Some(peer) = registry.get(source_id) else {
        log::warn!("request from vanished peer {source_id}");
        return;
    };
    let Some(doorbell_fd) = peer.notifiers.get(server_id as usize).map(|n| n.as_raw_fd_value()) else {
        log::warn!("peer {source_id} has no doorbell for the broker");
        return;
    };
    let peer_cid0 = peer.cid0;
    let peer_sid0 = peer.sid0;

    let Some(peer_mut) = registry.get_mut(source_id) else {
        return;
    };

    let mut env = HandlerEnv {
        from_id: server_id,
        to_doorbell: doorbell_fd,
        mailbox,
        this: identity,
        remote_attrs: &mut peer_mut.peer_attrs,
        is_broker: true,
        peer_cid0,
        peer_sid0,
    };

    match dispatcher.dispatch(&tokens, &mut env) {
        DispatchResult::Handled(true) => {}
        DispatchResult::Handled(false) => log::debug!("{source_id}: request failed: {text}"),
        DispatchResult::Dump => log::debug!("{source_id}: dump requested"),
        DispatchResult::Unhandled => log::debug!("{source_id}: no handler for: {text}"),
    }
}
