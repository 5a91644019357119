// SPDX-License-Identifier: MIT
//
// Peer process: connects to the broker, completes admission, then runs an
// interactive command loop over stdin alongside the reactor. Grounded in
// `twisted_client.py` (`ProtocolIVSHMSGClient`: `retrieve_initial_info`,
// the batch-collection `dataReceived`, `place_and_go`, `doCommand`) and
// `commander.py`'s line-oriented front end, collapsed here into one
// cooperative poll loop instead of a separate stdio protocol object.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use famez::admission::{receive_initial_info, PeerAdmission, PeerBatchEvent};
use famez::config::{PeerConfig, DEFAULT_SOCKET_PATH};
use famez::dispatch::{tokenize, DispatchResult, Dispatcher, HandlerEnv, LocalIdentity};
use famez::mailbox::MailboxRegion;
use famez::notifier::EventNotifier;
use famez::reactor::{ReactorGlue, Source};

const POLL_TICK: Duration = Duration::from_millis(500);
/// Sentinel `Source::Peer` id for the single handshake socket: a peer
/// process has exactly one, unlike the broker's per-client sockets.
const HANDSHAKE_SOURCE: u64 = 0;

#[derive(Parser, Debug)]
#[command(name = "famez-peer", about = "Shared-memory fabric peer")]
struct Args {
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socketpath: PathBuf,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = PeerConfig::new(args.socketpath, args.verbose)?;
    run(config)
}

/// Everything the steady-state loop needs: the handshake socket (still
/// live for late-arriving batches), our own readable notifiers, and the
/// write-end fd vectors we use to ring other peers.
struct PeerState {
    own_id: u64,
    socket: UnixStream,
    own_notifiers: Vec<EventNotifier>,
    /// id -> that peer's notifier vector write-ends, index = source id.
    peer_fds: HashMap<u64, Vec<RawFd>>,
    dispatcher: Dispatcher,
    identity: LocalIdentity,
    remote_attrs: HashMap<u64, HashMap<String, String>>,
    /// Persists across handshake-socket wakeups: a late peer-join batch is
    /// `n_events` frames, so a single `step()` call almost never completes
    /// it on its own.
    admission: PeerAdmission,
}

fn run(config: PeerConfig) -> Result<()> {
    let socket = UnixStream::connect(&config.socket_path)
        .with_context(|| format!("failed to connect to {}", config.socket_path.display()))?;

    let Some(info) = receive_initial_info(&socket)? else {
        bail!("admission rejected: broker's client set is full, or a protocol mismatch");
    };

    let mailbox = MailboxRegion::from_fd(info.mailbox_fd, info.id)
        .context("failed to map the shared-memory mailbox")?;
    let own_id = info.id;
    let n_events = mailbox.n_events();

    mailbox.set_nodename(own_id, &format!("z{own_id:02}"))?;
    mailbox.set_cclass(own_id, "Debugger")?;
    log::info!("this id = {own_id} (z{own_id:02})");

    let mut admission = PeerAdmission::new(own_id, n_events);
    let mut peer_fds: HashMap<u64, Vec<RawFd>> = HashMap::new();
    let mut own_notifiers: Vec<EventNotifier> = Vec::new();

    loop {
        match admission.step(&socket)? {
            PeerBatchEvent::SelfComplete { fds } => {
                own_notifiers = fds.into_iter().map(EventNotifier::from_existing).collect();
                break;
            }
            PeerBatchEvent::PeerJoined { peer_id, fds } => {
                peer_fds.insert(peer_id, fds);
            }
            PeerBatchEvent::PeerLeft { peer_id } => {
                peer_fds.remove(&peer_id);
            }
            PeerBatchEvent::Pending => {}
            PeerBatchEvent::Closed => bail!("broker closed the connection during admission"),
        }
    }

    log::info!("admission complete, {} peer(s) known", peer_fds.len());

    let mut state = PeerState {
        own_id,
        socket,
        own_notifiers,
        peer_fds,
        dispatcher: Dispatcher::new(),
        identity: LocalIdentity {
            cclass: "Debugger".to_string(),
            ..Default::default()
        },
        remote_attrs: HashMap::new(),
        admission: PeerAdmission::new(own_id, n_events),
    };

    place_and_go(&mut state, &mailbox, "server", "Link CTL Peer-Attribute", None);

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    print_prompt(&mailbox, own_id);

    let mut reactor = ReactorGlue::new();
    loop {
        reactor.clear();
        reactor.register(state.socket.as_raw_fd(), Source::Peer(HANDSHAKE_SOURCE));
        for (i, n) in state.own_notifiers.iter().enumerate().skip(1) {
            reactor.register(n.as_raw_fd(), Source::Notifier(i as u64));
        }
        reactor.register(0, Source::Stdin);

        let fired = reactor.wait(Some(POLL_TICK))?;

        let mut quitting = false;
        for source in fired {
            match source {
                Source::Peer(HANDSHAKE_SOURCE) => {
                    if !handle_handshake_traffic(&mut state)? {
                        println!("The broker closed the connection.");
                        mailbox.clear(own_id);
                        return Ok(());
                    }
                }
                Source::Peer(_) => unreachable!("peer has only the handshake socket"),
                Source::Notifier(source_id) => {
                    if let Some(n) = state.own_notifiers.get(source_id as usize) {
                        let _ = n.drain();
                    }
                    handle_incoming_request(&mut state, &mailbox, source_id);
                }
                Source::Stdin => {
                    if let Some(line) = lines.next() {
                        let line = line.context("reading stdin")?;
                        if !do_command(&mut state, &mailbox, &line) {
                            quitting = true;
                        }
                        if !quitting {
                            print_prompt(&mailbox, own_id);
                        }
                    } else {
                        quitting = true;
                    }
                }
                Source::Listener => unreachable!("a peer never listens"),
            }
        }
        if quitting {
            break;
        }
    }

    mailbox.clear(own_id);
    Ok(())
}

fn print_prompt(mailbox: &MailboxRegion, own_id: u64) {
    print!("{}> ", mailbox.nodename(own_id));
    let _ = std::io::stdout().flush();
}

/// Read one more handshake-socket frame after steady state: either a new
/// peer's notifier batch, a disconnect notice, or the socket closing
/// outright (broker shutdown). Returns `false` on close.
fn handle_handshake_traffic(state: &mut PeerState) -> Result<bool> {
    match state.admission.step(&state.socket)? {
        PeerBatchEvent::PeerJoined { peer_id, fds } => {
            log::info!("peer {peer_id} joined");
            state.peer_fds.insert(peer_id, fds);
        }
        PeerBatchEvent::PeerLeft { peer_id } => {
            log::info!("peer {peer_id} left");
            state.peer_fds.remove(&peer_id);
            state.remote_attrs.remove(&peer_id);
        }
        PeerBatchEvent::SelfComplete { .. } => {
            log::warn!("unexpected self-batch after steady state");
        }
        PeerBatchEvent::Pending => {
            // A late peer-join batch is several frames; one frame landing
            // without completing the batch just means wait for the rest.
        }
        PeerBatchEvent::Closed => return Ok(false),
    }
    Ok(true)
}

fn handle_incoming_request(state: &mut PeerState, mailbox: &MailboxRegion, source_id: u64) {
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
        state.dispatcher.set_tracker(ezt);
    }

    let Some(doorbell_fd) = state
        .peer_fds
        .get(&source_id)
        .and_then(|v| v.get(state.own_id as usize))
        .copied()
    else {
        log::warn!("no doorbell known for peer {source_id}");
        return;
    };

    let attrs = state.remote_attrs.entry(source_id).or_default();
    let mut env = HandlerEnv {
        from_id: state.own_id,
        to_doorbell: doorbell_fd,
        mailbox,
        this: &mut state.identity,
        remote_attrs: attrs,
        // Link RFC is broker-only; a peer never builds a CTL-Write payload
        // and so never reads these.
        is_broker: false,
        peer_cid0: 0,
        peer_sid0: 0,
    };

    match state.dispatcher.dispatch(&tokens, &mut env) {
        DispatchResult::Handled(true) => {}
        DispatchResult::Handled(false) => log::debug!("{source_id}: request failed: {text}"),
        DispatchResult::Dump => println!("{}", dump_text(state, mailbox)),
        DispatchResult::Unhandled => log::debug!("{source_id}: no handler for: {text}"),
    }
}

/// Resolve a `<dest>`/`<src>` token to the set of ids it names: an
/// integer, a node name, `server`/`switch`, `all` (every active id), or
/// `others` (every active id but the caller's own).
fn parse_target(mailbox: &MailboxRegion, caller_id: u64, instr: &str) -> Option<Vec<u64>> {
    if let Ok(n) = instr.parse::<u64>() {
        if (1..=mailbox.server_id()).contains(&n) {
            return Some(vec![n]);
        }
        return None;
    }
    let lower = instr.to_lowercase();
    if lower == "server" || lower == "switch" {
        return Some(vec![mailbox.server_id()]);
    }
    let active = mailbox.active_ids();
    for &id in &active {
        if mailbox.nodename(id) == instr {
            return Some(vec![id]);
        }
    }
    if lower == "all" {
        return Some(active);
    }
    if lower == "others" {
        return Some(active.into_iter().filter(|&id| id != caller_id).collect());
    }
    None
}

/// Send `msg` from each id in `src` (default: just us) to each id in
/// `dest`, ringing the recipient's doorbell entry for the sender.
fn place_and_go(
    state: &mut PeerState,
    mailbox: &MailboxRegion,
    dest: &str,
    msg: &str,
    src: Option<&str>,
) {
    let Some(dest_ids) = parse_target(mailbox, state.own_id, dest) else {
        println!("No such destination: {dest}");
        return;
    };
    let src_ids = match src {
        Some(s) => match parse_target(mailbox, state.own_id, s) {
            Some(ids) => ids,
            None => {
                println!("No such source: {s}");
                return;
            }
        },
        None => vec![state.own_id],
    };

    for &s in &src_ids {
        for &d in &dest_ids {
            let Some(doorbell_fd) = state
                .peer_fds
                .get(&d)
                .and_then(|v| v.get(s as usize))
                .copied()
            else {
                println!("No such peer id {d}");
                continue;
            };
            state
                .dispatcher
                .send_payload(mailbox, s, doorbell_fd, msg.to_string());
        }
    }
}

fn dump_text(state: &PeerState, mailbox: &MailboxRegion) -> String {
    let mut out = String::new();
    out.push_str("Client node/host names:\n");
    let mut ids: Vec<&u64> = state.peer_fds.keys().collect();
    ids.sort();
    for id in ids {
        out.push_str(&format!("\t{:2} {}\n", id, mailbox.nodename(*id)));
    }
    out.push_str(&format!(
        "\nMy CID0:SID0 = {}:{}\n",
        state.identity.cid0, state.identity.sid0
    ));
    out.push_str(&format!(
        "Link state: configured={}\n",
        state.identity.link_state_configured
    ));
    out
}

/// Process one stdin command line. Returns `false` to end the loop.
fn do_command(state: &mut PeerState, mailbox: &MailboxRegion, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return true;
    };
    let args: Vec<&str> = words.collect();
    let cmd = cmd.to_lowercase();

    match cmd.as_str() {
        "p" | "ping" => {
            let Some(&dest) = args.first() else {
                println!("Missing dest");
                return true;
            };
            place_and_go(state, mailbox, dest, "ping", None);
        }
        "s" | "send" => {
            let Some((&dest, rest)) = args.split_first() else {
                println!("Missing dest");
                return true;
            };
            place_and_go(state, mailbox, dest, &rest.join(" "), None);
        }
        "sp" | "spoof" => {
            if args.len() < 2 {
                println!("Missing src and/or dest");
                return true;
            }
            let src = args[0];
            let dest = args[1];
            place_and_go(state, mailbox, dest, &args[2..].join(" "), Some(src));
        }
        "l" | "link" => {
            if args.is_empty() {
                println!("Missing directive");
                return true;
            }
            place_and_go(state, mailbox, "server", &format!("Link {}", args.join(" ")), None);
        }
        "r" | "rfc" => {
            place_and_go(state, mailbox, "server", "Link RFC TTC=27us", None);
        }
        "d" | "dump" => println!("{}", dump_text(state, mailbox)),
        "w" | "who" => {
            println!("This ID = {:2} ({})", state.own_id, mailbox.nodename(state.own_id));
            let mut ids: Vec<&u64> = state.peer_fds.keys().collect();
            ids.sort();
            for &id in ids {
                if id == state.own_id {
                    continue;
                }
                println!("Peer ID = {:2} ({})", id, mailbox.nodename(id));
            }
        }
        "h" | "help" => {
            println!("dest/src can be integer, hostname, \"server\", \"all\", or \"others\"\n");
            println!("h[elp]\n\tThis message");
            println!("l[ink] <args>\n\tLink commands (CTL and RFC)");
            println!("p[ing] dest\n\tShorthand for \"send dest ping\"");
            println!("q[uit]\n\tJust do it");
            println!("r[fc]\n\tSend \"Link RFC ...\" to the server");
            println!("s[end] dest [text...]\n\tSend text from this client");
            println!("sp[oof] src dest [text...]\n\tLike send but fake the src");
            println!("w[ho]\n\tList all peers");
        }
        "q" | "quit" => return false,
        "" => {}
        other => println!("Unrecognized command \"{other}\", try \"help\""),
    }
    true
}
