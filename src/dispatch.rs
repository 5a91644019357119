// SPDX-License-Identifier: MIT
//
// Request dispatcher: tokenizes a mailbox payload, walks tokens left to
// right looking for the longest registered handler prefix, and runs fixed
// request semantics (ping, Link CTL, Link RFC, CTL-Write, Standalone
// Acknowledgment, dump). Grounded in `famez_requests.py` (`chelsea`,
// `handle_request`, `send_payload`, and the `_Link_CTL`/`_Link_RFC`/
// `_CTL_Write`/`_Standalone_Acknowledgment` handlers).

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::mailbox::MailboxRegion;
use crate::notifier::signal_fd;

const TRACKER_TOKEN: &str = "!EZT=";

/// Split a CSV `key=value,key=value` argument into a map. Malformed pairs
/// (no `=`, empty key) are silently skipped, matching `CSV2dict`.
pub fn csv_to_map(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in s.trim().split(',') {
        if let Some((k, v)) = pair.trim().split_once('=') {
            let k = k.trim();
            if !k.is_empty() {
                out.insert(k.to_string(), v.trim().to_string());
            }
        }
    }
    out
}

/// Split an incoming mailbox payload into its tokens and trailing trace
/// counter, mirroring `handle_request`'s split on the `!EZT=` marker.
pub fn tokenize(payload: &str) -> (Vec<String>, Option<u64>) {
    let mut parts = payload.splitn(2, TRACKER_TOKEN);
    let body = parts.next().unwrap_or("");
    let ezt = parts.next().and_then(|s| s.trim().parse::<u64>().ok());
    let tokens = body.split_whitespace().map(str::to_string).collect();
    (tokens, ezt)
}

/// Local identity fields a request handler may read or mutate: the
/// dispatching process's own component class and Gen-Z addressing.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    pub cclass: String,
    pub cid0: u64,
    pub sid0: u64,
    pub pfm_cid0: u64,
    pub pfm_sid0: u64,
    pub is_pfm: bool,
    pub link_state_configured: bool,
}

/// Everything a handler needs beyond its own argument tokens.
pub struct HandlerEnv<'a> {
    pub from_id: u64,
    pub to_doorbell: RawFd,
    pub mailbox: &'a MailboxRegion,
    pub this: &'a mut LocalIdentity,
    /// Where to record attributes read out of `Link CTL ACK`: the
    /// broker records them on the requesting peer's proxy; a peer
    /// records them for whichever remote node it is talking to.
    pub remote_attrs: &'a mut HashMap<String, String>,
    /// `Link RFC` is accepted only at the broker, and only in
    /// fabric-management mode.
    pub is_broker: bool,
    /// The requester's own CID0/SID0, needed by `Link RFC` to build the
    /// `CTL-Write` payload (`RO.proxy.CID0`/`RO.proxy.SID0` upstream).
    pub peer_cid0: u64,
    pub peer_sid0: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handled; `true` unless the fill stomped an undrained slot.
    Handled(bool),
    /// Advisory: caller should print the current switch-state diagram.
    Dump,
    /// No registered handler matched any prefix of the tokens.
    Unhandled,
}

struct TagRecord {
    cid: u64,
    sid: u64,
    after_ack: Option<String>,
}

/// Per-process dispatcher state: the tag correlation table and trace
/// counter. One instance per broker or peer process.
pub struct Dispatcher {
    next_tag: u64,
    tagged: HashMap<String, TagRecord>,
    tracker: u64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_tag: 1,
            tagged: HashMap::new(),
            tracker: 0,
        }
    }

    /// Overwrite the local trace counter with an incoming `!EZT=` value, so
    /// the next reply echoes it forward incremented by one.
    pub fn set_tracker(&mut self, v: u64) {
        self.tracker = v;
    }

    /// Fill the sender's own mailslot and ring the given doorbell. Appends
    /// the trace-counter suffix unconditionally.
    pub fn send_payload(
        &mut self,
        mailbox: &MailboxRegion,
        from_id: u64,
        doorbell: RawFd,
        mut payload: String,
    ) -> bool {
        self.tracker += 1;
        payload.push_str(TRACKER_TOKEN);
        payload.push_str(&self.tracker.to_string());
        let in_time = mailbox.fill(from_id, payload.as_bytes()).unwrap_or(false);
        let _ = signal_fd(doorbell);
        in_time
    }

    /// Like `send_payload`, but appends `,Tag=<n>` and records a tag entry
    /// so a later `Standalone Acknowledgment` can trigger `after_ack`.
    #[allow(clippy::too_many_arguments)]
    pub fn send_tagged_payload(
        &mut self,
        mailbox: &MailboxRegion,
        from_id: u64,
        doorbell: RawFd,
        mut payload: String,
        after_ack: Option<String>,
        tag_cid: u64,
        tag_sid: u64,
    ) -> bool {
        let tag = self.next_tag;
        self.next_tag += 1;
        payload.push_str(&format!(",Tag={tag}"));
        self.tagged.insert(
            tag.to_string(),
            TagRecord {
                cid: tag_cid,
                sid: tag_sid,
                after_ack,
            },
        );
        self.send_payload(mailbox, from_id, doorbell, payload)
    }

    pub fn outstanding_tags(&self) -> usize {
        self.tagged.len()
    }

    /// Resolve the longest-prefix handler for `tokens` and run it.
    /// Unmatched requests are silently ignored (non-fatal), per the
    /// dispatch algorithm's contract.
    pub fn dispatch(&mut self, tokens: &[String], env: &mut HandlerEnv) -> DispatchResult {
        let mut entry = String::new();
        for (i, tok) in tokens.iter().enumerate() {
            entry.push('_');
            entry.push_str(&tok.replace('-', "_"));
            let args = &tokens[i + 1..];
            match entry.as_str() {
                "_ping" => return handle_ping(self, env, args),
                "_dump" => return DispatchResult::Dump,
                "_Link_CTL" => return handle_link_ctl(self, env, args),
                "_Link_RFC" => return handle_link_rfc(self, env, args),
                "_CTL_Write" => return handle_ctl_write(self, env, args),
                "_Standalone_Acknowledgment" => return handle_standalone_ack(self, env, args),
                _ => continue,
            }
        }
        DispatchResult::Unhandled
    }
}

fn handle_ping(d: &mut Dispatcher, env: &mut HandlerEnv, _args: &[String]) -> DispatchResult {
    let ok = d.send_payload(env.mailbox, env.from_id, env.to_doorbell, "pong".to_string());
    DispatchResult::Handled(ok)
}

fn handle_link_ctl(d: &mut Dispatcher, env: &mut HandlerEnv, args: &[String]) -> DispatchResult {
    let arg0 = args.first().map(String::as_str).unwrap_or("");

    if args.len() == 1 && arg0 == "Peer-Attribute" {
        let attrs = format!(
            "cclass={},CID0={},SID0={}",
            env.this.cclass, env.this.cid0, env.this.sid0
        );
        let ok = d.send_payload(
            env.mailbox,
            env.from_id,
            env.to_doorbell,
            format!("Link CTL ACK {attrs}"),
        );
        return DispatchResult::Handled(ok);
    }

    if arg0 == "ACK" && args.len() == 2 {
        *env.remote_attrs = csv_to_map(&args[1]);
        return DispatchResult::Dump;
    }

    if arg0 == "NAK" {
        log::warn!("peer {} sent Link CTL NAK {:?}", env.from_id, args);
        return DispatchResult::Handled(false);
    }

    log::debug!("unrecognized Link CTL from {}: {:?}", env.from_id, args);
    DispatchResult::Handled(false)
}

fn handle_link_rfc(d: &mut Dispatcher, env: &mut HandlerEnv, args: &[String]) -> DispatchResult {
    if !env.is_broker || !env.this.is_pfm {
        log::warn!("Link RFC from {} rejected: not a fabric manager", env.from_id);
        return DispatchResult::Handled(false);
    }

    let Some(csv) = args.first() else {
        log::warn!("{}: Link RFC missing TTC", env.from_id);
        return DispatchResult::Handled(false);
    };
    let kv = csv_to_map(csv);
    let Some(delay) = kv.get("TTC").map(|s| s.to_lowercase()) else {
        log::warn!("{}: Link RFC missing TTC", env.from_id);
        return DispatchResult::Handled(false);
    };
    if !delay.contains("us") {
        log::warn!("delay {delay} is too long, dropping Link RFC from {}", env.from_id);
        return DispatchResult::Handled(false);
    }

    let payload = format!(
        "CTL-Write Space=0,PFMCID={},PFMSID={},CID={},SID={}",
        env.this.cid0, env.this.sid0, env.peer_cid0, env.peer_sid0
    );
    let ok = d.send_tagged_payload(
        env.mailbox,
        env.from_id,
        env.to_doorbell,
        payload,
        Some("Link CTL Peer-Attribute".to_string()),
        env.this.cid0,
        env.this.sid0,
    );
    DispatchResult::Handled(ok)
}

fn handle_ctl_write(d: &mut Dispatcher, env: &mut HandlerEnv, args: &[String]) -> DispatchResult {
    let Some(csv) = args.first() else {
        return DispatchResult::Handled(false);
    };
    let kv = csv_to_map(csv);
    let Some(space) = kv.get("Space").and_then(|s| s.parse::<i64>().ok()) else {
        return DispatchResult::Handled(false);
    };
    if space != 0 {
        return DispatchResult::Handled(false);
    }

    let (Some(cid), Some(sid), Some(pfm_cid), Some(pfm_sid), Some(tag)) = (
        kv.get("CID").and_then(|s| s.parse().ok()),
        kv.get("SID").and_then(|s| s.parse().ok()),
        kv.get("PFMCID").and_then(|s| s.parse().ok()),
        kv.get("PFMSID").and_then(|s| s.parse().ok()),
        kv.get("Tag"),
    ) else {
        return DispatchResult::Handled(false);
    };

    env.this.cid0 = cid;
    env.this.sid0 = sid;
    env.this.pfm_cid0 = pfm_cid;
    env.this.pfm_sid0 = pfm_sid;
    env.this.link_state_configured = true;

    let payload = format!("Standalone Acknowledgment Tag={tag},Reason=OK");
    let ok = d.send_payload(env.mailbox, env.from_id, env.to_doorbell, payload);
    DispatchResult::Handled(ok)
}

fn handle_standalone_ack(
    d: &mut Dispatcher,
    env: &mut HandlerEnv,
    args: &[String],
) -> DispatchResult {
    let kv = args.first().map(|s| csv_to_map(s)).unwrap_or_default();
    let tag = kv.get("Tag").cloned();

    let record = tag.as_ref().and_then(|t| d.tagged.remove(t));
    match record {
        Some(rec) => {
            let _ = (rec.cid, rec.sid);
            if let Some(after) = rec.after_ack {
                d.send_payload(env.mailbox, env.from_id, env.to_doorbell, after);
            }
        }
        None => {
            log::warn!("untagging {:?} from {} failed", tag, env.from_id);
        }
    }

    if d.outstanding_tags() > 0 {
        log::debug!("{} outstanding tags", d.outstanding_tags());
    }

    DispatchResult::Dump
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::EventNotifier;

    #[test]
    fn tokenize_splits_off_the_trace_counter() {
        let (tokens, ezt) = tokenize("ping!EZT=1");
        assert_eq!(tokens, vec!["ping"]);
        assert_eq!(ezt, Some(1));
    }

    #[test]
    fn tokenize_without_a_counter_leaves_it_none() {
        let (tokens, ezt) = tokenize("Link CTL Peer-Attribute");
        assert_eq!(tokens, vec!["Link", "CTL", "Peer-Attribute"]);
        assert_eq!(ezt, None);
    }

    #[test]
    fn csv_to_map_skips_malformed_pairs() {
        let m = csv_to_map("a=1,garbage,b=2");
        assert_eq!(m.get("a").map(String::as_str), Some("1"));
        assert_eq!(m.get("b").map(String::as_str), Some("2"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn dispatch_matches_longest_registered_prefix() {
        let mailbox = MailboxRegion::create(
            &std::env::temp_dir().join("famez_dispatch_test_1"),
            2,
            true,
        )
        .unwrap();
        let doorbell = EventNotifier::create(0).unwrap();
        let mut identity = LocalIdentity {
            cclass: "Debugger".into(),
            cid0: 100,
            sid0: 27,
            ..Default::default()
        };
        let mut remote_attrs = HashMap::new();
        let mut env = HandlerEnv {
            from_id: 1,
            to_doorbell: doorbell.as_raw_fd_value(),
            mailbox: &mailbox,
            this: &mut identity,
            remote_attrs: &mut remote_attrs,
            is_broker: false,
            peer_cid0: 0,
            peer_sid0: 0,
        };

        let mut d = Dispatcher::new();
        let (tokens, _) = tokenize("Link CTL Peer-Attribute");
        let result = d.dispatch(&tokens, &mut env);
        assert_eq!(result, DispatchResult::Handled(true));

        let (fired, _) = doorbell.drain().unwrap();
        assert!(fired);
        let reply = String::from_utf8(mailbox.retrieve(1)).unwrap();
        assert!(reply.starts_with("Link CTL ACK cclass=Debugger,CID0=100,SID0=27"));

        let _ = std::fs::remove_file(std::env::temp_dir().join("famez_dispatch_test_1"));
    }

    #[test]
    fn unmatched_request_is_silently_ignored() {
        let mailbox = MailboxRegion::create(
            &std::env::temp_dir().join("famez_dispatch_test_2"),
            2,
            true,
        )
        .unwrap();
        let doorbell = EventNotifier::create(0).unwrap();
        let mut identity = LocalIdentity::default();
        let mut remote_attrs = HashMap::new();
        let mut env = HandlerEnv {
            from_id: 1,
            to_doorbell: doorbell.as_raw_fd_value(),
            mailbox: &mailbox,
            this: &mut identity,
            remote_attrs: &mut remote_attrs,
            is_broker: false,
            peer_cid0: 0,
            peer_sid0: 0,
        };
        let mut d = Dispatcher::new();
        let (tokens, _) = tokenize("gibberish nonsense");
        assert_eq!(d.dispatch(&tokens, &mut env), DispatchResult::Unhandled);

        let _ = std::fs::remove_file(std::env::temp_dir().join("famez_dispatch_test_2"));
    }
}
