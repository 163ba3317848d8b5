//! Verb handlers wiring the parser, the session table, the subscription
//! index and the durable store together.
//!
//! Handlers run on the reactor thread with the acting connection detached
//! from the session table, so delivering to another session is a plain map
//! lookup. Failure policy follows the wire contract: protocol violations
//! answer with an `ERROR` frame and close, resource/storage failures answer
//! `ERROR` only when the request carried a `receipt`, and are otherwise
//! dropped silently.

use std::collections::BTreeMap;
use std::io::Write;

use log::{debug, info, warn};
use mio::{Interest, Registry};

use crate::blob::{self, BlobStore, MAX_BLOB, MAX_CHUNK};
use crate::broker::{post, Broker};
use crate::conn::{Connection, SessionState};
use crate::frame::{self, Frame};
use crate::role;
use crate::store::PushOutcome;

const MAX_RECEIPT_LEN: usize = 64;
const SID_TAG: &str = "sid/";

impl Broker {
    pub(crate) fn on_frame(&mut self, conn: &mut Connection, frame: Frame) {
        let mut hdr = frame.header_map();

        if conn.state == SessionState::AwaitLogin {
            self.on_login(conn, &frame.command, &hdr);
            return;
        }

        let receipt = truncate_receipt(hdr.get("receipt").cloned().unwrap_or_default());

        match frame.command.as_str() {
            "SEND" => self.on_send(conn, &mut hdr, &frame.body, &receipt),
            "ACK" => self.on_ack(conn),
            "SUBSCRIBE" => self.on_subscribe(conn, &hdr, &receipt),
            "UNSUBSCRIBE" => self.on_unsubscribe(conn, &hdr, &receipt),
            "DISCONNECT" => self.on_disconnect(conn, &receipt),
            "SYSTEM" => self.on_system(conn, &hdr),
            "PUT" => self.on_put(conn, &hdr, &frame.body, &receipt),
            "GET" => self.on_get(conn, &hdr, &receipt),
            _ => post(
                self.poll.registry(),
                conn,
                frame::text_error("Not implemented"),
                true,
            ),
        }
    }

    fn on_login(&mut self, conn: &mut Connection, command: &str, hdr: &BTreeMap<String, String>) {
        if command != "CONNECT" && command != "STOMP" {
            post(
                self.poll.registry(),
                conn,
                frame::text_error("Not connected"),
                true,
            );
            return;
        }

        let login = hdr.get("login").map(String::as_str).unwrap_or("");
        let passcode = hdr.get("passcode").map(String::as_str).unwrap_or("");

        let mut granted = None;
        if !login.is_empty() {
            match self.users.get(login) {
                Ok(Some(user)) if user.validate(passcode) => {
                    granted = role::mask_for(user.role()).map(|mask| (mask, user.role().to_string()));
                }
                Ok(_) => {}
                Err(err) => warn!("user lookup for '{login}' failed: {err}"),
            }
        }

        match granted {
            Some((mask, role)) => {
                conn.perm = mask;
                conn.identity = login.to_string();
                conn.state = SessionState::Ready;
                info!(
                    "connected '{}' as '{role}' (sid={}, addr='{}')",
                    conn.identity, conn.sid, conn.addr
                );
                post(self.poll.registry(), conn, frame::connected(conn.sid), false);
            }
            None => {
                info!(
                    "access denied for '{login}' (sid={}, addr='{}')",
                    conn.sid, conn.addr
                );
                post(
                    self.poll.registry(),
                    conn,
                    frame::text_error("Access denied"),
                    true,
                );
            }
        }
    }

    fn on_send(
        &mut self,
        conn: &mut Connection,
        hdr: &mut BTreeMap<String, String>,
        body: &[u8],
        receipt: &str,
    ) {
        let destination = hdr.get("destination").cloned().unwrap_or_default();
        let max_num = hdr
            .get("max-num")
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|&n| n >= 0)
            .map(|n| n.min(i64::from(u32::MAX)) as u32);

        let mut ok = false;
        let mut queue_size = 0u32;

        if let Some(rest) = destination.strip_prefix(SID_TAG) {
            if conn.perm & role::W_PRIVATE != 0 {
                if let Some(target) = rest.parse::<u32>().ok().filter(|&n| n > 0) {
                    let message = self.build_message(conn, hdr, body);
                    ok = self.deliver_direct(conn, target, message);
                }
            }
        } else if !destination.is_empty() {
            let bit = match destination.as_str() {
                "INPUT" => role::W_INPUT,
                "OUTPUT" => role::W_OUTPUT,
                _ => role::W_OTHER,
            };
            if conn.perm & bit != 0 {
                let message = self.build_message(conn, hdr, body);

                let target = self.subs.get(&destination).and_then(|list| {
                    list.iter().copied().find(|&sid| {
                        if sid == conn.sid {
                            conn.state == SessionState::Ready
                        } else {
                            self.sessions
                                .get(&sid)
                                .is_some_and(|sub| sub.state == SessionState::Ready)
                        }
                    })
                });

                match target {
                    Some(sid) => ok = self.deliver_direct(conn, sid, message),
                    None => match self.store.queue_by_name(&destination) {
                        Ok(queue) => match self.store.push_front(queue, &message, max_num) {
                            Ok(PushOutcome::Stored { depth }) => {
                                ok = true;
                                queue_size = depth;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!("durable push to '{destination}' failed: {err}");
                            }
                        },
                        Err(err) => warn!("queue lookup for '{destination}' failed: {err}"),
                    },
                }
            }
        }

        if receipt.is_empty() {
            return;
        }
        let registry = self.poll.registry();
        if ok {
            post(registry, conn, frame::receipt_queue_size(receipt, queue_size), false);
        } else {
            post(
                registry,
                conn,
                frame::text_error("Unable to dispatch message"),
                false,
            );
        }
    }

    /// The delivered frame: `MESSAGE`, broker-authoritative headers first,
    /// then the remaining client headers in sorted order, then the body.
    /// Inbound occurrences of the authoritative headers are dropped.
    fn build_message(
        &mut self,
        conn: &Connection,
        hdr: &mut BTreeMap<String, String>,
        body: &[u8],
    ) -> Vec<u8> {
        for key in ["content-length", "source", "source-ip", "reply-to", "message-id"] {
            hdr.remove(key);
        }

        let message_id = self.next_message_id();
        let mut out = Vec::with_capacity(body.len() + 256);
        out.extend_from_slice(b"MESSAGE\n");
        let _ = write!(
            out,
            "reply-to:{SID_TAG}{}\nmessage-id:{message_id}\nsource:{}\nsource-ip:{}\ncontent-length:{}\n",
            conn.sid,
            conn.identity,
            conn.addr.ip(),
            body.len()
        );
        for (name, value) in hdr.iter() {
            let _ = write!(out, "{name}:{value}\n");
        }
        out.push(b'\n');
        out.extend_from_slice(body);
        out
    }

    /// Hands a message to a session: straight to its outbound queue when it
    /// is live and `Ready`, otherwise into its private durable queue. The
    /// sender is detached from the session table, so self-addressed sends
    /// are resolved against `conn` directly.
    fn deliver_direct(&mut self, conn: &mut Connection, target: u32, message: Vec<u8>) -> bool {
        if target == conn.sid {
            if conn.state == SessionState::Ready {
                return deliver(self.poll.registry(), conn, message);
            }
        } else if let Some(dc) = self.sessions.get_mut(&target) {
            if dc.state == SessionState::Ready {
                let registry = self.poll.registry();
                return deliver(registry, dc, message);
            }
        }
        self.spill_private(target, &message)
    }

    fn spill_private(&self, target: u32, message: &[u8]) -> bool {
        let pushed = self
            .store
            .queue_by_index(target)
            .and_then(|queue| self.store.push_front(queue, message, None));
        match pushed {
            Ok(PushOutcome::Stored { .. }) => true,
            Ok(_) => false,
            Err(err) => {
                warn!("private queue push for {SID_TAG}{target} failed: {err}");
                false
            }
        }
    }

    /// ACK confirms whatever was in flight; deliveries are strictly
    /// one-at-a-time, so the acknowledged id is implicit. Going back to
    /// `Ready` immediately tries the next message: the private queue first,
    /// then every subscription until one yields.
    fn on_ack(&mut self, conn: &mut Connection) {
        if conn.state != SessionState::AwaitAck {
            return;
        }
        conn.state = SessionState::Ready;

        let mut next = match self
            .store
            .queue_by_index(conn.sid)
            .and_then(|queue| self.store.pop_back(queue))
        {
            Ok(message) => message,
            Err(err) => {
                warn!("private queue pop for sid={} failed: {err}", conn.sid);
                None
            }
        };

        if next.is_none() {
            for queue in conn.subs.values() {
                match self.store.pop_back(*queue) {
                    Ok(Some(message)) => {
                        next = Some(message);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => warn!("subscription pop failed (sid={}): {err}", conn.sid),
                }
            }
        }

        if let Some(message) = next {
            deliver(self.poll.registry(), conn, message);
        }
    }

    fn on_subscribe(
        &mut self,
        conn: &mut Connection,
        hdr: &BTreeMap<String, String>,
        receipt: &str,
    ) {
        if hdr.get("ack").map(String::as_str) != Some("client") {
            post(
                self.poll.registry(),
                conn,
                frame::text_error("Only 'ack:client' is allowed"),
                false,
            );
            return;
        }

        let destination = hdr.get("destination").cloned().unwrap_or_default();
        let mut subscribed = None;

        if !destination.is_empty() {
            let allowed = match destination.as_str() {
                "INPUT" => conn.perm & role::S_INPUT != 0,
                "OUTPUT" => conn.perm & role::S_OUTPUT != 0,
                name if name == conn.identity => conn.perm & role::S_SELF != 0,
                // Historical: subscribe-other is gated on the write bit.
                _ => conn.perm & role::W_OTHER != 0,
            };
            if allowed {
                match self.add_subscription(&destination, conn) {
                    Ok(Some(queue)) => subscribed = Some(queue),
                    Ok(None) => {
                        debug!("duplicate subscribe to '{destination}' (sid={})", conn.sid);
                    }
                    Err(err) => warn!("subscribe to '{destination}' failed: {err}"),
                }
            }
        }

        match subscribed {
            Some(queue) => {
                if !receipt.is_empty() {
                    post(self.poll.registry(), conn, frame::receipt_ok(receipt), false);
                }
                info!(
                    "subscribe '{}' to '{destination}' (sid={}, addr='{}')",
                    conn.identity, conn.sid, conn.addr
                );
                // A ready subscriber drains one backlog message right away;
                // its ACKs keep draining before anything new cuts in line.
                if conn.state == SessionState::Ready {
                    match self.store.pop_back(queue) {
                        Ok(Some(message)) => {
                            deliver(self.poll.registry(), conn, message);
                        }
                        Ok(None) => {}
                        Err(err) => warn!("backlog pop from '{destination}' failed: {err}"),
                    }
                }
            }
            None => {
                if !receipt.is_empty() {
                    post(
                        self.poll.registry(),
                        conn,
                        frame::text_error("Unable to subscribe"),
                        false,
                    );
                }
            }
        }
    }

    fn on_unsubscribe(
        &mut self,
        conn: &mut Connection,
        hdr: &BTreeMap<String, String>,
        receipt: &str,
    ) {
        let destination = hdr.get("destination").cloned().unwrap_or_default();
        let ok = !destination.is_empty() && self.remove_subscription(&destination, conn);
        if ok {
            info!(
                "unsubscribe '{}' from '{destination}' (sid={}, addr='{}')",
                conn.identity, conn.sid, conn.addr
            );
        }

        if receipt.is_empty() {
            return;
        }
        let registry = self.poll.registry();
        if ok {
            post(registry, conn, frame::receipt_ok(receipt), false);
        } else {
            post(
                registry,
                conn,
                frame::text_error("Unable to unsubscribe"),
                false,
            );
        }
    }

    fn on_disconnect(&mut self, conn: &mut Connection, receipt: &str) {
        info!(
            "disconnect '{}' (sid={}, addr='{}')",
            conn.identity, conn.sid, conn.addr
        );
        if !receipt.is_empty() {
            post(self.poll.registry(), conn, frame::receipt_ok(receipt), true);
        } else if conn.has_outbound() {
            conn.shutdown_when_drained = true;
        } else {
            conn.eof = true;
        }
    }

    fn on_system(&mut self, conn: &mut Connection, hdr: &BTreeMap<String, String>) {
        if conn.perm & role::SYSTEM == 0 {
            post(
                self.poll.registry(),
                conn,
                frame::text_error("Access denied"),
                true,
            );
            return;
        }

        let mut reply = b"SYSTEM\ncontent-type:text/plain\n\n".to_vec();
        match hdr.get("cmd").map(String::as_str).unwrap_or("") {
            "ls" => {
                if let Err(err) = self.store.list(&mut reply) {
                    warn!("queue listing failed: {err}");
                }
            }
            "count" => match self.store.count() {
                Ok(count) => {
                    let _ = write!(reply, "{count}\n");
                }
                Err(err) => warn!("queue count failed: {err}"),
            },
            "size" => {
                let arg = hdr.get("arg").map(String::as_str).unwrap_or("");
                for name in arg.split(',').filter(|name| !name.is_empty()) {
                    match self.store.lookup(name) {
                        Ok(Some(queue)) => {
                            let size = self.store.size(queue).unwrap_or(0);
                            let _ = write!(reply, "{name} {size}\n");
                        }
                        // Unknown names are omitted, not created.
                        Ok(None) => {}
                        Err(err) => warn!("size lookup for '{name}' failed: {err}"),
                    }
                }
            }
            _ => {}
        }

        post(self.poll.registry(), conn, reply, false);
    }

    fn on_put(
        &mut self,
        conn: &mut Connection,
        hdr: &BTreeMap<String, String>,
        body: &[u8],
        receipt: &str,
    ) {
        let seq_id = hdr.get("seq-id").map(String::as_str).unwrap_or("");
        let range = hdr.get("range").map(String::as_str).unwrap_or("");

        let mut total = None;
        if let Some((offset, length)) = parse_put_range(range) {
            if blob::valid_key(&conn.identity)
                && blob::valid_key(seq_id)
                && length == body.len() as u64
                && length > 0
                && length <= MAX_CHUNK as u64
                && offset
                    .checked_add(length)
                    .is_some_and(|end| end < MAX_BLOB)
            {
                match self.blobs.put(&conn.identity, seq_id, offset, body) {
                    Ok(len) => total = Some(len),
                    Err(err) => warn!("blob write failed (sid={}): {err}", conn.sid),
                }
            }
        }

        if receipt.is_empty() {
            return;
        }
        let registry = self.poll.registry();
        match total {
            Some(len) => {
                let filename = BlobStore::file_name(&conn.identity, seq_id);
                let reply = format!(
                    "RECEIPT\nreceipt-id:{receipt}\nfilename:{filename}\nlength:{len}\n\nOK\n"
                );
                post(registry, conn, reply.into_bytes(), false);
            }
            None => post(registry, conn, frame::text_error("Can't do it"), false),
        }
    }

    fn on_get(&mut self, conn: &mut Connection, hdr: &BTreeMap<String, String>, receipt: &str) {
        let seq_id = hdr.get("seq-id").map(String::as_str).unwrap_or("");
        let range = hdr.get("range").map(String::as_str).unwrap_or("");
        let (offset, length) = parse_get_range(range);

        let mut result = None;
        if blob::valid_key(&conn.identity) && blob::valid_key(seq_id) {
            match self.blobs.get(&conn.identity, seq_id, offset, length) {
                Ok(read) => result = Some(read),
                Err(err) => debug!("blob read failed (sid={}): {err}", conn.sid),
            }
        }

        if receipt.is_empty() {
            return;
        }
        let registry = self.poll.registry();
        match result {
            Some((data, total)) => {
                let filename = BlobStore::file_name(&conn.identity, seq_id);
                let mut reply = format!(
                    "RECEIPT\nreceipt-id:{receipt}\ncontent-length:{}\nfilename:{filename}\nlength:{total}\n\n",
                    data.len()
                )
                .into_bytes();
                reply.extend_from_slice(&data);
                post(registry, conn, reply, false);
            }
            None => post(registry, conn, frame::text_error("Can't do it"), false),
        }
    }
}

/// Pushes a MESSAGE into a ready session's outbound queue and parks the
/// session in `AwaitAck`. A full queue refuses delivery.
fn deliver(registry: &Registry, target: &mut Connection, message: Vec<u8>) -> bool {
    if target.out.push(message, false) {
        target.arm(registry, Interest::READABLE | Interest::WRITABLE);
        target.state = SessionState::AwaitAck;
        true
    } else {
        false
    }
}

/// A receipt id longer than 64 bytes keeps only its last 64 bytes.
fn truncate_receipt(receipt: String) -> String {
    let bytes = receipt.as_bytes();
    if bytes.len() <= MAX_RECEIPT_LEN {
        receipt
    } else {
        String::from_utf8_lossy(&bytes[bytes.len() - MAX_RECEIPT_LEN..]).into_owned()
    }
}

/// `range: <start>-<end_inclusive>` → `(offset, length)`. PUT requires an
/// explicit, well-formed range.
fn parse_put_range(range: &str) -> Option<(u64, u64)> {
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    let length = end.checked_sub(start)?.checked_add(1)?;
    Some((start, length))
}

/// GET tolerates a bare offset or a malformed range; the length defaults to
/// (and is capped at) one chunk.
fn parse_get_range(range: &str) -> (u64, usize) {
    match range.split_once('-') {
        Some((start, end)) => {
            let offset = start.trim().parse::<u64>().unwrap_or(0);
            let length = end
                .trim()
                .parse::<u64>()
                .ok()
                .and_then(|last| last.checked_sub(offset))
                .and_then(|span| span.checked_add(1))
                .unwrap_or(0);
            let length = if length == 0 || length > MAX_CHUNK as u64 {
                MAX_CHUNK as u64
            } else {
                length
            };
            (offset, length as usize)
        }
        None => (range.trim().parse().unwrap_or(0), MAX_CHUNK),
    }
}
