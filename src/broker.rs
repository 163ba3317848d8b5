//! The connection engine: a single-threaded, non-blocking socket reactor
//! owning every piece of broker state.
//!
//! One thread owns the session table, the subscription index, the durable
//! store and the user directory; handlers run to completion between frames,
//! so no locking exists anywhere. Signals are delivered as atomic flags and
//! consumed cooperatively at the top of each tick.
//!
//! The poller is edge-triggered, while the scheduling model (4 KiB of reads
//! and one outbound frame per connection per tick, for fairness) wants
//! level-triggered semantics. Readiness is therefore latched in per-
//! connection `can_read`/`can_write` flags, cleared on `WouldBlock`; while
//! any latched work remains the loop polls with a zero timeout.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::blob::BlobStore;
use crate::config::parse_listen;
use crate::conn::{Connection, SessionState};
use crate::role::ROLE_ALL;
use crate::store::{QueueId, Store};
use crate::users::UserDirectory;
use crate::Result;

const LISTENER: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 1024;
const READ_BURST: usize = 4;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Development-only mode: skip authentication entirely and hand every
    /// connection the permissive role.
    pub no_login: bool,
    /// Directory for PUT/GET blob files.
    pub blob_dir: PathBuf,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            no_login: false,
            blob_dir: PathBuf::from("."),
        }
    }
}

pub struct Broker {
    pub(crate) poll: Poll,
    listener: Option<TcpListener>,
    pub(crate) sessions: HashMap<u32, Connection>,
    /// Queue name → subscribed session ids. Ids, not handles: dangling
    /// entries are pruned on disconnect.
    pub(crate) subs: HashMap<String, Vec<u32>>,
    pub(crate) store: Store,
    pub(crate) users: UserDirectory,
    pub(crate) blobs: BlobStore,
    pub(crate) no_login: bool,
    next_sid: u32,
    next_mid: u32,
}

impl Broker {
    pub fn new(store: Store, users: UserDirectory, options: BrokerOptions) -> Result<Broker> {
        Ok(Broker {
            poll: Poll::new()?,
            listener: None,
            sessions: HashMap::new(),
            subs: HashMap::new(),
            store,
            users,
            blobs: BlobStore::new(&options.blob_dir),
            no_login: options.no_login,
            next_sid: 0,
            next_mid: 0,
        })
    }

    /// Binds the listener: non-blocking, `SO_REUSEADDR`, explicit backlog.
    /// Returns the bound address (useful with an ephemeral port).
    pub fn listen(&mut self, addr: &str, backlog: u32) -> Result<SocketAddr> {
        let sockaddr = parse_listen(addr)?;
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&sockaddr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;

        let mut listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        self.listener = Some(listener);
        info!("listen '{addr}'");
        Ok(local)
    }

    /// Runs the reactor until `shutdown` is raised. `reload` rebuilds the
    /// user directory at the next tick (SIGHUP).
    pub fn run(&mut self, shutdown: &AtomicBool, reload: &AtomicBool) -> Result<()> {
        let mut events = Events::with_capacity(256);

        while !shutdown.load(Ordering::Relaxed) {
            if reload.swap(false, Ordering::Relaxed) {
                let ok = self.users.reload().is_ok();
                info!("reload user database - {}", if ok { "OK" } else { "FAIL" });
            }

            let timeout = if self.has_pending_work() {
                Duration::ZERO
            } else {
                POLL_INTERVAL
            };
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let mut accept = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => accept = true,
                    Token(raw) => {
                        if let Some(conn) = self.sessions.get_mut(&(raw as u32)) {
                            if event.is_readable() || event.is_read_closed() {
                                conn.can_read = true;
                            }
                            if event.is_writable() {
                                conn.can_write = true;
                            }
                        }
                    }
                }
            }

            if accept {
                self.on_accept();
            }

            let sids: Vec<u32> = self.sessions.keys().copied().collect();
            for sid in sids {
                self.service(sid);
            }
        }
        Ok(())
    }

    /// Closes all sessions, the listener and both databases.
    pub fn close(self) -> Result<()> {
        drop(self.sessions);
        drop(self.listener);
        self.users.close();
        self.store.close(false)
    }

    fn has_pending_work(&self) -> bool {
        self.sessions.values().any(|conn| {
            (conn.can_read && !conn.eof)
                || (conn.can_write && (conn.has_outbound() || conn.shutdown_when_drained))
        })
    }

    fn on_accept(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => self.setup_session(stream, addr),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn setup_session(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let Some(sid) = self.alloc_sid() else {
            warn!("no free session id, dropping connection from '{addr}'");
            return;
        };
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, Token(sid as usize), Interest::READABLE)
        {
            warn!("register failed for '{addr}': {err}");
            return;
        }

        let mut conn = Connection::new(sid, stream, addr);
        if self.no_login {
            conn.perm = ROLE_ALL;
            conn.identity = "noname".to_string();
            conn.state = SessionState::Ready;
        }
        info!("connection from '{addr}'");
        self.sessions.insert(sid, conn);
    }

    /// Session ids are monotonic, skip zero and never collide with a live
    /// session; after ten occupied candidates the connection is refused.
    fn alloc_sid(&mut self) -> Option<u32> {
        for _ in 0..10 {
            self.next_sid = self.next_sid.wrapping_add(1);
            if self.next_sid == 0 {
                self.next_sid = 1;
            }
            if !self.sessions.contains_key(&self.next_sid) {
                return Some(self.next_sid);
            }
        }
        None
    }

    pub(crate) fn next_message_id(&mut self) -> u32 {
        if self.next_mid == u32::MAX {
            self.next_mid = 0;
        }
        self.next_mid += 1;
        self.next_mid
    }

    /// Services one connection: a bounded read burst, frame dispatch, then
    /// at most one outbound frame. The connection is detached from the
    /// session table so handlers may freely address other sessions.
    fn service(&mut self, sid: u32) {
        let Some(mut conn) = self.sessions.remove(&sid) else {
            return;
        };

        if conn.can_read && !conn.eof {
            self.service_read(&mut conn);
        }
        if !conn.eof && conn.can_write {
            service_write(&mut conn);
        }

        if conn.eof {
            self.teardown(conn);
        } else {
            let want = if conn.has_outbound() || conn.shutdown_when_drained {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            conn.arm(self.poll.registry(), want);
            self.sessions.insert(sid, conn);
        }
    }

    fn service_read(&mut self, conn: &mut Connection) {
        for _ in 0..READ_BURST {
            if conn.eof {
                break;
            }
            let mut buf = [0u8; READ_CHUNK];
            match conn.stream.read(&mut buf) {
                Ok(0) => conn.eof = true,
                Ok(n) => {
                    // Frames completed before a parse error still dispatch;
                    // the error then ends the connection.
                    let parse_failed = conn.parser.feed(&buf[..n]).is_err();
                    while let Some(frame) = conn.parser.next() {
                        self.on_frame(conn, frame);
                    }
                    if parse_failed {
                        debug!("parse error, dropping connection (sid={})", conn.sid);
                        conn.eof = true;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    conn.can_read = false;
                    break;
                }
                Err(_) => conn.eof = true,
            }
        }
    }

    fn teardown(&mut self, mut conn: Connection) {
        info!("close connection to '{}'", conn.addr);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        for name in conn.subs.keys() {
            if let Some(list) = self.subs.get_mut(name) {
                list.retain(|&sid| sid != conn.sid);
            }
        }
        self.subs.retain(|_, list| !list.is_empty());
    }

    /// Records a subscription. `Ok(None)` flags a duplicate, which the
    /// dispatcher reports as a failed subscribe.
    pub(crate) fn add_subscription(
        &mut self,
        name: &str,
        conn: &mut Connection,
    ) -> Result<Option<QueueId>> {
        if conn.subs.contains_key(name) {
            return Ok(None);
        }
        let queue = self.store.queue_by_name(name)?;
        conn.subs.insert(name.to_string(), queue);
        self.subs.entry(name.to_string()).or_default().push(conn.sid);
        Ok(Some(queue))
    }

    pub(crate) fn remove_subscription(&mut self, name: &str, conn: &mut Connection) -> bool {
        if conn.subs.remove(name).is_none() {
            return false;
        }
        if let Some(list) = self.subs.get_mut(name) {
            list.retain(|&sid| sid != conn.sid);
            if list.is_empty() {
                self.subs.remove(name);
            }
        }
        true
    }
}

/// Queues a reply frame and arms write interest. A full queue drops the
/// frame; the protocol's one-in-flight pacing keeps that from happening to
/// compliant peers.
pub(crate) fn post(
    registry: &Registry,
    conn: &mut Connection,
    frame: Vec<u8>,
    close_after_finish: bool,
) {
    if conn.out.push(frame, close_after_finish) {
        conn.arm(registry, Interest::READABLE | Interest::WRITABLE);
    } else {
        warn!("outbound queue full, dropping frame (sid={})", conn.sid);
    }
}

/// Writes at most one frame. Loading a frame appends the STOMP `\0`
/// terminator; `close_after_finish` takes effect once that frame drains.
fn service_write(conn: &mut Connection) {
    if conn.buffer.is_empty() {
        match conn.out.pop() {
            Some(item) => {
                conn.buffer = item.frame;
                conn.buffer.push(0);
                conn.bytes_sent = 0;
                conn.close_after_finish = item.close_after_finish;
            }
            None => {
                if conn.shutdown_when_drained {
                    conn.eof = true;
                }
                return;
            }
        }
    }

    while conn.bytes_sent < conn.buffer.len() {
        match conn.stream.write(&conn.buffer[conn.bytes_sent..]) {
            Ok(0) => {
                conn.eof = true;
                return;
            }
            Ok(n) => conn.bytes_sent += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                conn.can_write = false;
                return;
            }
            Err(_) => {
                conn.eof = true;
                return;
            }
        }
    }

    conn.buffer.clear();
    conn.bytes_sent = 0;
    if conn.close_after_finish {
        conn.eof = true;
    }
}
