//! Per-connection state: session identity, the protocol state machine, the
//! bounded in-memory outbound queue and the single-frame write buffer.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::frame::FrameParser;
use crate::store::QueueId;

/// Outbound replies buffered per connection. Small on purpose: the peer is
/// served one frame at a time and acknowledges before the next SEND, so the
/// queue holds a handful of frames at most. Overflow drops the frame.
pub const OUT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for CONNECT/STOMP; everything else is a protocol error.
    AwaitLogin,
    /// Authenticated, able to receive a delivery.
    Ready,
    /// One MESSAGE is in flight; the next delivery waits for ACK.
    AwaitAck,
}

pub(crate) struct Outbound {
    pub(crate) frame: Vec<u8>,
    pub(crate) close_after_finish: bool,
}

#[derive(Default)]
pub(crate) struct OutQueue {
    items: VecDeque<Outbound>,
}

impl OutQueue {
    /// Enqueues a frame; `false` means the queue was full and the frame was
    /// dropped.
    pub(crate) fn push(&mut self, frame: Vec<u8>, close_after_finish: bool) -> bool {
        if self.items.len() >= OUT_QUEUE_CAPACITY {
            return false;
        }
        self.items.push_back(Outbound {
            frame,
            close_after_finish,
        });
        true
    }

    pub(crate) fn pop(&mut self) -> Option<Outbound> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct Connection {
    pub(crate) sid: u32,
    pub(crate) stream: TcpStream,
    pub(crate) addr: SocketAddr,
    pub(crate) state: SessionState,
    pub(crate) identity: String,
    pub(crate) perm: u32,
    pub(crate) parser: FrameParser,
    pub(crate) out: OutQueue,
    /// Frame currently on the wire, terminator included.
    pub(crate) buffer: Vec<u8>,
    pub(crate) bytes_sent: usize,
    /// Close once `buffer` fully drains.
    pub(crate) close_after_finish: bool,
    /// Close once the outbound queue and buffer both drain (DISCONNECT
    /// without a receipt).
    pub(crate) shutdown_when_drained: bool,
    pub(crate) eof: bool,
    /// Readiness observed from the poller; cleared on `WouldBlock` so the
    /// edge-triggered source behaves like a level-triggered one.
    pub(crate) can_read: bool,
    pub(crate) can_write: bool,
    armed: Interest,
    /// Subscribed queue name → durable queue handle.
    pub(crate) subs: BTreeMap<String, QueueId>,
}

impl Connection {
    pub(crate) fn new(sid: u32, stream: TcpStream, addr: SocketAddr) -> Connection {
        Connection {
            sid,
            stream,
            addr,
            state: SessionState::AwaitLogin,
            identity: String::new(),
            perm: 0,
            parser: FrameParser::new(),
            out: OutQueue::default(),
            buffer: Vec::new(),
            bytes_sent: 0,
            close_after_finish: false,
            shutdown_when_drained: false,
            eof: false,
            can_read: false,
            can_write: false,
            armed: Interest::READABLE,
            subs: BTreeMap::new(),
        }
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.sid as usize)
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.out.is_empty() || !self.buffer.is_empty()
    }

    /// Re-arms poll interest when it changed; a cached value avoids
    /// reregistering on every tick.
    pub(crate) fn arm(&mut self, registry: &Registry, interest: Interest) {
        if interest == self.armed {
            return;
        }
        let token = self.token();
        if registry
            .reregister(&mut self.stream, token, interest)
            .is_ok()
        {
            self.armed = interest;
        }
    }
}
