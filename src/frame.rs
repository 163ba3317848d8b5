//! Incremental STOMP 1.0 frame parser and reply composition.
//!
//! Wire format: `COMMAND \n (HEADER:VALUE \n)* \n BODY \0`. Both `\n` and
//! `\r\n` terminate lines, and stray `\r`/`\n`/`\0` bytes before a command
//! are skipped so a desynchronized peer can recover. Bytes are accepted in
//! arbitrary chunks; completed frames queue up and are drained with
//! [`FrameParser::next`].

use std::collections::{BTreeMap, VecDeque};

use crate::{Error, Result};

pub const MAX_COMMAND_LEN: usize = 16;
pub const MAX_HEADER_LEN: usize = 256;
pub const MAX_HEADERS: usize = 32;
pub const MAX_BODY_LEN: usize = 30 * 1024 * 1024;

/// One decoded frame. Headers are kept as raw `name:value` lines in source
/// order; the dispatcher rehomes them into a map (last occurrence wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<String>,
    pub body: Vec<u8>,
}

impl Frame {
    /// Splits each header at the first `:`. Lines without a colon are
    /// dropped, duplicates resolve to the last occurrence.
    pub fn header_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for line in &self.headers {
            if let Some(pos) = line.find(':') {
                map.insert(line[..pos].to_string(), line[pos + 1..].to_string());
            }
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    InCommand,
    CrAfterCommand,
    WaitHeader,
    CrAfterHeader,
    HeaderSpaceSkip,
    InBody,
}

pub struct FrameParser {
    state: State,
    command: Vec<u8>,
    header: Vec<u8>,
    headers: Vec<String>,
    body: Vec<u8>,
    ready: VecDeque<Frame>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            state: State::Start,
            command: Vec::new(),
            header: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Feeds a chunk of bytes. A bound violation or malformed line ending is
    /// fatal: the parser stays poisoned and the connection must be dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        for &ch in bytes {
            match self.state {
                State::Start => {
                    if ch == b'\r' || ch == b'\n' || ch == 0 {
                        continue;
                    }
                    self.command.push(ch);
                    self.state = State::InCommand;
                }
                State::InCommand => {
                    if ch == b'\r' {
                        self.state = State::CrAfterCommand;
                    } else if ch == b'\n' {
                        self.state = State::WaitHeader;
                        self.header.clear();
                    } else {
                        if self.command.len() >= MAX_COMMAND_LEN {
                            return Err(Error::Frame("command too long"));
                        }
                        self.command.push(ch);
                    }
                }
                State::CrAfterCommand => {
                    if ch != b'\n' {
                        return Err(Error::Frame("expected LF after command CR"));
                    }
                    self.state = State::WaitHeader;
                    self.header.clear();
                }
                State::WaitHeader => {
                    if ch == b'\r' {
                        self.state = State::CrAfterHeader;
                    } else if ch == b'\n' {
                        if self.header.is_empty() {
                            self.state = State::InBody;
                        } else {
                            self.push_header()?;
                        }
                    } else {
                        if self.header.len() >= MAX_HEADER_LEN {
                            return Err(Error::Frame("header too long"));
                        }
                        self.header.push(ch);
                        if ch == b':' {
                            self.state = State::HeaderSpaceSkip;
                        }
                    }
                }
                State::CrAfterHeader => {
                    if ch != b'\n' {
                        return Err(Error::Frame("expected LF after header CR"));
                    }
                    if self.header.is_empty() {
                        self.state = State::InBody;
                    } else {
                        self.push_header()?;
                        self.state = State::WaitHeader;
                    }
                }
                State::HeaderSpaceSkip => {
                    if ch == b' ' {
                        continue;
                    } else if ch == b'\n' {
                        if self.header.is_empty() {
                            self.state = State::InBody;
                        } else {
                            self.push_header()?;
                            self.state = State::WaitHeader;
                        }
                    } else if ch == b'\r' {
                        self.state = State::CrAfterHeader;
                    } else {
                        if self.header.len() >= MAX_HEADER_LEN {
                            return Err(Error::Frame("header too long"));
                        }
                        self.header.push(ch);
                        self.state = State::WaitHeader;
                    }
                }
                State::InBody => {
                    if ch == 0 {
                        self.finish_frame();
                    } else {
                        if self.body.len() >= MAX_BODY_LEN {
                            return Err(Error::Frame("body too large"));
                        }
                        self.body.push(ch);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drains the next fully decoded frame, if any.
    pub fn next(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    fn push_header(&mut self) -> Result<()> {
        if self.headers.len() >= MAX_HEADERS {
            return Err(Error::Frame("too many headers"));
        }
        let line = std::mem::take(&mut self.header);
        self.headers.push(String::from_utf8_lossy(&line).into_owned());
        Ok(())
    }

    fn finish_frame(&mut self) {
        let frame = Frame {
            command: String::from_utf8_lossy(&self.command).into_owned(),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        };
        self.command.clear();
        self.header.clear();
        self.state = State::Start;
        self.ready.push_back(frame);
    }
}

/// `ERROR` reply with a plain-text explanation. The connection writer
/// appends the frame terminator.
pub fn text_error(message: &str) -> Vec<u8> {
    format!("ERROR\ncontent-type:text/plain\n\n{message}\n").into_bytes()
}

/// `CONNECTED` reply carrying the freshly allocated session id.
pub fn connected(session: u32) -> Vec<u8> {
    format!("CONNECTED\nsession:{session}\n\n").into_bytes()
}

/// `RECEIPT` acknowledging a subscription or disconnect request.
pub fn receipt_ok(receipt_id: &str) -> Vec<u8> {
    format!("RECEIPT\nreceipt-id:{receipt_id}\n\nOK\n").into_bytes()
}

/// `RECEIPT` for an accepted SEND, reporting the durable backlog depth
/// (zero when the message went straight to a live subscriber).
pub fn receipt_queue_size(receipt_id: &str, queue_size: u32) -> Vec<u8> {
    format!("RECEIPT\nreceipt-id:{receipt_id}\nqueue-size:{queue_size}\n\nOK\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut FrameParser, bytes: &[u8]) -> Vec<Frame> {
        parser.feed(bytes).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = parser.next() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn parses_mixed_line_endings_and_header_spaces() {
        let wire = b"MESSAGE\r\n\
            test1: value1\n\
            test2: value2\r\n\
            test3:value3\n\
            test4:value4\r\n\
            test5: \n\
            test6:\r\n\
            \r\n\
            hello world\0";

        let mut parser = FrameParser::new();
        let frames = feed_all(&mut parser, wire);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.command, "MESSAGE");
        assert_eq!(frame.body, b"hello world");

        let map = frame.header_map();
        assert_eq!(map.get("test1").unwrap(), "value1");
        assert_eq!(map.get("test3").unwrap(), "value3");
        assert_eq!(map.get("test5").unwrap(), "");
        assert_eq!(map.get("test6").unwrap(), "");
    }

    #[test]
    fn accepts_arbitrary_chunking() {
        let wire = b"SEND\ndestination:q\n\npayload\0SEND\ndestination:r\n\n\0";
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for &byte in wire.iter() {
            parser.feed(&[byte]).unwrap();
            while let Some(frame) = parser.next() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body, b"payload");
        assert_eq!(frames[1].header_map().get("destination").unwrap(), "r");
    }

    #[test]
    fn resynchronizes_past_leading_noise() {
        let mut parser = FrameParser::new();
        let frames = feed_all(&mut parser, b"\0\r\n\nACK\n\n\0");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, "ACK");
    }

    #[test]
    fn command_of_sixteen_ok_seventeen_fatal() {
        let mut parser = FrameParser::new();
        parser.feed(b"ABCDEFGHIJKLMNOP\n\n\0").unwrap();
        assert_eq!(parser.next().unwrap().command.len(), 16);

        let mut parser = FrameParser::new();
        assert!(parser.feed(b"ABCDEFGHIJKLMNOPQ\n\n\0").is_err());
    }

    #[test]
    fn thirty_third_header_fatal() {
        let mut ok = String::from("SEND\n");
        for i in 0..MAX_HEADERS {
            ok.push_str(&format!("h{i}:v\n"));
        }
        let mut parser = FrameParser::new();
        parser.feed(ok.as_bytes()).unwrap();
        parser.feed(b"\n\0").unwrap();
        assert_eq!(parser.next().unwrap().headers.len(), MAX_HEADERS);

        let mut parser = FrameParser::new();
        parser.feed(ok.as_bytes()).unwrap();
        assert!(parser.feed(b"one:more\n").is_err());
    }

    #[test]
    fn oversized_header_line_fatal() {
        let mut parser = FrameParser::new();
        let line = format!("SEND\nh:{}\n", "x".repeat(MAX_HEADER_LEN));
        assert!(parser.feed(line.as_bytes()).is_err());
    }

    #[test]
    fn body_bound_is_exact() {
        let mut parser = FrameParser::new();
        parser.feed(b"SEND\n\n").unwrap();
        parser.feed(&vec![b'x'; MAX_BODY_LEN]).unwrap();
        parser.feed(b"\0").unwrap();
        assert_eq!(parser.next().unwrap().body.len(), MAX_BODY_LEN);

        let mut parser = FrameParser::new();
        parser.feed(b"SEND\n\n").unwrap();
        parser.feed(&vec![b'x'; MAX_BODY_LEN]).unwrap();
        assert!(parser.feed(b"y").is_err());
    }

    #[test]
    fn bare_cr_inside_command_is_fatal() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"SEND\rX").is_err());
    }

    #[test]
    fn composed_replies_reparse() {
        let mut parser = FrameParser::new();
        for (wire, command) in [
            (connected(7), "CONNECTED"),
            (receipt_ok("r1"), "RECEIPT"),
            (receipt_queue_size("r2", 3), "RECEIPT"),
            (text_error("Access denied"), "ERROR"),
        ] {
            parser.feed(&wire).unwrap();
            parser.feed(b"\0").unwrap();
            let frame = parser.next().unwrap();
            assert_eq!(frame.command, command);
        }

        parser.feed(&receipt_queue_size("r9", 12)).unwrap();
        parser.feed(b"\0").unwrap();
        let frame = parser.next().unwrap();
        let map = frame.header_map();
        assert_eq!(map.get("receipt-id").unwrap(), "r9");
        assert_eq!(map.get("queue-size").unwrap(), "12");
        assert_eq!(frame.body, b"OK\n");
    }

    #[test]
    fn duplicate_header_last_wins() {
        let mut parser = FrameParser::new();
        let frames = feed_all(&mut parser, b"SEND\ndestination:a\ndestination:b\n\n\0");
        assert_eq!(frames[0].header_map().get("destination").unwrap(), "b");
    }
}
