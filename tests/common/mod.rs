//! Shared fixtures: a broker running on its own thread behind an ephemeral
//! port, and a minimal blocking STOMP client.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use md5::{Digest, Md5};

use stompd::broker::{Broker, BrokerOptions};
use stompd::store::{DbKind, Store};
use stompd::users::UserDirectory;

pub struct TestBroker {
    pub addr: SocketAddr,
    pub reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestBroker {
    pub fn start(spool: &Path, users_file: &Path, max_queue_size: u32) -> TestBroker {
        let spool = spool.to_path_buf();
        let users_file = users_file.to_path_buf();
        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_reload = Arc::clone(&reload);
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let store = Store::open(
                spool.join("persist.db"),
                DbKind::Tree,
                max_queue_size,
                false,
            )
            .expect("open store");
            let users = UserDirectory::open(&users_file, spool.join("users.cache.db"))
                .expect("open user directory");
            let mut broker = Broker::new(
                store,
                users,
                BrokerOptions {
                    no_login: false,
                    blob_dir: spool.clone(),
                },
            )
            .expect("create broker");
            let addr = broker.listen("127.0.0.1:0", 16).expect("listen");
            tx.send(addr).expect("report listen address");
            broker.run(&thread_shutdown, &thread_reload).expect("reactor loop");
            broker.close().expect("close broker");
        });

        let addr = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("broker did not come up");
        TestBroker {
            addr,
            reload,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Raises the reload flag, as the SIGHUP handler would, and waits for
    /// the reactor to pick it up.
    pub fn reload_users(&self) {
        self.reload.store(true, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(500));
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("broker thread");
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// One user-file line with an MD5-salted passcode.
pub fn md5_user(name: &str, passcode: &str, salt: &str, role: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(passcode.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{name}:md5:{}:{salt}:{role}\n", hex::encode(hasher.finalize()))
}

#[derive(Debug)]
pub struct WireFrame {
    pub command: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

pub struct StompClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl StompClient {
    pub fn connect(addr: SocketAddr) -> StompClient {
        let stream = TcpStream::connect(addr).expect("connect to broker");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream.set_nodelay(true).expect("nodelay");
        StompClient {
            stream,
            buf: Vec::new(),
        }
    }

    /// Connects and authenticates; returns the client and its session id.
    pub fn login(addr: SocketAddr, login: &str, passcode: &str) -> (StompClient, u32) {
        let mut client = StompClient::connect(addr);
        client.send_frame("CONNECT", &[("login", login), ("passcode", passcode)], b"");
        let reply = client.read_frame();
        assert_eq!(reply.command, "CONNECTED", "login rejected: {reply:?}");
        let session = reply
            .headers
            .get("session")
            .expect("session header")
            .parse()
            .expect("numeric session id");
        (client, session)
    }

    pub fn send_frame(&mut self, command: &str, headers: &[(&str, &str)], body: &[u8]) {
        let mut wire = Vec::new();
        wire.extend_from_slice(command.as_bytes());
        wire.push(b'\n');
        for (name, value) in headers {
            wire.extend_from_slice(name.as_bytes());
            wire.push(b':');
            wire.extend_from_slice(value.as_bytes());
            wire.push(b'\n');
        }
        wire.push(b'\n');
        wire.extend_from_slice(body);
        wire.push(0);
        self.stream.write_all(&wire).expect("write frame");
    }

    /// Blocks until one full frame (terminated by `\0`) arrives.
    pub fn read_frame(&mut self) -> WireFrame {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == 0) {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                return parse_frame(&raw[..raw.len() - 1]);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read from broker");
            assert!(n > 0, "broker closed the connection mid-frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn expect(&mut self, command: &str) -> WireFrame {
        let frame = self.read_frame();
        assert_eq!(frame.command, command, "unexpected frame: {frame:?}");
        frame
    }

    /// Asserts the broker closes the connection (after draining any
    /// remaining frames).
    pub fn expect_eof(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(err) => panic!("expected EOF, got error: {err}"),
            }
        }
    }

    pub fn ack(&mut self) {
        self.send_frame("ACK", &[], b"");
    }
}

fn parse_frame(raw: &[u8]) -> WireFrame {
    let split = raw
        .windows(2)
        .position(|w| w == b"\n\n")
        .expect("frame header terminator");
    let head = std::str::from_utf8(&raw[..split]).expect("frame head is utf8");
    let body = raw[split + 2..].to_vec();

    let mut lines = head.lines();
    let command = lines.next().unwrap_or_default().to_string();
    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.to_string(), value.to_string());
        }
    }
    WireFrame {
        command,
        headers,
        body,
    }
}
