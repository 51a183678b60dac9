#![allow(dead_code)]
//! Test harness utilities for tessera-net integration tests.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tessera_core::config::WaveSettings;
use tessera_core::store::{MemoryStore, StateStore};
use tessera_net::framing::{read_message, write_message};
use tessera_net::protocol::{ClientMessage, ServerMessage};
use tessera_net::server::NetServer;
use tessera_types::{GridId, Timestamp};

/// Bind a server on an ephemeral port over a fresh memory store.
pub fn bind_server() -> (NetServer, String) {
    bind_server_with(Arc::new(MemoryStore::new()))
}

pub fn bind_server_with(store: Arc<dyn StateStore>) -> (NetServer, String) {
    let server = NetServer::bind("127.0.0.1:0", store, WaveSettings::default(), Vec::new()).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (server, addr)
}

pub fn ms(v: i64) -> Timestamp {
    Timestamp::from_millis(v)
}

/// Pump the server at `now` until the expected client count is reached, or timeout.
pub fn drive_until_clients(server: &mut NetServer, expected: usize, timeout: Duration) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        server.pump_at(Timestamp::ZERO);
        if server.client_count() >= expected {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "Timed out waiting for {} clients (have {})",
        expected,
        server.client_count()
    );
}

/// Pump the server at `now` until `done` holds, or timeout.
pub fn drive_until<F: Fn(&NetServer) -> bool>(
    server: &mut NetServer,
    now: Timestamp,
    timeout: Duration,
    done: F,
) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        server.pump_at(now);
        if done(server) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out driving server");
}

/// Pump the server at `now` for a short while so queued messages are served.
pub fn settle(server: &mut NetServer, now: Timestamp) {
    for _ in 0..20 {
        server.pump_at(now);
        thread::sleep(Duration::from_millis(5));
    }
}

/// A server pumped on a background thread, for blocking clients.
pub struct RunningServer {
    pub addr: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<NetServer>>,
}

impl RunningServer {
    pub fn start(server: NetServer, addr: String) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut server = server;
            while !flag.load(Ordering::SeqCst) {
                server.pump();
                thread::sleep(Duration::from_millis(2));
            }
            server
        });
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    /// Stop pumping and hand the server back.
    pub fn stop(mut self) -> NetServer {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.take().unwrap().join().unwrap()
    }
}

/// A raw TCP client for protocol-level tests.
///
/// Handshakes are split because tests drive the server on the same thread:
/// 1. `send_hello()`
/// 2. `drive_until_clients()` so the server answers
/// 3. `recv()` the Welcome
pub struct RawClient {
    pub reader: BufReader<TcpStream>,
    pub writer: BufWriter<TcpStream>,
}

impl RawClient {
    pub fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    pub fn send(&mut self, msg: &ClientMessage) -> std::io::Result<()> {
        write_message(&mut self.writer, msg)
    }

    pub fn recv(&mut self) -> std::io::Result<ServerMessage> {
        read_message(&mut self.reader)
    }

    pub fn send_hello(&mut self, name: &str) -> std::io::Result<()> {
        self.send(&ClientMessage::Hello {
            client_name: name.to_string(),
        })
    }

    /// Expect nothing to arrive within `wait`.
    pub fn expect_silence(&mut self, wait: Duration) {
        self.reader.get_ref().set_read_timeout(Some(wait)).unwrap();
        let result = self.recv();
        self.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        match result {
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            other => panic!("Expected silence, got {:?}", other),
        }
    }
}

/// Connect, say Hello, and consume the Welcome.
pub fn connected_client(server: &mut NetServer, addr: &str, name: &str) -> RawClient {
    let expected = server.client_count() + 1;
    let mut client = RawClient::connect(addr).unwrap();
    client.send_hello(name).unwrap();
    drive_until_clients(server, expected, Duration::from_secs(2));
    match client.recv().unwrap() {
        ServerMessage::Welcome { .. } => client,
        other => panic!("Expected Welcome, got {:?}", other),
    }
}

/// Connect a client and join it to `grid`'s room.
pub fn joined_client(server: &mut NetServer, addr: &str, name: &str, grid: GridId) -> RawClient {
    let mut client = connected_client(server, addr, name);
    client.send(&ClientMessage::Join { grid }).unwrap();
    let before = server.room_size(grid);
    drive_until(server, Timestamp::ZERO, Duration::from_secs(2), |s| {
        s.room_size(grid) > before
    });
    match client.recv().unwrap() {
        ServerMessage::Joined { grid: joined } => assert_eq!(joined, grid),
        other => panic!("Expected Joined, got {:?}", other),
    }
    client
}
