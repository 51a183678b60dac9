//! Network clients for Tessera.
//!
//! `RemoteStore` forwards every `StateStore` call to a server and waits for
//! the matching reply; a lost connection surfaces as
//! `StoreError::Unreachable` and the next call reconnects. `WaveClient`
//! keeps a room subscription open, collects pushed wave frames, and
//! reconnects and rejoins on its own after the connection drops.

use std::io::{self, BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use tessera_core::store::{StateStore, StoreError, StoreResult};
use tessera_types::{
    AdminAction, AdminOutcome, Cell, CellId, CellPatch, Effect, EffectSpec, GlobalEffectState,
    Grid, GridId, SessionToken, Timestamp, WaveFrame,
};

use crate::framing::{read_message, write_message};
use crate::protocol::{ClientId, ClientMessage, ServerMessage, StoreRequest, StoreValue};

/// How long a store call waits for its reply by default.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// A handshaken connection: the write half plus a channel fed by a reader
/// thread.
struct Link {
    writer: BufWriter<TcpStream>,
    incoming: Receiver<ServerMessage>,
    client_id: ClientId,
}

impl Link {
    fn open(addr: &str, client_name: &str, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        read_stream.set_read_timeout(Some(timeout))?;

        let mut writer = BufWriter::new(stream);
        let mut reader = BufReader::new(read_stream);
        write_message(
            &mut writer,
            &ClientMessage::Hello {
                client_name: client_name.to_string(),
            },
        )?;

        let client_id = match read_message::<_, ServerMessage>(&mut reader)? {
            ServerMessage::Welcome { client_id } => client_id,
            ServerMessage::Error { message } => {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, message));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected Welcome message",
                ));
            }
        };
        reader.get_ref().set_read_timeout(None)?;
        info!("Connected to {} as client {:?}", addr, client_id);

        let (update_tx, incoming) = mpsc::channel();
        thread::spawn(move || server_reader_thread(reader, update_tx));

        Ok(Self {
            writer,
            incoming,
            client_id,
        })
    }

    fn send(&mut self, msg: &ClientMessage) -> io::Result<()> {
        write_message(&mut self.writer, msg)
    }

    /// Wait for the first message `pick` accepts, dropping the rest.
    fn wait_for<T, F>(&self, timeout: Duration, mut pick: F) -> io::Result<T>
    where
        F: FnMut(ServerMessage) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.incoming.recv_timeout(left) {
                Ok(ServerMessage::Shutdown) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "server shut down"))
                }
                Ok(msg) => {
                    if let Some(value) = pick(msg) {
                        return Ok(value);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply from server"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection lost"))
                }
            }
        }
    }

    fn goodbye(mut self) {
        let _ = self.send(&ClientMessage::Goodbye);
    }
}

/// A `StateStore` served by a remote `NetServer`.
pub struct RemoteStore {
    addr: String,
    client_name: String,
    timeout: Duration,
    link: Mutex<Option<Link>>,
    next_request: AtomicU64,
}

impl RemoteStore {
    /// Connect and complete the handshake.
    pub fn connect(addr: &str, client_name: &str) -> io::Result<Self> {
        Self::connect_with_timeout(addr, client_name, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn connect_with_timeout(addr: &str, client_name: &str, timeout: Duration) -> io::Result<Self> {
        let link = Link::open(addr, client_name, timeout)?;
        Ok(Self {
            addr: addr.to_string(),
            client_name: client_name.to_string(),
            timeout,
            link: Mutex::new(Some(link)),
            next_request: AtomicU64::new(1),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.link.lock().map(|link| link.is_some()).unwrap_or(false)
    }

    /// Run an admin action on the server, stamped by the server's clock.
    pub fn admin(&self, action: AdminAction) -> Result<AdminOutcome, String> {
        let reply = self.exchange(
            |request_id| ClientMessage::Admin { request_id, action },
            |id, msg| match msg {
                ServerMessage::AdminReply { request_id, result } if request_id == id => Some(result),
                _ => None,
            },
        );
        match reply {
            Ok(result) => result,
            Err(e) => Err(e.to_string()),
        }
    }

    /// Send a message built from a fresh request id and wait for its reply.
    /// Any transport failure drops the connection.
    fn exchange<T, B, P>(&self, build: B, mut pick: P) -> StoreResult<T>
    where
        B: FnOnce(u64) -> ClientMessage,
        P: FnMut(u64, ServerMessage) -> Option<T>,
    {
        let mut guard = self
            .link
            .lock()
            .map_err(|_| StoreError::Unreachable("connection lock poisoned".into()))?;
        let mut link = match guard.take() {
            Some(link) => link,
            None => {
                let link = Link::open(&self.addr, &self.client_name, self.timeout)
                    .map_err(|e| StoreError::Unreachable(e.to_string()))?;
                info!("Reconnected to {}", self.addr);
                link
            }
        };

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let result = link
            .send(&build(request_id))
            .and_then(|()| link.wait_for(self.timeout, |msg| pick(request_id, msg)));
        match result {
            Ok(value) => {
                *guard = Some(link);
                Ok(value)
            }
            Err(e) => {
                warn!("Store connection to {} dropped: {}", self.addr, e);
                Err(StoreError::Unreachable(e.to_string()))
            }
        }
    }

    fn call(&self, request: StoreRequest) -> StoreResult<StoreValue> {
        self.exchange(
            |request_id| ClientMessage::Store { request_id, request },
            |id, msg| match msg {
                ServerMessage::StoreReply { request_id, reply } if request_id == id => Some(reply),
                _ => None,
            },
        )?
    }

    /// Say goodbye and close the connection.
    pub fn disconnect(self) {
        if let Ok(mut guard) = self.link.lock() {
            if let Some(link) = guard.take() {
                link.goodbye();
            }
        }
    }
}

fn unexpected(value: StoreValue) -> StoreError {
    StoreError::Backend(format!("unexpected reply: {:?}", value))
}

impl StateStore for RemoteStore {
    fn claim_cell(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> StoreResult<CellId> {
        match self.call(StoreRequest::ClaimCell {
            grid,
            row,
            column,
            claimant: claimant.clone(),
        })? {
            StoreValue::CellId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    fn release_cell(&self, cell: CellId, now: Timestamp) -> StoreResult {
        match self.call(StoreRequest::ReleaseCell { cell, now })? {
            StoreValue::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn read_cell(&self, cell: CellId) -> StoreResult<Cell> {
        match self.call(StoreRequest::ReadCell { cell })? {
            StoreValue::Cell(cell) => Ok(cell),
            other => Err(unexpected(other)),
        }
    }

    fn find_cell(&self, grid: GridId, row: u32, column: u32) -> StoreResult<Cell> {
        match self.call(StoreRequest::FindCell { grid, row, column })? {
            StoreValue::Cell(cell) => Ok(cell),
            other => Err(unexpected(other)),
        }
    }

    fn read_global(&self) -> StoreResult<GlobalEffectState> {
        match self.call(StoreRequest::ReadGlobal)? {
            StoreValue::Global(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    fn write_global(&self, state: &GlobalEffectState) -> StoreResult<GlobalEffectState> {
        match self.call(StoreRequest::WriteGlobal {
            state: state.clone(),
        })? {
            StoreValue::Global(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    fn update_cells(&self, cells: &[CellId], patch: &CellPatch, now: Timestamp) -> StoreResult<usize> {
        match self.call(StoreRequest::UpdateCells {
            cells: cells.to_vec(),
            patch: patch.clone(),
            now,
        })? {
            StoreValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn release_cells(&self, cells: &[CellId], now: Timestamp) -> StoreResult<usize> {
        match self.call(StoreRequest::ReleaseCells {
            cells: cells.to_vec(),
            now,
        })? {
            StoreValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn release_grid(&self, grid: GridId, now: Timestamp) -> StoreResult<usize> {
        match self.call(StoreRequest::ReleaseGrid { grid, now })? {
            StoreValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    fn insert_grid(&self, name: &str, rows: u32, columns: u32) -> StoreResult<Grid> {
        match self.call(StoreRequest::InsertGrid {
            name: name.to_string(),
            rows,
            columns,
        })? {
            StoreValue::Grid(grid) => Ok(grid),
            other => Err(unexpected(other)),
        }
    }

    fn list_grids(&self) -> StoreResult<Vec<Grid>> {
        match self.call(StoreRequest::ListGrids)? {
            StoreValue::Grids(grids) => Ok(grids),
            other => Err(unexpected(other)),
        }
    }

    fn list_cells(&self, grid: GridId) -> StoreResult<Vec<Cell>> {
        match self.call(StoreRequest::ListCells { grid })? {
            StoreValue::Cells(cells) => Ok(cells),
            other => Err(unexpected(other)),
        }
    }

    fn upsert_effects(&self, specs: &[EffectSpec]) -> StoreResult<Vec<Effect>> {
        match self.call(StoreRequest::UpsertEffects {
            specs: specs.to_vec(),
        })? {
            StoreValue::Effects(effects) => Ok(effects),
            other => Err(unexpected(other)),
        }
    }

    fn effects(&self) -> StoreResult<Vec<Effect>> {
        match self.call(StoreRequest::Effects)? {
            StoreValue::Effects(effects) => Ok(effects),
            other => Err(unexpected(other)),
        }
    }
}

/// How long `WaveClient` waits between reconnect attempts by default.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A room subscription for wave updates, also used by operators to start
/// and stop sweeps.
///
/// A lost connection is not fatal: `poll_frames` reopens it once the retry
/// interval has passed and rejoins the room it was in.
pub struct WaveClient {
    addr: String,
    client_name: String,
    link: Option<Link>,
    room: Option<GridId>,
    retry_interval: Duration,
    next_attempt: Instant,
    server_shutdown: bool,
}

impl WaveClient {
    pub fn connect(addr: &str, client_name: &str) -> io::Result<Self> {
        Ok(Self {
            addr: addr.to_string(),
            client_name: client_name.to_string(),
            link: Some(Link::open(addr, client_name, DEFAULT_REPLY_TIMEOUT)?),
            room: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            next_attempt: Instant::now(),
            server_shutdown: false,
        })
    }

    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = interval;
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.link.as_ref().map(|link| link.client_id)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Whether the last connection ended with an announced server shutdown.
    pub fn server_shutdown(&self) -> bool {
        self.server_shutdown
    }

    /// Join `grid`'s room and wait for the server to confirm. The room is
    /// rejoined after every reconnect.
    pub fn join(&mut self, grid: GridId) -> io::Result<()> {
        self.room = Some(grid);
        let link = self.link_now()?;
        let joined = join_room(link, grid);
        if joined.is_err() {
            self.drop_link();
        }
        joined
    }

    pub fn start_wave(&mut self, grid: GridId, columns: u32) -> io::Result<()> {
        self.send(&ClientMessage::StartWave { grid, columns })
    }

    pub fn stop_wave(&mut self, grid: GridId) -> io::Result<()> {
        self.send(&ClientMessage::StopWave { grid })
    }

    pub fn ping(&mut self) -> io::Result<()> {
        self.send(&ClientMessage::Ping)
    }

    fn send(&mut self, msg: &ClientMessage) -> io::Result<()> {
        let sent = self.link_now()?.send(msg);
        if sent.is_err() {
            self.drop_link();
        }
        sent
    }

    /// The open link, reconnecting right away when there is none.
    fn link_now(&mut self) -> io::Result<&mut Link> {
        if self.link.is_none() {
            self.reconnect()?;
        }
        self.link
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.next_attempt = Instant::now() + self.retry_interval;
        let mut link = Link::open(&self.addr, &self.client_name, DEFAULT_REPLY_TIMEOUT)?;
        if let Some(grid) = self.room {
            join_room(&mut link, grid)?;
        }
        info!("Wave connection to {} restored", self.addr);
        self.server_shutdown = false;
        self.link = Some(link);
        Ok(())
    }

    fn drop_link(&mut self) {
        if self.link.take().is_some() {
            self.next_attempt = Instant::now() + self.retry_interval;
        }
    }

    /// Drain frames received since the last call. While disconnected, try
    /// to reconnect once per retry interval.
    pub fn poll_frames(&mut self) -> Vec<WaveFrame> {
        let mut frames = Vec::new();
        if self.link.is_none() {
            if Instant::now() < self.next_attempt {
                return frames;
            }
            if let Err(e) = self.reconnect() {
                log::debug!("Wave reconnect to {} failed: {}", self.addr, e);
                return frames;
            }
        }
        let Some(link) = self.link.as_ref() else {
            return frames;
        };

        let mut lost = false;
        loop {
            match link.incoming.try_recv() {
                Ok(ServerMessage::WaveUpdate { frame }) => frames.push(frame),
                Ok(ServerMessage::Shutdown) => {
                    info!("Server shutdown received");
                    self.server_shutdown = true;
                }
                Ok(ServerMessage::Error { message }) => warn!("Server error: {}", message),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Wave connection to {} lost", self.addr);
                    lost = true;
                    break;
                }
            }
        }
        if lost {
            self.drop_link();
        }
        frames
    }

    pub fn disconnect(self) {
        if let Some(link) = self.link {
            link.goodbye();
        }
    }
}

fn join_room(link: &mut Link, grid: GridId) -> io::Result<()> {
    link.send(&ClientMessage::Join { grid })?;
    link.wait_for(DEFAULT_REPLY_TIMEOUT, |msg| match msg {
        ServerMessage::Joined { grid: joined } if joined == grid => Some(()),
        _ => None,
    })
}

/// Reads server messages into the link channel until the connection ends.
fn server_reader_thread(mut reader: BufReader<TcpStream>, update_tx: mpsc::Sender<ServerMessage>) {
    loop {
        match read_message::<_, ServerMessage>(&mut reader) {
            Ok(msg) => {
                let is_shutdown = matches!(msg, ServerMessage::Shutdown);
                if update_tx.send(msg).is_err() || is_shutdown {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("Server read error: {}", e);
                }
                break;
            }
        }
    }
    info!("Server reader thread exiting");
}
