//! Network server for Tessera.
//!
//! Accepts connections, answers store and admin calls against the shared
//! store, and drives wave sweeps for grid rooms. Everything happens inside
//! `pump`; reader threads only decode frames into a channel.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};

use tessera_core::clock::{Clock, SystemClock};
use tessera_core::config::WaveSettings;
use tessera_core::dispatch::dispatch_admin;
use tessera_core::store::StateStore;
use tessera_core::wave::SweepRegistry;
use tessera_types::{EffectSpec, GridId, Timestamp, WaveFrame};

use crate::framing::{read_message, write_message};
use crate::protocol::{ClientId, ClientMessage, ServerMessage};

/// A connected client with its write half.
struct ClientConnection {
    name: String,
    writer: BufWriter<TcpStream>,
    /// Grid whose wave updates this client receives.
    room: Option<GridId>,
}

impl ClientConnection {
    fn send(&mut self, msg: &ServerMessage) -> io::Result<()> {
        write_message(&mut self.writer, msg)
    }
}

/// A pending connection awaiting Hello handshake.
struct PendingConnection {
    writer: BufWriter<TcpStream>,
}

pub struct NetServer {
    listener: TcpListener,
    /// Clients that completed the Hello handshake.
    clients: HashMap<ClientId, ClientConnection>,
    /// Clients awaiting Hello.
    pending: HashMap<ClientId, PendingConnection>,
    message_rx: Receiver<(ClientId, ClientMessage)>,
    message_tx: Sender<(ClientId, ClientMessage)>,
    next_client_id: u64,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    catalog: Vec<EffectSpec>,
    sweeps: SweepRegistry,
}

impl NetServer {
    /// Bind the server to an address.
    pub fn bind(
        addr: &str,
        store: Arc<dyn StateStore>,
        wave: WaveSettings,
        catalog: Vec<EffectSpec>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let (message_tx, message_rx) = mpsc::channel();

        info!("NetServer listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            clients: HashMap::new(),
            pending: HashMap::new(),
            message_rx,
            message_tx,
            next_client_id: 0,
            store,
            clock: Arc::new(SystemClock),
            catalog,
            sweeps: SweepRegistry::new(wave),
        })
    }

    /// Replace the clock used to stamp admin publishes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// One pass at the clock's current time.
    pub fn pump(&mut self) {
        let now = self.clock.now();
        self.pump_at(now);
    }

    /// Accept connections, serve queued messages, advance sweeps.
    pub fn pump_at(&mut self, now: Timestamp) {
        self.accept_connections();
        self.poll_messages(now);
        self.advance_waves(now);
    }

    /// Accept any pending TCP connections (they become clients after Hello).
    pub fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let client_id = ClientId::new(self.next_client_id);
                    self.next_client_id += 1;

                    if let Err(e) = stream.set_nonblocking(false) {
                        error!("Failed to configure stream from {}: {}", addr, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let read_stream = match stream.try_clone() {
                        Ok(s) => s,
                        Err(e) => {
                            error!("Failed to clone stream: {}", e);
                            continue;
                        }
                    };

                    let message_tx = self.message_tx.clone();
                    thread::spawn(move || {
                        client_reader_thread(client_id, read_stream, message_tx);
                    });
                    self.pending.insert(
                        client_id,
                        PendingConnection {
                            writer: BufWriter::new(stream),
                        },
                    );
                    info!("Client {:?} TCP connected from {}, awaiting Hello", client_id, addr);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Serve every queued client message. Returns how many were handled.
    pub fn poll_messages(&mut self, now: Timestamp) -> usize {
        let mut handled = 0;
        while let Ok((client_id, msg)) = self.message_rx.try_recv() {
            handled += 1;
            match msg {
                ClientMessage::Hello { client_name } => self.handshake(client_id, client_name),
                ClientMessage::Goodbye => self.remove_client(client_id),
                other if !self.clients.contains_key(&client_id) => {
                    if let Some(pending) = self.pending.get_mut(&client_id) {
                        warn!("Client {:?} sent {:?} before Hello", client_id, other);
                        let _ = write_message(
                            &mut pending.writer,
                            &ServerMessage::Error {
                                message: "send Hello first".into(),
                            },
                        );
                    }
                }
                ClientMessage::Join { grid } => {
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.room = Some(grid);
                        info!("Client {:?} '{}' joined grid {}", client_id, client.name, grid);
                    }
                    self.reply(client_id, &ServerMessage::Joined { grid });
                }
                ClientMessage::Leave => {
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.room = None;
                    }
                }
                ClientMessage::StartWave { grid, columns } => {
                    if let Err(e) = self.sweeps.start(grid, columns, now) {
                        self.reply(
                            client_id,
                            &ServerMessage::Error {
                                message: e.to_string(),
                            },
                        );
                    }
                }
                ClientMessage::StopWave { grid } => {
                    if let Some(frame) = self.sweeps.stop(grid, now) {
                        self.broadcast_wave(frame);
                    }
                }
                ClientMessage::Store {
                    request_id,
                    request,
                } => {
                    let name = request.name();
                    let reply = request.execute(self.store.as_ref());
                    if let Err(e) = &reply {
                        log::debug!("Store call {} from {:?} failed: {}", name, client_id, e);
                    }
                    self.reply(client_id, &ServerMessage::StoreReply { request_id, reply });
                }
                ClientMessage::Admin { request_id, action } => {
                    let result =
                        dispatch_admin(self.store.as_ref(), self.clock.as_ref(), &self.catalog, action)
                            .map_err(|e| e.to_string());
                    self.reply(client_id, &ServerMessage::AdminReply { request_id, result });
                }
                ClientMessage::Ping => self.reply(client_id, &ServerMessage::Pong),
            }
        }
        handled
    }

    fn handshake(&mut self, client_id: ClientId, client_name: String) {
        let Some(mut pending) = self.pending.remove(&client_id) else {
            if let Some(client) = self.clients.get_mut(&client_id) {
                warn!("Client {:?} sent Hello after already connected", client_id);
                client.name = client_name;
            }
            return;
        };
        if let Err(e) = write_message(&mut pending.writer, &ServerMessage::Welcome { client_id }) {
            error!("Failed to send welcome to {:?}: {}", client_id, e);
            return;
        }
        info!("Client {:?} '{}' completed handshake", client_id, client_name);
        self.clients.insert(
            client_id,
            ClientConnection {
                name: client_name,
                writer: pending.writer,
                room: None,
            },
        );
    }

    fn remove_client(&mut self, client_id: ClientId) {
        self.pending.remove(&client_id);
        if let Some(client) = self.clients.remove(&client_id) {
            info!("Client {:?} '{}' disconnected", client_id, client.name);
        }
    }

    fn reply(&mut self, client_id: ClientId, msg: &ServerMessage) {
        let failed = match self.clients.get_mut(&client_id) {
            Some(client) => client.send(msg).err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!("Failed to send to client {:?}: {}", client_id, e);
            self.remove_client(client_id);
        }
    }

    /// Emit the frames of every sweep whose tick has come.
    pub fn advance_waves(&mut self, now: Timestamp) {
        for frame in self.sweeps.advance(now) {
            self.broadcast_wave(frame);
        }
    }

    fn broadcast_wave(&mut self, frame: WaveFrame) {
        let grid = frame.grid;
        let msg = ServerMessage::WaveUpdate { frame };
        self.broadcast_where(&msg, |client| client.room == Some(grid));
    }

    /// Broadcast a shutdown message to all clients.
    pub fn broadcast_shutdown(&mut self) {
        self.broadcast_where(&ServerMessage::Shutdown, |_| true);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Clients currently joined to `grid`.
    pub fn room_size(&self, grid: GridId) -> usize {
        self.clients.values().filter(|c| c.room == Some(grid)).count()
    }

    pub fn is_sweeping(&self, grid: GridId) -> bool {
        self.sweeps.is_active(grid)
    }

    fn broadcast_where<F: Fn(&ClientConnection) -> bool>(&mut self, msg: &ServerMessage, filter: F) {
        let mut disconnected = Vec::new();
        for (id, client) in &mut self.clients {
            if !filter(client) {
                continue;
            }
            if let Err(e) = client.send(msg) {
                warn!("Failed to send to client {:?}: {}", id, e);
                disconnected.push(*id);
            }
        }
        for id in disconnected {
            self.clients.remove(&id);
        }
    }
}

/// Reads a client's messages into the server channel.
fn client_reader_thread(
    client_id: ClientId,
    stream: TcpStream,
    message_tx: Sender<(ClientId, ClientMessage)>,
) {
    let mut reader = BufReader::new(stream);

    loop {
        match read_message::<_, ClientMessage>(&mut reader) {
            Ok(msg) => {
                let is_goodbye = matches!(msg, ClientMessage::Goodbye);
                if message_tx.send((client_id, msg)).is_err() || is_goodbye {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("Client {:?} read error: {}", client_id, e);
                }
                // Implicit goodbye on disconnect
                let _ = message_tx.send((client_id, ClientMessage::Goodbye));
                break;
            }
        }
    }

    info!("Client {:?} reader thread exiting", client_id);
}
