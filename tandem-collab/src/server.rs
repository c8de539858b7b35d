//! TCP sync server: one authoritative buffer, one roster, N connections.
//!
//! Architecture:
//! ```text
//! Client A ──► reader task ──┐                      ┌──► writer task ──► Client A
//!                            ├──► event loop ───────┤
//! Client B ──► reader task ──┘   (roster + buffer)  └──► writer task ──► Client B
//! ```
//!
//! Reader tasks only assemble frames. Every frame is handed to a single event
//! loop that owns the roster and the buffer, so each frame is processed to
//! completion before the next one and no lock guards the document. A peer
//! that withholds half a frame only stalls its own reader task.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;

use crate::broadcast::{spawn_writer, Connections, Outgoing};
use crate::codec::{encode_frame, FrameReader, DEFAULT_MAX_FRAME_LEN};
use crate::cursor::{shift_cursors_for_patch, Cursor};
use crate::error::{Result, SyncError};
use crate::patch::apply_incoming_patch;
use crate::protocol::{decode_join, Packet, ServerMessage, UpdatePacket};
use crate::roster::{ConnectionId, Roster};

/// Capacity of the reader → event loop channel.
const EVENT_CAPACITY: usize = 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted frame payload; bigger prefixes drop the connection
    pub max_frame_len: usize,
    /// Number of cursor colors, including the reserved self slot
    pub palette_size: usize,
    /// Stop serving once the last joined user leaves
    pub exit_when_empty: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            palette_size: 11,
            exit_when_empty: false,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_users: usize,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub rejected_joins: u64,
    /// Frames queued for delivery to peers
    pub frames_sent: u64,
    /// Frames addressed to a peer whose writer had already gone away
    pub frames_dropped: u64,
}

/// What reader tasks report to the event loop.
#[derive(Debug)]
enum ServerEvent {
    Frame { id: ConnectionId, bytes: Vec<u8> },
    Closed { id: ConnectionId, error: Option<SyncError> },
}

/// State owned by the event loop.
struct Session {
    config: ServerConfig,
    roster: Roster,
    buffer: Vec<String>,
    connections: Connections,
    stats: Arc<RwLock<ServerStats>>,
}

impl Session {
    fn new(config: ServerConfig, stats: Arc<RwLock<ServerStats>>) -> Self {
        Self {
            roster: Roster::new(config.palette_size),
            config,
            buffer: Vec::new(),
            connections: Connections::new(),
            stats,
        }
    }

    async fn accept(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        events: &mpsc::Sender<ServerEvent>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY for {addr}: {e}");
        }
        let id = ConnectionId::new();
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_writer(write, rx);
        let reader = tokio::spawn(read_loop(
            id,
            FrameReader::new(read, self.config.max_frame_len),
            events.clone(),
        ));
        self.register(id, addr, tx, reader.abort_handle()).await;
    }

    async fn register(
        &mut self,
        id: ConnectionId,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outgoing>,
        reader: AbortHandle,
    ) {
        self.connections.insert(id, addr, sender, reader);
        let mut s = self.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        log::debug!("New connection {id} from {addr}");
    }

    async fn handle(&mut self, event: ServerEvent) -> ControlFlow<()> {
        let flow = self.dispatch(event).await;
        let fanout = self.connections.stats();
        let mut s = self.stats.write().await;
        s.frames_sent = fanout.frames_sent;
        s.frames_dropped = fanout.frames_dropped;
        flow
    }

    async fn dispatch(&mut self, event: ServerEvent) -> ControlFlow<()> {
        match event {
            ServerEvent::Frame { id, bytes } => {
                // Straggler from a connection we already closed.
                if !self.connections.contains(id) {
                    log::trace!("Dropping frame from closed connection {id}");
                    return ControlFlow::Continue(());
                }
                {
                    let mut s = self.stats.write().await;
                    s.total_frames += 1;
                    s.total_bytes += bytes.len() as u64;
                }
                if self.roster.get_by_connection(id).is_some() {
                    self.handle_update(id, &bytes).await;
                } else {
                    self.handle_join(id, &bytes).await;
                }
                ControlFlow::Continue(())
            }
            ServerEvent::Closed { id, error } => self.handle_closed(id, error).await,
        }
    }

    async fn handle_join(&mut self, id: ConnectionId, bytes: &[u8]) {
        let name = match decode_join(bytes) {
            Ok(name) => name,
            Err(e) => {
                log::warn!("Bad join from {id}: {e}");
                self.reject(id, ServerMessage::ErrorNewnameInvalid).await;
                return;
            }
        };

        let entry = match self.roster.join(&name, id) {
            Ok(identity) => identity.to_entry(),
            Err(SyncError::NameConflict(_)) => {
                log::info!("Rejected join of {name}: name taken");
                self.reject(id, ServerMessage::ErrorNewnameTaken).await;
                return;
            }
            Err(e) => {
                log::info!("Rejected join: {e}");
                self.reject(id, ServerMessage::ErrorNewnameInvalid).await;
                return;
            }
        };

        self.stats.write().await.active_users = self.roster.len();

        // A lone user already has the document.
        let buffer = (self.roster.len() >= 2).then(|| self.buffer.clone());
        let success = ServerMessage::ConnectSuccess {
            name: entry.name.clone(),
            users: self.roster.snapshot_all(),
            buffer,
        };
        self.send_to(id, success.into());
        self.broadcast(ServerMessage::UserConnected { user: entry }.into(), Some(id));
        log::info!("{name} joined ({} user(s) present)", self.roster.len());
    }

    async fn handle_update(&mut self, id: ConnectionId, bytes: &[u8]) {
        let update = match Packet::decode(bytes) {
            Ok(Packet::Update(update)) => update,
            Ok(Packet::Message(message)) => {
                log::warn!("Dropping server-only message from {id}: {message:?}");
                self.stats.write().await.malformed_frames += 1;
                return;
            }
            Err(e) => {
                log::warn!("Dropping frame from {id}: {e}");
                self.stats.write().await.malformed_frames += 1;
                return;
            }
        };
        if update.cursor.is_none() && update.buffer.is_none() {
            return;
        }
        if let Some(Err(e)) = update.buffer.as_ref().map(|patch| patch.validate()) {
            log::warn!("Dropping update from {id}: {e}");
            self.stats.write().await.malformed_frames += 1;
            return;
        }

        let Some(identity) = self.roster.get_by_connection_mut(id) else {
            return;
        };
        // The roster name wins over whatever the client claims.
        let name = identity.name.clone();
        let mut updated_cursors = Vec::new();
        if let Some(cursor) = update.cursor {
            identity.cursor = Cursor::new(cursor.line, cursor.column);
            updated_cursors.push(identity.to_entry());
            log::trace!("{name} moved to {}:{}", cursor.line, cursor.column);
        }

        let except = match &update.buffer {
            Some(patch) => {
                self.buffer = apply_incoming_patch(&self.buffer, patch);
                updated_cursors.extend(shift_cursors_for_patch(patch, id, &mut self.roster));
                log::debug!(
                    "{name} patched lines {}..={} ({} line(s) now)",
                    patch.start,
                    patch.end,
                    self.buffer.len()
                );
                // The editor gets its own cursor correction back.
                None
            }
            None => Some(id),
        };

        let packet = UpdatePacket {
            name,
            cursor: None,
            buffer: update.buffer,
            updated_cursors,
        };
        self.broadcast(packet.into(), except);
    }

    async fn handle_closed(&mut self, id: ConnectionId, error: Option<SyncError>) -> ControlFlow<()> {
        let Some(addr) = self.connections.remove(id) else {
            return ControlFlow::Continue(());
        };
        match error {
            Some(e) => log::warn!("Connection {id} from {addr} failed: {e}"),
            None => log::debug!("Connection {id} from {addr} closed"),
        }

        let identity = self.roster.leave(id);
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_users = self.roster.len();
        }
        let Some(identity) = identity else {
            return ControlFlow::Continue(());
        };

        log::info!("{} left ({} user(s) present)", identity.name, self.roster.len());
        self.broadcast(
            ServerMessage::UserDisconnected {
                name: identity.name,
            }
            .into(),
            None,
        );

        if self.roster.is_empty() {
            self.buffer.clear();
            if self.config.exit_when_empty {
                log::info!("Last user left, shutting down");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn reject(&mut self, id: ConnectionId, message: ServerMessage) {
        {
            let mut s = self.stats.write().await;
            s.rejected_joins += 1;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        self.send_to(id, message.into());
        self.connections.close(id);
    }

    fn send_to(&self, id: ConnectionId, packet: Packet) {
        if let Some(frame) = encode_packet(&packet) {
            self.connections.send_to(id, frame);
        }
    }

    fn broadcast(&self, packet: Packet, except: Option<ConnectionId>) {
        if let Some(frame) = encode_packet(&packet) {
            let count = self.connections.broadcast(frame, except);
            log::trace!("Broadcast to {count} connection(s)");
        }
    }
}

fn encode_packet(packet: &Packet) -> Option<Arc<Vec<u8>>> {
    match packet.encode().and_then(|payload| encode_frame(&payload)) {
        Ok(frame) => Some(Arc::new(frame)),
        Err(e) => {
            log::error!("Failed to encode packet: {e}");
            None
        }
    }
}

async fn read_loop<R>(id: ConnectionId, mut reader: FrameReader<R>, events: mpsc::Sender<ServerEvent>)
where
    R: AsyncRead + Unpin,
{
    let error = loop {
        match reader.read_frame().await {
            Ok(Some(bytes)) => {
                if events.send(ServerEvent::Frame { id, bytes }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };
    let _ = events.send(ServerEvent::Closed { id, error }).await;
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Bind the listening socket. Use port 0 to let the OS pick one.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Shared statistics, still readable after [`SyncServer::run`] took
    /// ownership of the server.
    pub fn stats_handle(&self) -> Arc<RwLock<ServerStats>> {
        self.stats.clone()
    }

    /// Serve until the process ends, or until the session empties when
    /// [`ServerConfig::exit_when_empty`] is set.
    pub async fn run(self) -> Result<()> {
        log::info!("Sync server listening on {}", self.local_addr()?);

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CAPACITY);
        let mut session = Session::new(self.config, self.stats);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => session.accept(stream, addr, &events_tx).await,
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                Some(event) = events_rx.recv() => {
                    if session.handle(event).await.is_break() {
                        break;
                    }
                }
            }
        }

        session.connections.close_all();
        Ok(())
    }
}
