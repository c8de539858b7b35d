//! Client synchronization engine.
//!
//! Provides:
//! - Connection lifecycle (`Disconnected → Connecting → Connected`)
//! - A background sync loop: bounded receive + periodic diff-and-send
//! - Incoming patch / cursor application onto the [`EditorView`]
//! - Remote cursor markers with stable ids and color slots
//!
//! The background loop is the only writer of the mirrored snapshot and the
//! transport. The foreground only calls `connect` / `disconnect`, and
//! `disconnect` joins the loop before the stream is closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{write_frame, FrameReader, Received, DEFAULT_MAX_FRAME_LEN};
use crate::cursor::Cursor;
use crate::error::{Result, SyncError};
use crate::patch::{apply_incoming_patch, compute_outgoing_patch};
use crate::protocol::{encode_join, Packet, ServerMessage, UpdatePacket, UserEntry};
use crate::roster::ColorAllocator;
use crate::transport::Connector;
use crate::view::{EditorView, Severity};

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Minimum time between two outgoing update packets.
    pub send_interval: Duration,
    /// Upper bound for one receive attempt, so sends are never starved.
    pub receive_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(100),
            receive_timeout: Duration::from_millis(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemoteMarker {
    id: u64,
    color_slot: usize,
    cursor: Cursor,
}

/// Mirror of the other users' cursors, drawn as view markers.
///
/// Marker ids are never reused within a session. The local user never gets
/// a marker.
#[derive(Debug)]
pub struct RemoteCursors {
    local_name: String,
    markers: HashMap<String, RemoteMarker>,
    next_id: u64,
    colors: ColorAllocator,
}

impl RemoteCursors {
    pub fn new(local_name: impl Into<String>, palette_size: usize) -> Self {
        Self {
            local_name: local_name.into(),
            markers: HashMap::new(),
            next_id: 1,
            colors: ColorAllocator::new(palette_size),
        }
    }

    /// Track a user that just appeared. Known users are just moved.
    pub fn add<V: EditorView + ?Sized>(&mut self, view: &V, user: &UserEntry) {
        if user.name == self.local_name {
            return;
        }
        if self.markers.contains_key(&user.name) {
            self.update(view, user);
            return;
        }
        let marker = RemoteMarker {
            id: self.next_id,
            color_slot: self.colors.next_slot(),
            cursor: user.cursor,
        };
        self.next_id += 1;
        view.add_marker(marker.id, marker.color_slot, marker.cursor);
        self.markers.insert(user.name.clone(), marker);
    }

    /// Move a user's marker (remove, then re-add at the new position).
    pub fn update<V: EditorView + ?Sized>(&mut self, view: &V, user: &UserEntry) {
        if user.name == self.local_name {
            return;
        }
        match self.markers.get_mut(&user.name) {
            Some(marker) => {
                view.remove_marker(marker.id);
                marker.cursor = user.cursor;
                view.add_marker(marker.id, marker.color_slot, marker.cursor);
            }
            None => self.add(view, user),
        }
    }

    pub fn remove<V: EditorView + ?Sized>(&mut self, view: &V, name: &str) {
        if let Some(marker) = self.markers.remove(name) {
            view.remove_marker(marker.id);
        }
    }

    pub fn clear<V: EditorView + ?Sized>(&mut self, view: &V) {
        for (_, marker) in self.markers.drain() {
            view.remove_marker(marker.id);
        }
    }

    pub fn cursor_of(&self, name: &str) -> Option<Cursor> {
        self.markers.get(name).map(|marker| marker.cursor)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Why the sync loop stopped.
#[derive(Debug)]
enum Exit {
    Requested,
    ServerClosed,
    Rejected(SyncError),
    Failed(SyncError),
}

/// State owned by the background task.
struct SyncLoop<V, S> {
    view: Arc<V>,
    name: String,
    port: u16,
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    previous: Vec<String>,
    remote: RemoteCursors,
    /// Set once `connect_success` arrived; nothing is sent before that.
    joined: bool,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
}

impl<V, S> SyncLoop<V, S>
where
    V: EditorView,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut last_send = Instant::now();

        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break Exit::Requested,
                received = self.reader.poll_frame(self.config.receive_timeout) => {
                    match received {
                        Ok(Received::Frame(bytes)) => {
                            if let Some(exit) = self.dispatch(&bytes) {
                                break exit;
                            }
                        }
                        Ok(Received::Incomplete) => {}
                        Ok(Received::Closed) => break Exit::ServerClosed,
                        Err(e) => break Exit::Failed(e),
                    }
                }
            }

            if last_send.elapsed() >= self.config.send_interval {
                if let Err(e) = self.send_update().await {
                    break Exit::Failed(e);
                }
                last_send = Instant::now();
            }
        };

        self.finish(exit).await;
    }

    fn dispatch(&mut self, bytes: &[u8]) -> Option<Exit> {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping packet from server: {e}");
                return None;
            }
        };

        let exit = match packet {
            Packet::Message(message) => self.handle_message(message),
            Packet::Update(update) => {
                self.handle_update(update);
                None
            }
        };
        self.view.redraw();
        exit
    }

    fn handle_message(&mut self, message: ServerMessage) -> Option<Exit> {
        match message {
            ServerMessage::ConnectSuccess { users, buffer, .. } => {
                if let Some(buffer) = buffer {
                    self.previous = buffer.clone();
                    self.view.set_lines(buffer);
                }
                for user in &users {
                    self.remote.add(&*self.view, user);
                }
                self.joined = true;
                log::info!("Joined session as {} with {} user(s)", self.name, users.len());
                self.view.notify(
                    &format!("Success! You're now connected [port {}]", self.port),
                    Severity::Info,
                );
                None
            }
            ServerMessage::UserConnected { user } => {
                self.remote.add(&*self.view, &user);
                self.view.notify(
                    &format!("{} connected to this document", user.name),
                    Severity::Info,
                );
                None
            }
            ServerMessage::UserDisconnected { name } => {
                self.remote.remove(&*self.view, &name);
                self.view.notify(
                    &format!("{name} disconnected from this document"),
                    Severity::Info,
                );
                None
            }
            ServerMessage::ErrorNewnameTaken => {
                Some(Exit::Rejected(SyncError::NameConflict(self.name.clone())))
            }
            ServerMessage::ErrorNewnameInvalid => {
                Some(Exit::Rejected(SyncError::InvalidName(self.name.clone())))
            }
        }
    }

    fn handle_update(&mut self, update: UpdatePacket) {
        if let Some(Err(e)) = update.buffer.as_ref().map(|patch| patch.validate()) {
            log::warn!("Dropping update from {}: {e}", update.name);
            return;
        }
        // Our own edits come back with the server's cursor bookkeeping only.
        let from_self = update.name == self.name;

        if !from_self {
            if let Some(patch) = &update.buffer {
                let next = apply_incoming_patch(&self.view.lines(), patch);
                self.previous = next.clone();
                self.view.set_lines(next);
            }
            if let Some(own) = update.updated_cursors.iter().find(|u| u.name == self.name) {
                self.view.set_cursor(own.cursor);
            }
        }

        for user in update.updated_cursors.iter().filter(|u| u.name != self.name) {
            self.remote.update(&*self.view, user);
        }
    }

    async fn send_update(&mut self) -> Result<()> {
        if !self.joined {
            return Ok(());
        }

        let cursor = self.view.cursor();
        let current = self.view.lines();
        let buffer = compute_outgoing_patch(&self.previous, &current, cursor.row());
        if buffer.is_some() {
            self.previous = current;
        }

        let packet = Packet::from(UpdatePacket {
            name: self.name.clone(),
            cursor: Some(Cursor::new(cursor.line, cursor.column)),
            buffer,
            updated_cursors: Vec::new(),
        });
        log::trace!("Sending update from {}", self.name);
        write_frame(&mut self.writer, &packet.encode()?).await
    }

    async fn finish(mut self, exit: Exit) {
        self.remote.clear(&*self.view);
        if let Err(e) = self.writer.shutdown().await {
            log::debug!("Error closing connection: {e}");
        }
        *self.state.write().await = ConnectionState::Disconnected;

        match exit {
            Exit::Requested => log::debug!("Sync loop stopped"),
            Exit::ServerClosed => {
                log::info!("Server closed the connection");
                self.view
                    .notify("Connection to the server was lost", Severity::Error);
            }
            Exit::Rejected(e) => {
                log::warn!("Server rejected join: {e}");
                self.view.notify(&e.to_string(), Severity::Error);
            }
            Exit::Failed(e) => {
                log::error!("Sync loop failed: {e}");
                self.view.notify(&e.to_string(), Severity::Error);
            }
        }
        self.view.redraw();
    }
}

struct Session {
    address: String,
    port: u16,
    name: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The sync client.
///
/// Owns the connection lifecycle and the background sync task. The view and
/// connector are injected; the client never reaches into a concrete editor.
pub struct SyncClient<V, C> {
    view: Arc<V>,
    connector: C,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    session: Option<Session>,
}

impl<V, C> SyncClient<V, C>
where
    V: EditorView,
    C: Connector,
{
    pub fn new(view: Arc<V>, connector: C, config: ClientConfig) -> Self {
        Self {
            view,
            connector,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: None,
        }
    }

    /// Connect and join the session as `name`.
    ///
    /// Empty strings and port 0 count as missing.
    pub async fn connect(
        &mut self,
        address: Option<&str>,
        port: Option<u16>,
        name: Option<&str>,
    ) -> Result<()> {
        if self.connection_state().await == ConnectionState::Connected {
            return Err(SyncError::AlreadyConnected);
        }
        self.reap().await;

        let address = address.filter(|a| !a.is_empty());
        let port = port.filter(|p| *p != 0);
        let name = name.filter(|n| !n.is_empty());
        let (Some(address), Some(port), Some(name)) = (address, port, name) else {
            return Err(SyncError::InvalidArguments(
                "usage: connect <address> <port> <name>".to_string(),
            ));
        };

        *self.state.write().await = ConnectionState::Connecting;
        self.view.notify("Connecting...", Severity::Info);
        log::info!("Connecting to {address}:{port} as {name}");

        let stream = match self.connector.connect(address, port).await {
            Ok(stream) => stream,
            Err(source) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::ConnectionFailed {
                    target: format!("{address}:{port}"),
                    source,
                });
            }
        };

        let (read, mut write) = tokio::io::split(stream);
        if let Err(e) = write_frame(&mut write, &encode_join(name)).await {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }
        *self.state.write().await = ConnectionState::Connected;

        let sync_loop = SyncLoop {
            view: self.view.clone(),
            name: name.to_string(),
            port,
            reader: FrameReader::new(read, self.config.max_frame_len),
            writer: write,
            previous: Vec::new(),
            remote: RemoteCursors::new(name, self.view.color_palette_size()),
            joined: false,
            config: self.config.clone(),
            state: self.state.clone(),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(sync_loop.run(shutdown_rx));

        self.session = Some(Session {
            address: address.to_string(),
            port,
            name: name.to_string(),
            shutdown,
            task,
        });
        Ok(())
    }

    /// Stop the sync loop and close the connection.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.connection_state().await != ConnectionState::Connected {
            self.reap().await;
            return Err(SyncError::NotConnected);
        }
        let Some(session) = self.session.take() else {
            return Err(SyncError::NotConnected);
        };

        // Ignored if the loop already exited on its own.
        let _ = session.shutdown.send(());
        if let Err(e) = session.task.await {
            log::error!("Sync task for {} ended abnormally: {e}", session.name);
            *self.state.write().await = ConnectionState::Disconnected;
        }

        log::info!("Disconnected from {}:{}", session.address, session.port);
        self.view
            .notify("Successfully disconnected from the server!", Severity::Info);
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Name used for the current (or last) session.
    pub fn name(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.name.as_str())
    }

    pub fn view(&self) -> &Arc<V> {
        &self.view
    }

    /// Join a loop that stopped on its own (server gone, join rejected).
    async fn reap(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session.shutdown);
            if let Err(e) = session.task.await {
                log::error!("Sync task for {} ended abnormally: {e}", session.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::view::MemoryView;
    use std::io;
    use std::future::Future;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    /// Hands out pre-made in-memory streams.
    struct DuplexConnector {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl DuplexConnector {
        fn new(streams: Vec<DuplexStream>) -> Self {
            Self {
                streams: Mutex::new(streams),
            }
        }
    }

    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        fn connect(
            &self,
            _address: &str,
            _port: u16,
        ) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            async move {
                self.streams
                    .lock()
                    .await
                    .pop()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            send_interval: Duration::from_millis(20),
            receive_timeout: Duration::from_millis(5),
            ..ClientConfig::default()
        }
    }

    async fn send_packet(stream: &mut DuplexStream, packet: impl Into<Packet>) {
        write_frame(stream, &packet.into().encode().unwrap()).await.unwrap();
    }

    async fn wait_for_state<V: EditorView, C: Connector>(
        client: &SyncClient<V, C>,
        wanted: ConnectionState,
    ) {
        for _ in 0..200 {
            if client.connection_state().await == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never reached {wanted:?}");
    }

    fn entry(name: &str, line: i64, column: i64) -> UserEntry {
        UserEntry {
            name: name.into(),
            cursor: Cursor::new(line, column),
        }
    }

    #[test]
    fn test_remote_cursors_skip_local_user() {
        let view = MemoryView::new(11);
        let mut remote = RemoteCursors::new("me", 11);
        remote.add(&view, &entry("me", 1, 1));
        remote.add(&view, &entry("you", 2, 3));

        assert_eq!(remote.len(), 1);
        let markers = view.markers();
        assert_eq!(markers.len(), 1);
        let marker = markers.values().next().unwrap();
        assert_eq!(marker.cursor, Cursor::new(2, 3));
        assert_ne!(marker.color_slot, crate::roster::SELF_COLOR_SLOT);
    }

    #[test]
    fn test_remote_cursors_update_keeps_id_and_color() {
        let view = MemoryView::new(11);
        let mut remote = RemoteCursors::new("me", 11);
        remote.add(&view, &entry("you", 2, 3));
        let before = view.markers();

        remote.update(&view, &entry("you", 4, 1));
        let after = view.markers();

        assert_eq!(before.keys().collect::<Vec<_>>(), after.keys().collect::<Vec<_>>());
        let (id, marker) = after.iter().next().unwrap();
        assert_eq!(before[id].color_slot, marker.color_slot);
        assert_eq!(marker.cursor, Cursor::new(4, 1));
        assert_eq!(remote.cursor_of("you"), Some(Cursor::new(4, 1)));
    }

    #[test]
    fn test_remote_cursors_ids_not_reused() {
        let view = MemoryView::new(11);
        let mut remote = RemoteCursors::new("me", 11);
        remote.add(&view, &entry("a", 1, 1));
        remote.remove(&view, "a");
        remote.add(&view, &entry("b", 1, 1));
        assert_eq!(view.markers().keys().copied().collect::<Vec<_>>(), [2]);

        remote.clear(&view);
        assert!(view.markers().is_empty());
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_arguments() {
        let view = Arc::new(MemoryView::new(11));
        let mut client = SyncClient::new(view, DuplexConnector::new(vec![]), fast_config());

        let err = client.connect(Some("localhost"), None, Some("me")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArguments(_)));
        let err = client.connect(Some(""), Some(9090), Some("me")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArguments(_)));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_stays_disconnected() {
        let view = Arc::new(MemoryView::new(11));
        let mut client = SyncClient::new(view, DuplexConnector::new(vec![]), fast_config());

        let err = client
            .connect(Some("localhost"), Some(9090), Some("me"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionFailed { .. }));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let view = Arc::new(MemoryView::new(11));
        let mut client = SyncClient::new(view, DuplexConnector::new(vec![]), fast_config());
        assert!(matches!(client.disconnect().await, Err(SyncError::NotConnected)));
    }

    #[tokio::test]
    async fn test_join_handshake_and_double_connect() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let view = Arc::new(MemoryView::new(11));
        let mut client =
            SyncClient::new(view, DuplexConnector::new(vec![client_side]), fast_config());

        client.connect(Some("localhost"), Some(9090), Some("alice")).await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(client.name(), Some("alice"));

        let mut server = FrameReader::new(server_side, DEFAULT_MAX_FRAME_LEN);
        let join = server.read_frame().await.unwrap().unwrap();
        assert_eq!(join, b"alice");

        let err = client.connect(Some("localhost"), Some(9090), Some("alice")).await;
        assert!(matches!(err, Err(SyncError::AlreadyConnected)));

        client.disconnect().await.unwrap();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        // Transport closed after the loop was joined.
        assert_eq!(server.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nothing_sent_before_connect_success() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let view = Arc::new(MemoryView::with_lines(11, ["local", "draft"]));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("bob")).await.unwrap();

        let mut server = FrameReader::new(server_side, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(server.read_frame().await.unwrap().unwrap(), b"bob");

        // Several send intervals pass without a join reply.
        let quiet = server.poll_frame(Duration::from_millis(100)).await.unwrap();
        assert_eq!(quiet, Received::Incomplete);

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_applies_connect_success_and_sends_updates() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let view = Arc::new(MemoryView::new(11));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("bob")).await.unwrap();

        let (read, mut write) = tokio::io::split(&mut server_side);
        let mut server = FrameReader::new(read, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(server.read_frame().await.unwrap().unwrap(), b"bob");

        let success = ServerMessage::ConnectSuccess {
            name: "bob".into(),
            users: vec![entry("alice", 2, 1), entry("bob", 1, 1)],
            buffer: Some(vec!["shared".into(), "doc".into()]),
        };
        write_frame(&mut write, &Packet::from(success).encode().unwrap())
            .await
            .unwrap();

        // First update after join: cursor only, the snapshot came from the server.
        let update = loop {
            let frame = server.read_frame().await.unwrap().unwrap();
            if let Packet::Update(update) = Packet::decode(&frame).unwrap() {
                break update;
            }
        };
        assert_eq!(update.name, "bob");
        assert_eq!(update.cursor, Some(Cursor::ORIGIN));
        assert!(update.buffer.is_none());
        assert_eq!(view.lines(), ["shared", "doc"]);
        assert_eq!(view.markers().len(), 1);

        // A local edit shows up as a patch.
        view.edit(|lines, cursor| {
            lines[1] = "docs".into();
            *cursor = Cursor::new(2, 5);
        });
        let patched = loop {
            let frame = server.read_frame().await.unwrap().unwrap();
            if let Packet::Update(UpdatePacket { buffer: Some(patch), .. }) =
                Packet::decode(&frame).unwrap()
            {
                break patch;
            }
        };
        assert_eq!(patched.start, 1);
        assert_eq!(patched.buffer, ["docs"]);
        assert_eq!(patched.change_x, 1);

        drop(server);
        drop(write);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_update_applies_patch_and_cursors() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let view = Arc::new(MemoryView::with_lines(11, ["a", "b", "c"]));
        view.set_cursor(Cursor::new(3, 1));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("me")).await.unwrap();

        let success = ServerMessage::ConnectSuccess {
            name: "me".into(),
            users: vec![entry("other", 1, 1), entry("me", 3, 1)],
            buffer: Some(vec!["a".into(), "b".into(), "c".into()]),
        };
        send_packet(&mut server_side, success).await;

        let patch = compute_outgoing_patch(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            &["a".to_string(), "b1".to_string(), "b2".to_string(), "c".to_string()],
            2,
        )
        .unwrap();
        send_packet(
            &mut server_side,
            UpdatePacket {
                name: "other".into(),
                cursor: None,
                buffer: Some(patch),
                updated_cursors: vec![entry("other", 3, 1), entry("me", 4, 1)],
            },
        )
        .await;

        for _ in 0..200 {
            if view.lines().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(view.lines(), ["a", "b1", "b2", "c"]);
        for _ in 0..200 {
            if view.cursor() == Cursor::new(4, 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(view.cursor(), Cursor::new(4, 1));
        let markers = view.markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers.values().next().unwrap().cursor, Cursor::new(3, 1));

        client.disconnect().await.unwrap();
        assert!(view.markers().is_empty());
    }

    #[tokio::test]
    async fn test_own_update_echo_is_not_reapplied() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let view = Arc::new(MemoryView::with_lines(11, ["mine"]));
        view.set_cursor(Cursor::new(1, 3));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("me")).await.unwrap();

        send_packet(
            &mut server_side,
            ServerMessage::ConnectSuccess {
                name: "me".into(),
                users: vec![entry("me", 1, 1)],
                buffer: None,
            },
        )
        .await;
        let bogus = compute_outgoing_patch(&["mine".to_string()], &[], 0).unwrap();
        send_packet(
            &mut server_side,
            UpdatePacket {
                name: "me".into(),
                cursor: None,
                buffer: Some(bogus),
                updated_cursors: vec![entry("me", 9, 9)],
            },
        )
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(view.lines(), ["mine"]);
        assert_eq!(view.cursor(), Cursor::new(1, 3));

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_inconsistent_patch_is_dropped() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let view = Arc::new(MemoryView::with_lines(11, ["a", "b"]));
        view.set_cursor(Cursor::new(2, 1));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("me")).await.unwrap();

        send_packet(
            &mut server_side,
            ServerMessage::ConnectSuccess {
                name: "me".into(),
                users: vec![entry("me", 2, 1)],
                buffer: None,
            },
        )
        .await;
        for change_y in [-1, i64::MAX] {
            let end = if change_y < 0 { i64::MAX } else { 0 };
            send_packet(
                &mut server_side,
                UpdatePacket {
                    name: "other".into(),
                    cursor: None,
                    buffer: Some(Patch {
                        start: 0,
                        end,
                        change_y,
                        change_x: 0,
                        buffer: vec!["z".into()],
                        buffer_size: 1,
                    }),
                    updated_cursors: vec![entry("me", 9, 9)],
                },
            )
            .await;
        }
        send_packet(
            &mut server_side,
            ServerMessage::UserConnected { user: entry("late", 1, 1) },
        )
        .await;

        for _ in 0..200 {
            if !view.markers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(view.markers().len(), 1);
        assert_eq!(view.lines(), ["a", "b"]);
        assert_eq!(view.cursor(), Cursor::new(2, 1));
        assert!(client.is_connected().await);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_name_rejection_disconnects() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let view = Arc::new(MemoryView::new(11));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("taken")).await.unwrap();

        send_packet(&mut server_side, ServerMessage::ErrorNewnameTaken).await;
        wait_for_state(&client, ConnectionState::Disconnected).await;

        assert!(view
            .messages()
            .iter()
            .any(|(severity, msg)| *severity == Severity::Error && msg.contains("already in use")));
        assert!(matches!(client.disconnect().await, Err(SyncError::NotConnected)));
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let view = Arc::new(MemoryView::new(11));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("me")).await.unwrap();

        write_frame(&mut server_side, b"{\"type\":\"bogus\"}").await.unwrap();
        send_packet(
            &mut server_side,
            ServerMessage::UserConnected { user: entry("late", 1, 1) },
        )
        .await;

        for _ in 0..200 {
            if !view.markers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(view.markers().len(), 1);
        assert!(client.is_connected().await);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_marks_disconnected() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let view = Arc::new(MemoryView::new(11));
        let mut client =
            SyncClient::new(view.clone(), DuplexConnector::new(vec![client_side]), fast_config());
        client.connect(Some("h"), Some(1), Some("me")).await.unwrap();

        drop(server_side);
        wait_for_state(&client, ConnectionState::Disconnected).await;
        assert!(view
            .messages()
            .iter()
            .any(|(severity, _)| *severity == Severity::Error));
    }
}
