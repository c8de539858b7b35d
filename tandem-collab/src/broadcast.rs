//! Fan-out of encoded frames to connected peers.
//!
//! Every accepted connection gets a writer task fed by an unbounded channel.
//! Frames are encoded once and shared as `Arc<Vec<u8>>`, so a broadcast to N
//! peers is N channel sends, not N serializations.
//!
//! [`Connections`] is owned by the server's event loop and is never shared,
//! so it needs no lock. The loop copies [`Connections::stats`] into the
//! server statistics after every event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::roster::ConnectionId;

/// Item queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// A complete, length-prefixed frame.
    Frame(Arc<Vec<u8>>),
    /// Flush what is queued, then shut the stream down.
    Close,
}

/// Snapshot of fan-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames queued for a writer task
    pub frames_sent: u64,
    /// Frames whose writer was already gone
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    sender: mpsc::UnboundedSender<Outgoing>,
    reader: AbortHandle,
}

/// Live connections and their outgoing queues.
#[derive(Debug, Default)]
pub struct Connections {
    peers: HashMap<ConnectionId, Peer>,
    stats: AtomicBroadcastStats,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. `reader` is aborted when the connection goes away.
    pub fn insert(
        &mut self,
        id: ConnectionId,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outgoing>,
        reader: AbortHandle,
    ) {
        self.peers.insert(
            id,
            Peer {
                addr,
                sender,
                reader,
            },
        );
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Forget a connection whose stream already ended.
    ///
    /// Dropping the sender lets the writer drain its queue and exit.
    pub fn remove(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        let peer = self.peers.remove(&id)?;
        peer.reader.abort();
        Some(peer.addr)
    }

    /// Close a connection from the server side after its queued frames.
    ///
    /// The reader is stopped first, so nothing more from this connection is
    /// dispatched.
    pub fn close(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        let peer = self.peers.remove(&id)?;
        peer.reader.abort();
        let _ = peer.sender.send(Outgoing::Close);
        Some(peer.addr)
    }

    /// Queue `frame` for one connection. Returns whether it was queued.
    pub fn send_to(&self, id: ConnectionId, frame: Arc<Vec<u8>>) -> bool {
        match self.peers.get(&id) {
            Some(peer) => self.push(peer, frame),
            None => false,
        }
    }

    /// Queue `frame` for every connection except `except`.
    ///
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, frame: Arc<Vec<u8>>, except: Option<ConnectionId>) -> usize {
        self.peers
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, peer)| self.push(peer, frame.clone()))
            .count()
    }

    /// Close every connection, e.g. on server shutdown.
    pub fn close_all(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.reader.abort();
            let _ = peer.sender.send(Outgoing::Close);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    fn push(&self, peer: &Peer, frame: Arc<Vec<u8>>) -> bool {
        if peer.sender.send(Outgoing::Frame(frame)).is_ok() {
            self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            // Writer already gone; the reader will report the close.
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Spawn the task that drains `rx` into `writer`.
///
/// Ends on [`Outgoing::Close`], when every sender is dropped, or on the
/// first write error.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outgoing::Frame(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        log::debug!("Write failed, dropping connection output: {e}");
                        return;
                    }
                }
                Outgoing::Close => break,
            }
        }
        if let Err(e) = writer.shutdown().await {
            log::debug!("Shutdown failed: {e}");
        }
    })
}
