//! # tandem-collab: Real-time collaborative plain-text editing
//!
//! A central server holds the authoritative buffer and roster; every client
//! keeps a mirrored copy, sends line-range patches of its local edits and
//! applies the patches the server fans out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   length-prefixed   ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ EditorView  │                     │ Buffer +    │
//! │ (injected)  │                     │ Roster      │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Connections   │
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: 4-byte big-endian length-prefixed framing
//! - [`protocol`]: JSON packet model (`message` / `update`)
//! - [`patch`]: line-range diff and splice
//! - [`cursor`]: cursor positions and shifting under remote edits
//! - [`roster`]: joined identities, name rules, color slots
//! - [`client`]: connection lifecycle and the background sync loop
//! - [`server`]: accept loop and single-owner event loop
//! - [`broadcast`]: per-connection writer queues and fan-out
//! - [`view`], [`transport`], [`platform`]: collaborator traits
//! - [`command`], [`config`]: the host command surface and its defaults

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod cursor;
pub mod error;
pub mod patch;
pub mod platform;
pub mod protocol;
pub mod roster;
pub mod server;
pub mod transport;
pub mod view;

// Re-exports for convenience
pub use client::{ClientConfig, ConnectionState, RemoteCursors, SyncClient};
pub use codec::{encode_frame, FrameDecoder, FrameReader, Received, DEFAULT_MAX_FRAME_LEN};
pub use command::{Command, Controller, Flow};
pub use config::{ConfigError, HostConfig};
pub use cursor::{shift_cursor, Cursor};
pub use error::{Result, SyncError};
pub use patch::{apply_incoming_patch, compute_outgoing_patch, Patch};
pub use platform::{InProcessPlatform, Platform};
pub use protocol::{Packet, ServerMessage, UpdatePacket, UserEntry};
pub use roster::{ConnectionId, Roster};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use transport::{Connector, TcpConnector};
pub use view::{EditorView, MemoryView, Severity};
