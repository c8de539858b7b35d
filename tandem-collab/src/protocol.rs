//! JSON packet model carried inside length-prefixed frames.
//!
//! Wire shape:
//! ```text
//! {"type": "message", "data": {"message_type": "connect_success", ...}}
//! {"type": "update",  "data": {"name": ..., "cursor"?, "buffer"?, "updated_cursors"?}}
//! ```
//!
//! The join handshake is the only non-JSON payload: the raw UTF-8 name.
//! Decoding goes through the `type` / `message_type` discriminators; an
//! unknown tag is a [`SyncError::MalformedPacket`], never a silent no-op.

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::{Result, SyncError};
use crate::patch::Patch;

/// A user as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub cursor: Cursor,
}

/// Session notifications sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a successful join. `buffer` is only present when someone
    /// else is already editing.
    ConnectSuccess {
        name: String,
        users: Vec<UserEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buffer: Option<Vec<String>>,
    },
    UserConnected {
        user: UserEntry,
    },
    UserDisconnected {
        name: String,
    },
    ErrorNewnameTaken,
    ErrorNewnameInvalid,
}

/// Cursor and/or buffer change from one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePacket {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Patch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_cursors: Vec<UserEntry>,
}

/// Top-level packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Packet {
    Message(ServerMessage),
    Update(UpdatePacket),
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<ServerMessage> for Packet {
    fn from(message: ServerMessage) -> Self {
        Packet::Message(message)
    }
}

impl From<UpdatePacket> for Packet {
    fn from(update: UpdatePacket) -> Self {
        Packet::Update(update)
    }
}

/// Payload of the first frame a client sends.
pub fn encode_join(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

pub fn decode_join(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| SyncError::MalformedPacket(format!("join name is not UTF-8: {e}")))
}
