//! Error taxonomy shared by the client engine, the server and the codec.

use std::io;

use thiserror::Error;

/// Errors surfaced by the synchronization core.
///
/// Argument and misuse errors (`InvalidArguments`, `AlreadyConnected`,
/// `NotConnected`) leave session state untouched. Transport errors abandon
/// the connection attempt. `MalformedPacket` only ever drops the offending
/// frame; it never tears down a session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error("already connected to a server, disconnect first")]
    AlreadyConnected,

    #[error("not connected to a server")]
    NotConnected,

    #[error("unable to connect to {target}: {source}")]
    ConnectionFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("name `{0}` is already in use, please try a different name")]
    NameConflict(String),

    #[error(
        "name `{0}` is invalid, only letters, numbers, underscores and dashes are allowed"
    )]
    InvalidName(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedPacket(e.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_maps_to_malformed_packet() {
        let err: SyncError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, SyncError::MalformedPacket(_)));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            SyncError::NameConflict("bob".into()).to_string(),
            "name `bob` is already in use, please try a different name"
        );
        assert_eq!(
            SyncError::FrameTooLarge { len: 10, max: 4 }.to_string(),
            "frame of 10 bytes exceeds the 4 byte limit"
        );
    }
}
