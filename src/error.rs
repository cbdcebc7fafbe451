//! Error types for the light node

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Checksum mismatch for command {command}")]
    ChecksumMismatch { command: String },

    #[error("Truncated input: {0}")]
    Truncated(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),

    #[error("Unsupported protocol version {version} for {command}")]
    UnsupportedProtocol { version: i32, command: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Block download timed out with {missing} of {requested} blocks missing")]
    DownloadTimeout { missing: usize, requested: usize },

    #[error("Block download superseded by a newer batch")]
    DownloadSuperseded,

    #[error("Block decoding failed: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Node is shutting down")]
    Shutdown,
}

impl NodeError {
    /// Whether the error is attributable to a misbehaving or unreachable peer.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            NodeError::ChecksumMismatch { .. }
                | NodeError::Truncated(_)
                | NodeError::Malformed(_)
                | NodeError::PayloadTooLarge(_)
                | NodeError::UnsupportedProtocol { .. }
                | NodeError::Connection(_)
                | NodeError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Storage(err.to_string())
    }
}

impl From<rocksdb::Error> for NodeError {
    fn from(err: rocksdb::Error) -> Self {
        NodeError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
