//! Error types for valkey-cluster-client

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Top-level client error
///
/// Clone-able on purpose: a topology refresh is shared by every caller
/// that coalesced onto it, so all of them receive the same outcome. IO
/// sources are kept behind `Arc` to make that possible without
/// flattening them to strings.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("no node to retrieve cluster slots")]
    NoNodes,

    #[error("slot not covered by the current topology")]
    NoSlot,

    #[error("connection is closing")]
    ConnClosing,

    #[error("record version mismatched, please retry")]
    VersionMismatch,

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("transport error: {0}")]
    Transport(#[source] Arc<io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("cluster topology refresh failed: {0}")]
    RefreshFailed(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("record decode failed: {0}")]
    Decode(String),
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Transport(Arc::new(e))
    }
}

/// RESP protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("invalid RESP type byte: {0}")]
    InvalidType(u8),

    #[error("invalid bulk string length: {0}")]
    InvalidLength(i64),

    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("command is not marked cacheable")]
    NotCacheable,

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
