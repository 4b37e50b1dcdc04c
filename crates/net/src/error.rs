//! Network error types

use std::io;

use crate::transport::TransportError;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Timed out claiming the rendezvous identity")]
    ElectionTimeout,

    #[error("Hub unreachable after {attempts} attempts")]
    HubUnreachable { attempts: u32 },

    #[error("Session is not running")]
    NotRunning,

    #[error(transparent)]
    Core(#[from] huddle_core::Error),
}
