//! Error types for the server and the client link.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

/// Server-side failures. Only binding the listener is fatal; everything
/// else ends a single session at most.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("document hub is not running")]
    HubUnavailable,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client link failures. The `Display` text is meant to be shown to the user.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link is closed. Please restart the client to reconnect.")]
    Disconnected,
    #[error("Outbound queue is full ({0} messages). Your edit was not queued.")]
    QueueFull(usize),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
