//! Relay error types.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// A `WebSocket` upgrade that did not produce a peer connection.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The request was not a valid upgrade request.
    #[error("websocket upgrade rejected: {0}")]
    Rejected(#[from] WebSocketUpgradeRejection),
    /// The handshake response was sent but switching protocols failed.
    #[error("websocket upgrade failed: {0}")]
    Failed(#[source] axum::Error),
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        match self {
            Self::Rejected(rejection) => rejection.into_response(),
            Self::Failed(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
}

/// A failed write to one peer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The underlying socket rejected the frame.
    #[error("websocket write failed: {0}")]
    Write(#[from] axum::Error),
    /// The peer's outbound half is already closed.
    #[error("peer connection closed")]
    Closed,
}

/// A failure of the subscription source. Fatal to the broadcast loop.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Could not connect or subscribe.
    #[error("failed to subscribe to {channel}: {message}")]
    Subscribe {
        /// Channel that was being subscribed to.
        channel: String,
        /// Underlying error text.
        message: String,
    },
    /// Receiving the next message failed.
    #[error("subscription receive failed: {0}")]
    Receive(String),
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// An environment variable held an unusable value.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// The rejected value.
        value: String,
    },
    /// A config value was invalid.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Top-level server errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The bound listener could not report its address.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

impl RelayError {
    /// Build a bind error for `addr`.
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}
