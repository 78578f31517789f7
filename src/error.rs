//! Realtime client error types.
//!
//! # Fatal vs. local errors
//!
//! - **Fatal**: [`RealtimeError::Connect`], [`RealtimeError::Handshake`] and
//!   [`RealtimeError::SessionStopped`] mean the session cannot be used any
//!   further. Recovery is a fresh `RealtimeClient::start`.
//! - **Local**: [`RealtimeError::Subscription`] and [`RealtimeError::Timeout`]
//!   affect only the call that produced them. The poll loop keeps running.
//!
//! Nothing inside the client retries on its own; [`RealtimeError::is_fatal`]
//! gives callers what they need to decide.

use thiserror::Error;

/// Realtime client errors.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// The transport could not be opened, or failed while reading or writing.
    #[error("Connect error: {0}")]
    Connect(String),

    /// The handshake was rejected or did not complete in time.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// A subscribe or unsubscribe request was rejected or timed out.
    #[error("Subscription error on {channel}: {reason}")]
    Subscription {
        /// Channel the request was made for.
        channel: String,
        /// Server-provided error or local reason.
        reason: String,
    },

    /// The poll loop is already running for this session.
    #[error("Poll loop already running")]
    AlreadyPolling,

    /// The session has been stopped.
    #[error("Session stopped")]
    SessionStopped,

    /// Operation requires an authenticated session.
    #[error("Session not authenticated")]
    NotAuthenticated,

    /// No correlated response arrived in time.
    #[error("Timed out after {timeout_ms}ms waiting for {context}")]
    Timeout {
        /// What was being waited for.
        context: String,
        /// Bound that elapsed.
        timeout_ms: u64,
    },

    /// Invalid message format.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RealtimeError {
    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Handshake(_) | Self::SessionStopped
        )
    }
}

/// Result type alias for realtime operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Connect(err.to_string())
    }
}

impl From<toml::de::Error> for RealtimeError {
    fn from(err: toml::de::Error) -> Self {
        RealtimeError::Config(err.to_string())
    }
}
