//! Error types for `EchoRelay` core library.

use thiserror::Error;

/// Result type alias using `EchoRelay` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `EchoRelay` operations.
///
/// Only `Configuration` and `Connection` are fatal, and only during startup.
/// Everything else is contained within the handling of a single message.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid startup input
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Subscribe failed or timed out, or the broker connection is gone
    #[error("Connection error: {0}")]
    Connection(String),

    /// Inbound payload is not valid UTF-8
    #[error("Failed to decode payload on topic {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: std::str::Utf8Error,
    },

    /// Outbound publish failed or timed out
    #[error("Failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// Out-of-band error reported by the broker transport
    #[error("Transport stream error: {0}")]
    TransportStream(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short stable label used as the `kind` field in log lines.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Decode { .. } => "decode",
            Self::Publish { .. } => "publish",
            Self::TransportStream(_) => "transport_stream",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
        }
    }

    /// Whether this error is allowed to terminate the process.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Connection(_))
    }
}
