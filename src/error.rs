//! Error types for the event gateway

use std::io;

use thiserror::Error;

/// Result type alias for the event gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Event gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Gateway process configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event source configuration failed to parse or validate
    #[error("Invalid event source: {0}")]
    InvalidEventSource(String),

    /// No listener is registered for the declared type
    #[error("Unknown event source type: {0}")]
    UnknownEventSourceType(String),

    /// A session with the same id is already streaming
    #[error("Event source already running: {0}")]
    AlreadyRunning(String),

    /// Webhook port could not be bound
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        /// Requested port
        port: u16,
        /// Underlying socket error
        source: io::Error,
    },

    /// Filesystem watch could not be created or reported an error
    #[error("File watch error: {0}")]
    Watch(String),

    /// Another event source already owns this (port, endpoint, method)
    #[error("Route conflict: {0}")]
    RouteConflict(String),

    /// Malformed inbound webhook request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Webhook signature or token mismatch
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// External notification source closed
    #[error("Event source closed: {0}")]
    SourceClosed(String),

    /// Outbound stream write failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session was cancelled or already terminated
    #[error("Session ended")]
    SessionEnded,

    /// A listener panicked while producing events
    #[error("Event source {name} panicked: {message}")]
    ProducerPanicked {
        /// Event source name
        name: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short, stable classification used in logs and terminal stream frames
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidEventSource(_) | Self::Yaml(_) => "configuration",
            Self::UnknownEventSourceType(_) => "unknown_type",
            Self::AlreadyRunning(_) => "already_running",
            Self::Bind { .. } | Self::Watch(_) => "resource",
            Self::RouteConflict(_) => "route_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Verification(_) => "authentication",
            Self::SourceClosed(_) | Self::Transport(_) | Self::SessionEnded => "transport",
            Self::ProducerPanicked { .. } => "internal_fault",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }

    /// Whether the error is a problem with the caller's event source configuration
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.kind() == "configuration"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::InvalidEventSource("x".into()).kind(), "configuration");
        assert_eq!(Error::RouteConflict("x".into()).kind(), "route_conflict");
        assert_eq!(
            Error::Bind {
                port: 1,
                source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
            }
            .kind(),
            "resource"
        );
        assert_eq!(
            Error::ProducerPanicked {
                name: "a".into(),
                message: "boom".into()
            }
            .kind(),
            "internal_fault"
        );
    }

    #[test]
    fn test_bind_error_message() {
        let err = Error::Bind {
            port: 8080,
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(err.to_string(), "Failed to bind port 8080: address in use");
        assert!(!err.is_configuration());
    }
}
