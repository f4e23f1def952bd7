//! Error types for the debugger client.

use crate::envelope::{Envelope, ErrorLevel};
use std::fmt;
use thiserror::Error;

/// Errors surfaced by [`Session`](crate::Session) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A connection is already open or being opened.
    #[error("Already connected, disconnect first")]
    AlreadyConnected,

    /// The operation needs a live connection.
    #[error("Not connected")]
    NotConnected,

    /// Opening a transport to a specific endpoint failed.
    #[error("Couldn't connect to {uri}: {reason}")]
    Connect {
        /// Endpoint that was attempted.
        uri: String,
        /// Lower-level failure.
        reason: String,
    },

    /// Discovery produced no endpoint to try.
    #[error("Couldn't connect automatically.  Is PPSSPP connected to the same network?")]
    Discovery {
        /// Why discovery came back empty.
        reason: String,
    },

    /// The discovery endpoint could not be queried.
    #[error("discovery request failed: {0}")]
    Http(String),

    /// The debugger answered a request with an `error` reply.
    #[error("{message}")]
    Debugger {
        /// Server-supplied message.
        message: String,
        /// Server-supplied severity.
        level: Option<ErrorLevel>,
        /// The full reply.
        reply: Box<Envelope>,
    },

    /// The connection went away before a reply arrived.
    #[error("{message}")]
    Disconnected {
        /// Fixed teardown message.
        message: String,
    },

    /// Every ticket drawn from the source collided with a pending one.
    #[error("could not allocate a unique ticket after {0} attempts")]
    TicketsExhausted(usize),

    /// An envelope could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Creates a connection failure for `uri`.
    pub fn connect(uri: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Connect {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a discovery failure.
    pub fn discovery(reason: impl Into<String>) -> Self {
        Self::Discovery {
            reason: reason.into(),
        }
    }

    /// Converts an `error` reply into the error handed to the caller.
    pub fn from_reply(reply: Envelope) -> Self {
        Self::Debugger {
            message: reply.message().unwrap_or_default().to_string(),
            level: reply.level(),
            reply: Box::new(reply),
        }
    }

    /// Whether this error came from the connection dropping rather than the
    /// debugger refusing a request.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debugger_error_displays_server_message() {
        let reply = Envelope::error("bad", ErrorLevel::Warn);
        let err = ClientError::from_reply(reply);
        assert_eq!(err.to_string(), "bad");
        assert!(matches!(
            err,
            ClientError::Debugger {
                level: Some(ErrorLevel::Warn),
                ..
            }
        ));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn test_connect_error_display() {
        let err = ClientError::connect("ws://10.0.0.2:45000/debugger", "connection refused");
        assert_eq!(
            err.to_string(),
            "Couldn't connect to ws://10.0.0.2:45000/debugger: connection refused"
        );
    }

    #[test]
    fn test_disconnect_classification() {
        let err = ClientError::Disconnected {
            message: "PPSSPP disconnected".to_string(),
        };
        assert!(err.is_disconnect());
        assert_eq!(err.to_string(), "PPSSPP disconnected");
    }
}
