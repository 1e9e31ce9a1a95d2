//! Error types.
//!
//! Failures are values handed to callbacks or to the engine-wide error
//! handler; nothing here crosses the transport boundary as a panic.
//! Per-call problems ([`CallError`]) only ever reach the caller that issued the
//! call. Connection-level problems ([`EngineError`]) go to the error handler.

use serde_json::Value;
use thiserror::Error;

/// An inbound frame that is not a well-formed response envelope.
#[derive(Debug, Error)]
#[error("invalid incoming frame: {source}")]
pub struct DecodeError {
    /// The raw text that failed to decode.
    pub frame: String,
    #[source]
    pub source: serde_json::Error,
}

/// Error value sent back by the server in the `error` field of a response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("server returned an error: {0}")]
pub struct ServerError(pub Value);

/// Failure of a single call, delivered to that call's own callback.
#[derive(Debug, Error)]
pub enum CallError {
    /// No active session; the call was never written to the transport.
    #[error("not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Server(#[from] ServerError),
    /// The connection went away before a response arrived.
    #[error("connection lost before a response arrived")]
    ConnectionLost,
    /// The runtime worker is no longer running.
    #[error("session worker stopped")]
    Stopped,
    /// Typed request or response payload did not (de)serialize.
    #[error("payload conversion failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Server rejected the login credentials.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("authentication failed: {reason}")]
pub struct AuthenticationFailed {
    pub reason: Value,
}

/// Why a transport stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// The transport reported an error (including failure to connect).
    #[error("transport error: {0}")]
    Error(String),
    /// The remote side closed the connection.
    #[error("closed{}: {reason}", with_code(.code))]
    Closed { code: Option<u16>, reason: String },
}

fn with_code(code: &Option<u16>) -> String {
    code.map(|code| format!(" with code {code}")).unwrap_or_default()
}

/// Coarse tag for [`EngineError`], the `kind` half of an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    Encode,
    ConnectionLost,
    MaxReconnectionAttempts,
}

/// Connection-level failure reported to the engine-wide error handler.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed inbound frame. The connection stays open.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to encode outbound package: {0}")]
    Encode(#[source] serde_json::Error),
    /// Transport dropped, either by error or by an unexpected close.
    #[error("connection lost ({0})")]
    ConnectionLost(DisconnectReason),
    /// Reconnection gave up; the engine is closed.
    #[error("max reconnection attempts reached ({attempts})")]
    MaxReconnectionAttempts { attempts: u32 },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Decode(_) => ErrorKind::Decode,
            EngineError::Encode(_) => ErrorKind::Encode,
            EngineError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            EngineError::MaxReconnectionAttempts { .. } => ErrorKind::MaxReconnectionAttempts,
        }
    }
}

/// A server address that could not be turned into a socket URL.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint is empty")]
    Empty,
    #[error("relative endpoint {path:?} needs an origin to resolve against")]
    MissingOrigin { path: String },
    #[error("invalid endpoint {endpoint:?}: {source}")]
    Invalid {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_reasons_read_well() {
        assert_eq!(
            DisconnectReason::Error("refused".into()).to_string(),
            "transport error: refused"
        );
        let closed = DisconnectReason::Closed {
            code: Some(1001),
            reason: "going away".into(),
        };
        assert_eq!(closed.to_string(), "closed with code 1001: going away");
        let bare = DisconnectReason::Closed {
            code: None,
            reason: String::new(),
        };
        assert_eq!(bare.to_string(), "closed: ");
        assert_eq!(
            EngineError::ConnectionLost(closed).to_string(),
            "connection lost (closed with code 1001: going away)"
        );
    }
}
