/**
 * ERROR - Error taxonomy shared by every kernel component
 *
 * ROLE: one thiserror enum per component (codec, transport, session, discovery),
 * each mapped onto a machine-checkable ErrorKind carried by error events.
 *
 * HOW: validation errors are returned synchronously by the command surface,
 * everything else is surfaced as a state transition plus an event on the bus.
 */

use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Machine-checkable error category attached to every error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transport,
    Decode,
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("varint longer than 10 bytes at offset {offset}")]
    VarintOverflow { offset: usize },

    #[error("invalid field key at offset {offset}")]
    InvalidField { offset: usize },

    #[error("unexpected wire type {wire_type} for field {field}")]
    WireType { field: u32, wire_type: u8 },

    #[error("invalid UTF-8 in field {field}")]
    InvalidUtf8 { field: u32 },

    #[error("metric '{metric}' declares {datatype} but carries a {found} value")]
    ValueMismatch {
        metric: String,
        datatype: String,
        found: &'static str,
    },

    #[error("metric '{metric}' value does not fit {datatype}")]
    OutOfRange { metric: String, datatype: String },

    #[error("nesting deeper than {limit} levels")]
    NestingTooDeep { limit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("request rejected: {0}")]
    Request(String),

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {id} is {state}, not connected")]
    NotConnected { id: String, state: SessionState },

    #[error("session {0} is closing, operation cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation(_)
            | SessionError::NotFound(_)
            | SessionError::NotConnected { .. } => ErrorKind::Validation,
            SessionError::Cancelled(_) | SessionError::Transport(_) => ErrorKind::Transport,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery options: {0}")]
    Validation(String),

    #[error("discovery is already scanning")]
    AlreadyScanning,

    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[from] std::io::Error),
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiscoveryError::Validation(_) | DiscoveryError::AlreadyScanning => ErrorKind::Validation,
            DiscoveryError::Interfaces(_) => ErrorKind::Probe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_kinds() {
        assert_eq!(SessionError::Validation("port".into()).kind(), ErrorKind::Validation);
        let not_connected = SessionError::NotConnected {
            id: "s1".into(),
            state: SessionState::Reconnecting,
        };
        assert_eq!(not_connected.kind(), ErrorKind::Validation);
        assert_eq!(not_connected.to_string(), "session s1 is reconnecting, not connected");
        assert_eq!(SessionError::from(TransportError::Closed).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Decode).unwrap();
        assert_eq!(json, "\"decode\"");
    }
}
