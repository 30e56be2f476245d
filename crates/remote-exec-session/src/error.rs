//! Session error type.

use std::sync::Arc;

use remote_exec_core::{RpcError, TransportError, message::codes};
use serde_json::Value;
use thiserror::Error;

/// Session error.
///
/// Cloneable so one handshake outcome can be handed to every caller sharing it.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[source] Arc<TransportError>),
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("connection closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// JSON-RPC code for remote and close failures.
    #[must_use]
    pub const fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            Self::Closed => Some(codes::CONNECTION_CLOSED),
            Self::Transport(_) | Self::Protocol(_) => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(value: TransportError) -> Self {
        Self::Transport(Arc::new(value))
    }
}

impl From<RpcError> for SessionError {
    fn from(value: RpcError) -> Self {
        Self::Remote {
            code: value.code,
            message: value.message,
            data: value.data,
        }
    }
}
