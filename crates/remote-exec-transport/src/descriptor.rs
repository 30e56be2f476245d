//! Transport selection from configuration.

use std::{collections::HashMap, sync::Arc};

use remote_exec_core::{Transport, TransportError};
use serde::{Deserialize, Serialize};

use crate::{EventStreamTransport, PipeTransport};

/// How to reach a peer.
///
/// Deserializes from either `{"command", "args"?, "env"?}` or `{"url"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportDescriptor {
    /// Spawn a subprocess and speak NDJSON over its stdio.
    Spawn {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to an HTTP event-stream server.
    EventStream { url: String },
}

impl TransportDescriptor {
    /// Check the descriptor names something connectable.
    ///
    /// # Errors
    /// Returns error for an empty command or a non-HTTP URL.
    pub fn validate(&self) -> Result<(), TransportError> {
        match self {
            Self::Spawn { command, .. } if command.trim().is_empty() => {
                Err(TransportError::InvalidDescriptor("command is empty".to_owned()))
            }
            Self::EventStream { url } if !(url.starts_with("http://") || url.starts_with("https://")) => Err(
                TransportError::InvalidDescriptor(format!("url must be http(s): {url}")),
            ),
            _ => Ok(()),
        }
    }
}

/// Build and start the transport `descriptor` names.
///
/// # Errors
/// Returns error if the descriptor is invalid or the transport fails to start.
pub async fn connect(descriptor: &TransportDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
    descriptor.validate()?;
    match descriptor {
        TransportDescriptor::Spawn { command, args, env } => {
            Ok(Arc::new(PipeTransport::spawn(command, args, env).await?))
        }
        TransportDescriptor::EventStream { url } => Ok(Arc::new(EventStreamTransport::connect(url).await?)),
    }
}
