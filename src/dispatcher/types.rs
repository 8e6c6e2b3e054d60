use crate::error::DispatchError;
use crate::packet::{IntermediateMessage, Outbound, Packet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Key under which an error-shaped result carries its descriptor.
pub const ERROR_KEY: &str = "error";

/// A failure turned into data at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl ErrorDescriptor {
    pub fn from_error(error: &DispatchError) -> Self {
        let trace = match error {
            DispatchError::Execution(inner) => {
                inner.chain().skip(1).map(|cause| cause.to_string()).collect()
            }
            _ => Vec::new(),
        };

        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            trace,
        }
    }

    /// `{"error": {...}}`, the payload of an error-shaped result.
    pub fn into_value(self) -> Value {
        json!({ ERROR_KEY: self })
    }

    /// Extracts the descriptor from an error-shaped result.
    pub fn from_value(value: &Value) -> Option<Self> {
        value
            .get(ERROR_KEY)
            .and_then(|inner| serde_json::from_value(inner.clone()).ok())
    }
}

/// Streams intermediate values from a running operation back to the caller.
#[derive(Clone)]
pub struct Emitter {
    token: String,
    to: String,
    from: String,
    reply_to: Option<String>,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl Emitter {
    pub fn new(
        token: impl Into<String>,
        to: impl Into<String>,
        from: impl Into<String>,
        reply_to: Option<String>,
        outbox: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            token: token.into(),
            to: to.into(),
            from: from.into(),
            reply_to,
            outbox,
        }
    }

    /// Publishes one intermediate message right away. A no-op when the
    /// request expects no reply.
    pub fn emit(&self, key: &str, message: Value) {
        let Some(reply_to) = &self.reply_to else {
            return;
        };

        let packet = Packet::IntermediateMessage(IntermediateMessage {
            token: self.token.clone(),
            to: self.to.clone(),
            from: self.from.clone(),
            messagekey: key.to_string(),
            message,
        });

        if self.outbox.send(Outbound::new(reply_to.clone(), packet)).is_err() {
            tracing::warn!("Outbox closed, dropping intermediate '{}' for {}", key, self.token);
        }
    }
}
