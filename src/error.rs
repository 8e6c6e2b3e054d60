//! Error Taxonomy
//!
//! Typed errors raised at the seams of the framework. Per-message failures are
//! contained at the message-handling boundary and logged; only configuration-time
//! errors (e.g. a malformed [`Resource`](crate::resource::Resource) path) reach
//! callers synchronously.

use thiserror::Error;

/// A capability path that does not start with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("invalid resource path '{0}': must start with '/'")]
    Invalid(String),
}

/// Raised when packets cannot be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("{format} encode failed: {reason}")]
    Encode { format: &'static str, reason: String },

    #[error("{format} decode failed: {reason}")]
    Decode { format: &'static str, reason: String },

    #[error("packet signature rejected: {0}")]
    Signature(String),

    #[error("no serializer could decode packet ({0})")]
    Exhausted(String),
}

/// A decoded packet that does not belong on the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected {kind} packet on channel '{channel}'")]
    UnexpectedPacket { kind: &'static str, channel: String },
}

/// Failures surfaced by the dispatcher as error-shaped results.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown actor '{0}'")]
    UnknownActor(String),

    #[error("actor '{prefix}' has no operation '{operation}'")]
    UnknownOperation { prefix: String, operation: String },

    #[error("no agent available for '{0}'")]
    NoTargets(String),

    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

impl DispatchError {
    /// Stable kind tag carried in error descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownActor(_) => "UnknownActor",
            DispatchError::UnknownOperation { .. } => "UnknownOperation",
            DispatchError::NoTargets(_) => "NoTargets",
            DispatchError::Execution(_) => "ActorExecutionError",
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a job with token '{0}' is already outstanding")]
    DuplicateToken(String),

    #[error("job '{0}' created without targets")]
    NoTargets(String),

    #[error(
        "intermediate messages are dispatched as they arrive, found pending keys {keys:?} for job '{token}'"
    )]
    PendingKeyOverflow { token: String, keys: Vec<String> },

    #[error("handler for job '{token}' failed: {source}")]
    Handler {
        token: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no route for channel '{0}'")]
    NoRoute(String),

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
