//! Packet Model
//!
//! The wire contract between agents and mappers. Packets are a single
//! internally tagged enum (`"kind": "request"`, `"kind": "ping"`, ...) whose
//! fields are plain scalars, maps and sequences so they round-trip through
//! every configured [`serializer::Serializer`].
//!
//! ## Channels
//! The constants below name the addressing primitives the mapper and agents
//! agree on. Per-identity channels (agent inboxes, reply queues) are named by
//! the identity itself.

pub mod serializer;
pub mod types;

pub use serializer::{
    JsonSerializer, MessagePackSerializer, SerializerChain, Serializer, SignedSerializer,
    YamlSerializer,
};
pub use types::*;

/// Agent heartbeats (fanout).
pub const HEARTBEAT: &str = "heartbeat";
/// Register / UnRegister (fanout).
pub const REGISTRATION: &str = "registration";
/// Requests from agents to the master mapper (shared queue).
pub const REQUEST: &str = "request";
/// Slave-to-master coordination (state requests, state replies).
pub const MAPPER_MASTER: &str = "mapper.master";
/// Slave liveness pings to the master.
pub const MAPPER_MASTER_HEARTBEAT: &str = "mapper.master.heartbeat";
/// Master-to-slaves propagation (fanout).
pub const MAPPER_SLAVE: &str = "mapper.slave";
/// Durable parking queue for requests without an available target.
pub const MAPPER_OFFLINE: &str = "mapper-offline";
