//! Agent/Mapper Cluster Library
//!
//! Agents host named actors; mappers keep track of which agents are alive,
//! route requests to them and fold the answers of a fan-out into one result.
//! Everything travels as [`packet::Packet`]s over a [`transport::Transport`].
//!
//! ## Architecture Modules
//! - **`resource`**: hierarchical `/a/b/c` paths and their provide relation.
//! - **`cluster`**: the agent table with service and tag indices, and the
//!   single idempotent eviction path.
//! - **`reaper`**: TTL registry that evicts silent agents.
//! - **`routing`**: target selection (least loaded, random, all, round robin).
//! - **`job`**: correlation of results and intermediate messages per token.
//! - **`dispatcher`**: actor registry and the agent-side dispatch boundary.
//! - **`packet`**: wire packets and the serializer chain.
//! - **`transport`**: broker seam and the in-process `MemoryBus`.
//! - **`agent`** / **`mapper`**: the two process roles built on the above.
//! - **`config`**, **`security`**, **`error`**: ambient pieces shared by both.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod mapper;
pub mod packet;
pub mod reaper;
pub mod resource;
pub mod routing;
pub mod security;
pub mod transport;
