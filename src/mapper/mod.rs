//! Mapper Coordination
//!
//! A mapper owns the cluster table, routes requests to agents and correlates
//! their results. Several mappers may run at once; exactly one is expected
//! to be master.
//!
//! ## Roles
//! - **Slave** (initial): consumes `mapper.slave`, mirrors the master's table
//!   (full state on start, then `AddAgent`/`DeleteAgent` updates) and pings
//!   `mapper.master.heartbeat` every `master_heartbeat_interval`. Without a
//!   pong inside the [`Election`] window it promotes itself.
//! - **Master**: consumes `heartbeat`, `registration`, `request`,
//!   `mapper.master` and `mapper.master.heartbeat`. Runs the reaper sweep,
//!   liveness rounds and offline-queue redelivery, and broadcasts membership
//!   changes to slaves.
//!
//! ## Event loop
//! Subscriptions are fed into one channel together with publish requests and
//! timer deadlines, so every state transition happens on the loop task.

pub mod admin;
mod handlers;
pub mod role;
pub mod service;

pub use role::{Election, HeartbeatPromotion, MasterCheck, REPLY_WINDOW, Role};
pub use service::{Mapper, MapperStatus};
