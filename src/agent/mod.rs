//! Agent Runtime
//!
//! An agent hosts actors and keeps the mapper informed about them.
//!
//! ## Lifecycle
//! - **Start**: declares its inbox (a queue named by its identity) and sends a
//!   `Register` with every `/prefix/operation` it provides.
//! - **Heartbeat**: a `Ping` with its current load on every
//!   `heartbeat_interval`.
//! - **Inbox**: requests go to the dispatcher (inline, or on a bounded worker
//!   pool); liveness pings are answered with `Pong`; `Advertise` triggers a
//!   fresh `Register`; replies to its own requests go to the [`MapperProxy`].
//! - **Shutdown**: sends `UnRegister` before the loop exits.

pub mod proxy;
pub mod service;

pub use proxy::{MapperProxy, ResponseHandle};
pub use service::{Agent, StatusProvider, system_load};
