//! Result Correlation
//!
//! A [`Job`] tracks one logical request fanned out to several targets. The
//! [`JobWarden`] feeds it every `Result` and `IntermediateMessage` carrying
//! its token:
//!
//! - A `Result` removes its sender from the pending set and stores the value.
//!   When nothing is pending the completion handler fires once and the job
//!   is dropped.
//! - An `IntermediateMessage` is appended to the per-target, per-key history
//!   and handed to the intermediate handler. It never affects completion.
//!
//! Packets for unknown tokens are dropped silently.

pub mod types;
pub mod warden;

pub use types::{
    CompletionHandler, IntermediateCallback, IntermediateHandler, Job, JobResults,
    ProcessOutcome, WILDCARD_KEY,
};
pub use warden::JobWarden;
