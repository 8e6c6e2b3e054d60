//! Request Dispatcher
//!
//! The agent-side protocol state machine that turns a wire `Request` into an
//! actor invocation and a reply.
//!
//! ## Flow
//! 1. **Resolve**: `/prefix/operation` (or `/prefix`, meaning `index`) is looked
//!    up in the [`registry::ActorRegistry`].
//! 2. **Settle**: the delivery is acked before the invocation unless the
//!    operation defers its ack (`ack_on_success` or `requeue_on_failure`).
//! 3. **Invoke**: the operation runs on its own task so panics are caught;
//!    it may stream intermediate values through its [`types::Emitter`].
//! 4. **Reply**: success or an [`types::ErrorDescriptor`] becomes a `Result`
//!    addressed to the requester's `reply_to`.

pub mod actor;
pub mod dispatcher;
pub mod registry;
pub mod types;

pub use actor::{Actor, DEFAULT_OPERATION, ExceptionHook, Handler, Operation};
pub use dispatcher::{Dispatcher, canonical_service, resolve};
pub use registry::ActorRegistry;
pub use types::{ERROR_KEY, Emitter, ErrorDescriptor};

#[cfg(test)]
mod tests;
