use super::actor::{Actor, DEFAULT_OPERATION, Operation};
use super::registry::ActorRegistry;
use super::types::{Emitter, ErrorDescriptor};
use crate::error::DispatchError;
use crate::packet::{JobResult, Outbound, Packet, Request};
use crate::transport::Acknowledger;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Splits a service path into `(prefix, operation)`. A bare prefix maps to
/// the default `index` operation.
pub fn resolve(service: &str) -> (String, String) {
    let path = service.trim_matches('/');
    match path.rsplit_once('/') {
        Some((prefix, operation)) => (prefix.to_string(), operation.to_string()),
        None => (path.to_string(), DEFAULT_OPERATION.to_string()),
    }
}

/// Canonical `/prefix/operation` form of a service path.
pub fn canonical_service(service: &str) -> String {
    let (prefix, operation) = resolve(service);
    format!("/{}/{}", prefix, operation)
}

/// Settles a delivery at most once.
struct Settlement(Option<Box<dyn Acknowledger>>);

impl Settlement {
    fn ack(&mut self) {
        if let Some(acker) = self.0.take() {
            acker.ack();
        }
    }

    fn reject(&mut self, requeue: bool) {
        if let Some(acker) = self.0.take() {
            acker.reject(requeue);
        }
    }
}

/// A dispatch dropped before settling hands the message back.
impl Drop for Settlement {
    fn drop(&mut self) {
        if let Some(acker) = self.0.take() {
            tracing::debug!("Dispatch abandoned before settling, requeueing");
            acker.reject(true);
        }
    }
}

/// Turns inbound requests into actor invocations on the agent side.
pub struct Dispatcher {
    identity: String,
    registry: Arc<ActorRegistry>,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl Dispatcher {
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<ActorRegistry>,
        outbox: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            identity: identity.into(),
            registry,
            outbox,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }

    fn lookup(&self, service: &str) -> Result<(Arc<Actor>, Operation), DispatchError> {
        let (prefix, operation) = resolve(service);

        let actor = self
            .registry
            .get(&prefix)
            .ok_or_else(|| DispatchError::UnknownActor(prefix.clone()))?;

        let operation = actor
            .get(&operation)
            .cloned()
            .ok_or(DispatchError::UnknownOperation { prefix, operation })?;

        Ok((actor, operation))
    }

    /// Runs one request to completion and settles its delivery exactly once.
    ///
    /// Returns the reply to publish, if the request asked for one. Failures
    /// become error-shaped results, except when the operation requeues on
    /// failure: then the delivery is rejected and nothing is returned.
    pub async fn dispatch(
        &self,
        request: Request,
        acker: Box<dyn Acknowledger>,
    ) -> Option<Outbound> {
        let mut settlement = Settlement(Some(acker));

        let (actor, operation) = match self.lookup(&request.service) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Cannot dispatch {} ({}): {}", request.service, request.token, e);
                settlement.ack();
                let descriptor = ErrorDescriptor::from_error(&e);
                return self.reply(&request, descriptor.into_value());
            }
        };

        if !operation.defers_ack() {
            settlement.ack();
        }

        tracing::debug!(
            "Invoking /{}/{} for {} ({})",
            actor.prefix(),
            operation.name(),
            request.from,
            request.token
        );

        let emitter = Emitter::new(
            request.token.clone(),
            request.from.clone(),
            self.identity.clone(),
            request.reply_to.clone(),
            self.outbox.clone(),
        );
        let invocation = operation.invoke(request.payload.clone(), request.clone(), emitter);

        let outcome = match tokio::spawn(invocation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DispatchError::Execution(e)),
            Err(join) => Err(DispatchError::Execution(anyhow::anyhow!(
                "operation /{}/{} panicked: {}",
                actor.prefix(),
                operation.name(),
                join
            ))),
        };

        let results = match outcome {
            Ok(value) => {
                settlement.ack();
                value
            }
            Err(e) => {
                let descriptor = ErrorDescriptor::from_error(&e);
                tracing::warn!(
                    "/{}/{} failed for {}: {}",
                    actor.prefix(),
                    operation.name(),
                    request.token,
                    descriptor.message
                );

                if let Some(hook) = actor.exception_hook() {
                    hook(&descriptor, &request);
                }

                if operation.requeues_on_failure() {
                    settlement.reject(true);
                    return None;
                }

                settlement.ack();
                descriptor.into_value()
            }
        };

        self.reply(&request, results)
    }

    fn reply(&self, request: &Request, results: Value) -> Option<Outbound> {
        let reply_to = request.reply_to.as_ref()?;

        Some(Outbound::new(
            reply_to.clone(),
            Packet::Result(JobResult {
                token: request.token.clone(),
                to: request.from.clone(),
                from: self.identity.clone(),
                results,
            }),
        ))
    }
}
