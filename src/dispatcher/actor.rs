use super::types::{Emitter, ErrorDescriptor};
use crate::packet::Request;

use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Name an operation is reached by when a request names only the prefix.
pub const DEFAULT_OPERATION: &str = "index";

pub type OperationFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

pub type PayloadFn = Arc<dyn Fn(Value, Emitter) -> OperationFuture + Send + Sync>;
pub type WithRequestFn = Arc<dyn Fn(Value, Request, Emitter) -> OperationFuture + Send + Sync>;

/// The two operation shapes, chosen at registration.
#[derive(Clone)]
pub enum Handler {
    Payload(PayloadFn),
    WithRequest(WithRequestFn),
}

/// Called with the descriptor of every failed invocation of an actor.
pub type ExceptionHook = Arc<dyn Fn(&ErrorDescriptor, &Request) + Send + Sync>;

/// One exposed operation plus its settlement policy.
#[derive(Clone)]
pub struct Operation {
    name: String,
    handler: Handler,
    ack_on_success: bool,
    requeue_on_failure: bool,
}

impl Operation {
    pub fn new<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(Value, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: PayloadFn =
            Arc::new(move |payload, emitter| Box::pin(handler(payload, emitter)) as OperationFuture);

        Self::from_handler(name, Handler::Payload(handler))
    }

    pub fn with_request<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(Value, Request, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: WithRequestFn = Arc::new(move |payload, request, emitter| {
            Box::pin(handler(payload, request, emitter)) as OperationFuture
        });

        Self::from_handler(name, Handler::WithRequest(handler))
    }

    fn from_handler(name: &str, handler: Handler) -> Self {
        Self {
            name: name.trim_matches('/').to_string(),
            handler,
            ack_on_success: false,
            requeue_on_failure: false,
        }
    }

    /// Ack only after the operation returns successfully.
    pub fn ack_on_success(mut self) -> Self {
        self.ack_on_success = true;
        self
    }

    /// Reject with requeue when the operation fails.
    pub fn requeue_on_failure(mut self) -> Self {
        self.requeue_on_failure = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acks_on_success(&self) -> bool {
        self.ack_on_success
    }

    pub fn requeues_on_failure(&self) -> bool {
        self.requeue_on_failure
    }

    /// Whether the ack waits for the outcome. Requeueing needs the message
    /// unsettled until then, so it defers the ack too.
    pub fn defers_ack(&self) -> bool {
        self.ack_on_success || self.requeue_on_failure
    }

    pub fn invoke(&self, payload: Value, request: Request, emitter: Emitter) -> OperationFuture {
        match &self.handler {
            Handler::Payload(f) => f(payload, emitter),
            Handler::WithRequest(f) => f(payload, request, emitter),
        }
    }
}

/// A named group of operations reachable as `/prefix/operation`.
#[derive(Clone)]
pub struct Actor {
    prefix: String,
    operations: BTreeMap<String, Operation>,
    on_exception: Option<ExceptionHook>,
}

impl Actor {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            operations: BTreeMap::new(),
            on_exception: None,
        }
    }

    pub fn expose<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Value, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.operation(Operation::new(name, handler))
    }

    pub fn expose_with_request<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Value, Request, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.operation(Operation::with_request(name, handler))
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.insert(operation.name.clone(), operation);
        self
    }

    pub fn on_exception<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorDescriptor, &Request) + Send + Sync + 'static,
    {
        self.on_exception = Some(Arc::new(hook));
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get(&self, operation: &str) -> Option<&Operation> {
        self.operations.get(operation)
    }

    pub fn exception_hook(&self) -> Option<&ExceptionHook> {
        self.on_exception.as_ref()
    }

    /// Service paths this actor provides, one per operation.
    pub fn services(&self) -> Vec<String> {
        self.operations
            .keys()
            .map(|op| format!("/{}/{}", self.prefix, op))
            .collect()
    }
}
