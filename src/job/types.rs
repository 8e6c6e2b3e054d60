use crate::packet::Request;

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Instant;

/// Results keyed by the target identity that produced them.
pub type JobResults = BTreeMap<String, Value>;

pub type MessageFn = Box<dyn FnMut(&str, &str, &Value) -> anyhow::Result<()> + Send>;
pub type MessageWithJobFn = Box<dyn FnMut(&str, &str, &Value, &Job) -> anyhow::Result<()> + Send>;

/// Intermediate callback shapes: `(messagekey, from, message)` and the same
/// plus the job.
pub enum IntermediateCallback {
    Message(MessageFn),
    WithJob(MessageWithJobFn),
}

impl IntermediateCallback {
    pub fn message<F>(f: F) -> Self
    where
        F: FnMut(&str, &str, &Value) -> anyhow::Result<()> + Send + 'static,
    {
        IntermediateCallback::Message(Box::new(f))
    }

    pub fn with_job<F>(f: F) -> Self
    where
        F: FnMut(&str, &str, &Value, &Job) -> anyhow::Result<()> + Send + 'static,
    {
        IntermediateCallback::WithJob(Box::new(f))
    }

    fn call(&mut self, key: &str, from: &str, message: &Value, job: &Job) -> anyhow::Result<()> {
        match self {
            IntermediateCallback::Message(f) => f(key, from, message),
            IntermediateCallback::WithJob(f) => f(key, from, message, job),
        }
    }
}

/// Key used in a keyed handler table to catch every message key.
pub const WILDCARD_KEY: &str = "*";

pub enum IntermediateHandler {
    /// One callback for every message key.
    Any(IntermediateCallback),
    /// Callbacks per message key; [`WILDCARD_KEY`] catches the rest.
    Keyed(HashMap<String, IntermediateCallback>),
}

impl IntermediateHandler {
    /// Invokes the callback registered for `key`, if any. Returns whether a
    /// callback ran.
    pub(crate) fn dispatch(
        &mut self,
        key: &str,
        from: &str,
        message: &Value,
        job: &Job,
    ) -> anyhow::Result<bool> {
        let callback = match self {
            IntermediateHandler::Any(callback) => Some(callback),
            IntermediateHandler::Keyed(table) => {
                if table.contains_key(key) {
                    table.get_mut(key)
                } else {
                    table.get_mut(WILDCARD_KEY)
                }
            }
        };

        match callback {
            Some(callback) => callback.call(key, from, message, job).map(|_| true),
            None => Ok(false),
        }
    }
}

pub type ResultsFn = Box<dyn FnOnce(JobResults) -> anyhow::Result<()> + Send>;
pub type ResultsWithJobFn = Box<dyn FnOnce(JobResults, &Job) -> anyhow::Result<()> + Send>;

/// Completion callback shapes: `(results)` and `(results, job)`.
pub enum CompletionHandler {
    Results(ResultsFn),
    WithJob(ResultsWithJobFn),
}

impl CompletionHandler {
    pub fn results<F>(f: F) -> Self
    where
        F: FnOnce(JobResults) -> anyhow::Result<()> + Send + 'static,
    {
        CompletionHandler::Results(Box::new(f))
    }

    pub fn with_job<F>(f: F) -> Self
    where
        F: FnOnce(JobResults, &Job) -> anyhow::Result<()> + Send + 'static,
    {
        CompletionHandler::WithJob(Box::new(f))
    }

    pub(crate) fn call(self, results: JobResults, job: &Job) -> anyhow::Result<()> {
        match self {
            CompletionHandler::Results(f) => f(results),
            CompletionHandler::WithJob(f) => f(results, job),
        }
    }
}

/// Correlation record for one outstanding request.
pub struct Job {
    pub token: String,
    pub request: Option<Request>,
    pub(crate) pending: BTreeSet<String>,
    pub(crate) results: JobResults,
    pub(crate) intermediate_state: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
    /// Message keys received but not yet dispatched in the current step.
    pub(crate) pending_keys: Vec<String>,
    pub(crate) intermediate_handler: Option<IntermediateHandler>,
    pub(crate) completion_handler: Option<CompletionHandler>,
    pub(crate) deadline: Option<Instant>,
}

impl Job {
    pub fn new<I>(token: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            token: token.into(),
            request: None,
            pending: targets.into_iter().collect(),
            results: JobResults::new(),
            intermediate_state: BTreeMap::new(),
            pending_keys: Vec::new(),
            intermediate_handler: None,
            completion_handler: None,
            deadline: None,
        }
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn on_intermediate(mut self, handler: IntermediateHandler) -> Self {
        self.intermediate_handler = Some(handler);
        self
    }

    pub fn on_completion(mut self, handler: CompletionHandler) -> Self {
        self.completion_handler = Some(handler);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn pending(&self) -> &BTreeSet<String> {
        &self.pending
    }

    pub fn results(&self) -> &JobResults {
        &self.results
    }

    /// Every intermediate message received so far, per target and key.
    pub fn intermediate_state(&self) -> &BTreeMap<String, BTreeMap<String, Vec<Value>>> {
        &self.intermediate_state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_completed(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What `JobWarden::process` did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No outstanding job for the token, or not a correlatable packet.
    Dropped,
    /// Result from a target that was not pending; nothing changed.
    Ignored,
    /// Result stored, other targets still pending.
    Pending,
    /// Last result arrived; the job completed and was removed.
    Completed,
    /// Intermediate message stored (and dispatched if a handler matched).
    Intermediate,
}
