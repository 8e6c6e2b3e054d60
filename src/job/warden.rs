use super::types::{CompletionHandler, IntermediateHandler, Job, ProcessOutcome};
use crate::error::JobError;
use crate::packet::{IntermediateMessage, JobResult, Packet, Request};

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Owns every outstanding [`Job`] of one process, keyed by request token.
///
/// Handlers run synchronously inside `process`; a failing handler surfaces as
/// [`JobError::Handler`] to the caller.
#[derive(Default)]
pub struct JobWarden {
    jobs: HashMap<String, Job>,
    job_timeout: Option<Duration>,
}

impl JobWarden {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs created through `new_job` are abandoned after `timeout`.
    pub fn with_job_timeout(timeout: Option<Duration>) -> Self {
        Self {
            jobs: HashMap::new(),
            job_timeout: timeout,
        }
    }

    pub fn new_job(
        &mut self,
        request: &Request,
        targets: Vec<String>,
        intermediate: Option<IntermediateHandler>,
        completion: Option<CompletionHandler>,
    ) -> Result<&Job, JobError> {
        let mut job = Job::new(request.token.clone(), targets).with_request(request.clone());
        job.intermediate_handler = intermediate;
        job.completion_handler = completion;
        if let Some(timeout) = self.job_timeout {
            job.deadline = Some(Instant::now() + timeout);
        }

        self.insert(job)
    }

    pub fn insert(&mut self, job: Job) -> Result<&Job, JobError> {
        if job.pending.is_empty() {
            return Err(JobError::NoTargets(job.token));
        }
        if self.jobs.contains_key(&job.token) {
            return Err(JobError::DuplicateToken(job.token));
        }

        tracing::debug!("Job {} waiting on {:?}", job.token, job.pending);

        let token = job.token.clone();
        Ok(self.jobs.entry(token).or_insert(job))
    }

    pub fn process(&mut self, packet: &Packet) -> Result<ProcessOutcome, JobError> {
        match packet {
            Packet::Result(result) => self.process_result(result),
            Packet::IntermediateMessage(message) => self.process_intermediate(message),
            other => {
                tracing::trace!("Job warden ignores {} packets", other.kind());
                Ok(ProcessOutcome::Dropped)
            }
        }
    }

    fn process_result(&mut self, result: &JobResult) -> Result<ProcessOutcome, JobError> {
        let Some(job) = self.jobs.get_mut(&result.token) else {
            tracing::trace!("Result for unknown job {} dropped", result.token);
            return Ok(ProcessOutcome::Dropped);
        };

        if !job.pending.remove(&result.from) {
            tracing::debug!(
                "Job {} got a result from {} which is not pending, ignoring",
                result.token,
                result.from
            );
            return Ok(ProcessOutcome::Ignored);
        }

        job.results.insert(result.from.clone(), result.results.clone());
        if !job.is_completed() {
            return Ok(ProcessOutcome::Pending);
        }

        let Some(mut job) = self.jobs.remove(&result.token) else {
            return Ok(ProcessOutcome::Dropped);
        };

        tracing::debug!("Job {} completed with {} results", job.token, job.results.len());

        if let Some(handler) = job.completion_handler.take() {
            let results = std::mem::take(&mut job.results);
            handler
                .call(results, &job)
                .map_err(|source| JobError::Handler {
                    token: job.token.clone(),
                    source,
                })?;
        }

        Ok(ProcessOutcome::Completed)
    }

    fn process_intermediate(
        &mut self,
        message: &IntermediateMessage,
    ) -> Result<ProcessOutcome, JobError> {
        let Some(job) = self.jobs.get_mut(&message.token) else {
            tracing::trace!("Intermediate message for unknown job {} dropped", message.token);
            return Ok(ProcessOutcome::Dropped);
        };

        job.intermediate_state
            .entry(message.from.clone())
            .or_default()
            .entry(message.messagekey.clone())
            .or_default()
            .push(message.message.clone());

        if !job.pending_keys.contains(&message.messagekey) {
            job.pending_keys.push(message.messagekey.clone());
        }
        if job.pending_keys.len() > 1 {
            let keys = std::mem::take(&mut job.pending_keys);
            return Err(JobError::PendingKeyOverflow {
                token: job.token.clone(),
                keys,
            });
        }

        let dispatched = match job.intermediate_handler.take() {
            Some(mut handler) => {
                let outcome =
                    handler.dispatch(&message.messagekey, &message.from, &message.message, job);
                job.intermediate_handler = Some(handler);
                outcome
            }
            None => Ok(false),
        };
        job.pending_keys.clear();

        match dispatched {
            Ok(true) => tracing::trace!(
                "Dispatched intermediate '{}' from {} for job {}",
                message.messagekey,
                message.from,
                message.token
            ),
            Ok(false) => {}
            Err(source) => {
                return Err(JobError::Handler {
                    token: message.token.clone(),
                    source,
                });
            }
        }

        Ok(ProcessOutcome::Intermediate)
    }

    /// Abandons every job whose deadline has passed. Abandoned jobs never
    /// complete.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let overdue: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.deadline.is_some_and(|deadline| now > deadline))
            .map(|(token, _)| token.clone())
            .collect();

        for token in &overdue {
            if let Some(job) = self.jobs.remove(token) {
                tracing::warn!(
                    "Abandoning job {} still waiting on {:?}",
                    token,
                    job.pending
                );
            }
        }

        overdue
    }

    /// Drops a job without completing it.
    pub fn abandon(&mut self, token: &str) -> Option<Job> {
        self.jobs.remove(token)
    }

    pub fn get(&self, token: &str) -> Option<&Job> {
        self.jobs.get(token)
    }

    pub(crate) fn get_mut(&mut self, token: &str) -> Option<&mut Job> {
        self.jobs.get_mut(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.jobs.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
