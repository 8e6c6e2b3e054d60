//! Mapper Proxy
//!
//! Correlates requests an agent sends through the mapper with the single
//! aggregated `Result` the mapper sends back, forwarding intermediate
//! messages to the caller as they arrive.

use crate::packet::{IntermediateMessage, Packet};

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct PendingReply {
    result: oneshot::Sender<Value>,
    intermediates: mpsc::UnboundedSender<IntermediateMessage>,
}

#[derive(Default)]
pub struct MapperProxy {
    pending: DashMap<String, PendingReply>,
}

impl MapperProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts waiting for the reply to `token`.
    pub fn track(self: &Arc<Self>, token: &str) -> ResponseHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let (intermediate_tx, intermediate_rx) = mpsc::unbounded_channel();

        self.pending.insert(
            token.to_string(),
            PendingReply {
                result: result_tx,
                intermediates: intermediate_tx,
            },
        );

        ResponseHandle {
            token: token.to_string(),
            result: Some(result_rx),
            intermediates: intermediate_rx,
            proxy: self.clone(),
        }
    }

    /// Routes a reply packet to its waiting caller. Returns false when no
    /// caller is waiting for it.
    pub fn process(&self, packet: Packet) -> bool {
        match packet {
            Packet::Result(result) => match self.pending.remove(&result.token) {
                Some((_, pending)) => {
                    if pending.result.send(result.results).is_err() {
                        tracing::debug!("Caller for {} stopped waiting", result.token);
                    }
                    true
                }
                None => {
                    tracing::debug!("No caller waiting for result {}", result.token);
                    false
                }
            },
            Packet::IntermediateMessage(message) => {
                let token = message.token.clone();
                match self.pending.get(&token) {
                    Some(pending) => {
                        if pending.intermediates.send(message).is_err() {
                            tracing::debug!("Caller for {} no longer reads intermediates", token);
                        }
                        true
                    }
                    None => false,
                }
            }
            other => {
                tracing::trace!("Mapper proxy ignores {} packets", other.kind());
                false
            }
        }
    }

    pub fn forget(&self, token: &str) -> bool {
        self.pending.remove(token).is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// The caller's side of one tracked request. Dropping it stops tracking the
/// request.
pub struct ResponseHandle {
    token: String,
    result: Option<oneshot::Receiver<Value>>,
    intermediates: mpsc::UnboundedReceiver<IntermediateMessage>,
    proxy: Arc<MapperProxy>,
}

impl ResponseHandle {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Next intermediate message, or `None` once the request has completed.
    pub async fn next_intermediate(&mut self) -> Option<IntermediateMessage> {
        self.intermediates.recv().await
    }

    pub fn try_next_intermediate(&mut self) -> Option<IntermediateMessage> {
        self.intermediates.try_recv().ok()
    }

    /// Stops buffering intermediate messages for a caller that only wants
    /// the result.
    pub fn ignore_intermediates(&mut self) {
        self.intermediates.close();
    }

    /// Waits for the aggregated result.
    pub async fn result(mut self) -> Result<Value> {
        let receiver = self.take_receiver()?;
        receiver
            .await
            .map_err(|_| anyhow!("request {} was dropped before completing", self.token))
    }

    /// Waits at most `timeout` for the aggregated result. A request that
    /// times out is forgotten; a late reply is dropped.
    pub async fn result_within(mut self, timeout: Duration) -> Result<Value> {
        let receiver = self.take_receiver()?;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(anyhow!("request {} was dropped before completing", self.token)),
            Err(_) => Err(anyhow!("request {} timed out after {:?}", self.token, timeout)),
        }
    }

    fn take_receiver(&mut self) -> Result<oneshot::Receiver<Value>> {
        self.result
            .take()
            .ok_or_else(|| anyhow!("result of request {} was already taken", self.token))
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.proxy.forget(&self.token) {
            tracing::debug!("Stopped tracking request {}", self.token);
        }
    }
}
