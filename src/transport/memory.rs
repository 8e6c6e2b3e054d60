//! In-Process Message Bus
//!
//! A [`Transport`] for running a whole cluster inside one process. Each
//! consumer is an unbounded tokio channel; routing happens under a single
//! `parking_lot` mutex so publish order is preserved per channel.

use super::{Acknowledger, ChannelKind, Delivery, Subscription, Transport};
use crate::error::TransportError;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct Consumer {
    id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Channel {
    kind: ChannelKind,
    consumers: Vec<Consumer>,
    next: usize,
    backlog: VecDeque<Vec<u8>>,
}

impl Channel {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            consumers: Vec::new(),
            next: 0,
            backlog: VecDeque::new(),
        }
    }
}

pub struct MemoryBus {
    channels: Mutex<HashMap<String, Channel>>,
    next_consumer: AtomicU64,
    me: Weak<MemoryBus>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            channels: Mutex::new(HashMap::new()),
            next_consumer: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    /// Messages parked in a queue's backlog.
    pub fn backlog_len(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|c| c.backlog.len())
            .unwrap_or(0)
    }

    /// Live consumers on `channel`.
    pub fn consumer_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|c| c.consumers.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }

    fn delivery(&self, channel: &str, body: Vec<u8>, consumer: Option<u64>) -> Delivery {
        Delivery {
            channel: channel.to_string(),
            body: body.clone(),
            acker: Box::new(BusAcker {
                bus: self.me.clone(),
                channel: channel.to_string(),
                body,
                consumer,
            }),
        }
    }

    fn route(
        &self,
        channels: &mut HashMap<String, Channel>,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let channel = channels
            .get_mut(name)
            .ok_or_else(|| TransportError::NoRoute(name.to_string()))?;

        match channel.kind {
            ChannelKind::Fanout => {
                channel.consumers.retain(|consumer| {
                    let delivery = self.delivery(name, body.clone(), Some(consumer.id));
                    consumer.sender.send(delivery).is_ok()
                });
                Ok(())
            }
            ChannelKind::Queue { durable } => {
                let mut body = body;

                while !channel.consumers.is_empty() {
                    let index = channel.next % channel.consumers.len();
                    let delivery = self.delivery(name, body, None);

                    match channel.consumers[index].sender.send(delivery) {
                        Ok(()) => {
                            channel.next = index + 1;
                            return Ok(());
                        }
                        Err(mpsc::error::SendError(returned)) => {
                            channel.consumers.remove(index);
                            body = returned.body;
                        }
                    }
                }

                if durable {
                    channel.backlog.push_back(body);
                    Ok(())
                } else {
                    Err(TransportError::NoRoute(name.to_string()))
                }
            }
        }
    }

    fn requeue(&self, name: &str, body: Vec<u8>, consumer: Option<u64>) {
        let mut channels = self.channels.lock();

        if let Some(id) = consumer {
            // Fanout copies go back to the subscriber that rejected them.
            let delivery = self.delivery(name, body, Some(id));
            let sent = channels
                .get(name)
                .and_then(|c| c.consumers.iter().find(|c| c.id == id))
                .map(|c| c.sender.send(delivery).is_ok())
                .unwrap_or(false);
            if !sent {
                tracing::debug!("Dropping requeued copy on {}: subscriber is gone", name);
            }
            return;
        }

        if let Err(e) = self.route(&mut channels, name, body) {
            tracing::warn!("Requeue on {} failed: {}", name, e);
        }
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn declare(&self, channel: &str, kind: ChannelKind) -> Result<(), TransportError> {
        let mut channels = self.channels.lock();
        match channels.get(channel) {
            Some(existing) if existing.kind != kind => {
                tracing::debug!(
                    "Channel {} already declared as {:?}, keeping it",
                    channel,
                    existing.kind
                );
            }
            Some(_) => {}
            None => {
                tracing::trace!("Declared {} as {:?}", channel, kind);
                channels.insert(channel.to_string(), Channel::new(kind));
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let mut channels = self.channels.lock();
        self.route(&mut channels, channel, body)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| TransportError::NoRoute(channel.to_string()))?;

        let backlog: Vec<Vec<u8>> = entry.backlog.drain(..).collect();
        entry.consumers.push(Consumer { id, sender });

        if !backlog.is_empty() {
            tracing::debug!("Flushing {} parked messages on {}", backlog.len(), channel);
            for body in backlog {
                self.route(&mut channels, channel, body)?;
            }
        }

        Ok(Subscription::new(channel, receiver))
    }

    async fn fetch(&self, channel: &str) -> Result<Option<Delivery>, TransportError> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| TransportError::NoRoute(channel.to_string()))?;

        Ok(entry
            .backlog
            .pop_front()
            .map(|body| self.delivery(channel, body, None)))
    }
}

struct BusAcker {
    bus: Weak<MemoryBus>,
    channel: String,
    body: Vec<u8>,
    consumer: Option<u64>,
}

impl Acknowledger for BusAcker {
    fn ack(self: Box<Self>) {
        tracing::trace!("Acked message on {}", self.channel);
    }

    fn reject(self: Box<Self>, requeue: bool) {
        if !requeue {
            tracing::debug!("Rejected message on {} without requeue", self.channel);
            return;
        }

        match self.bus.upgrade() {
            Some(bus) => bus.requeue(&self.channel, self.body, self.consumer),
            None => tracing::debug!("Bus is gone, dropping requeue on {}", self.channel),
        }
    }
}
