//! Message Transport
//!
//! The broker seam between mappers and agents. Channels are either fanout
//! (every subscriber gets a copy) or queues (one consumer per message, round
//! robin). Durable queues keep a backlog while nobody consumes them and can be
//! drained with `fetch`.
//!
//! Every [`Delivery`] carries an [`Acknowledger`] that is consumed on use, so
//! a message is settled (acked or rejected) at most once.

pub mod memory;
pub mod packet_bus;

pub use memory::MemoryBus;
pub use packet_bus::PacketBus;

use crate::error::TransportError;

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Fanout,
    Queue { durable: bool },
}

/// Settles one delivery.
pub trait Acknowledger: Send {
    fn ack(self: Box<Self>);
    fn reject(self: Box<Self>, requeue: bool);
}

/// Settles nothing. For deliveries that never came from a broker.
pub struct NoopAcker;

impl Acknowledger for NoopAcker {
    fn ack(self: Box<Self>) {}
    fn reject(self: Box<Self>, _requeue: bool) {}
}

pub struct Delivery {
    pub channel: String,
    pub body: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn ack(self) {
        self.acker.ack();
    }

    pub fn reject(self, requeue: bool) {
        self.acker.reject(requeue);
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("channel", &self.channel)
            .field("bytes", &self.body.len())
            .finish()
    }
}

/// A live consumer. Dropping it cancels the subscription.
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates `channel` if missing. Redeclaring is a no-op.
    async fn declare(&self, channel: &str, kind: ChannelKind) -> Result<(), TransportError>;

    async fn publish(&self, channel: &str, body: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;

    /// Pops one message from a queue's backlog, if any.
    async fn fetch(&self, channel: &str) -> Result<Option<Delivery>, TransportError>;
}
