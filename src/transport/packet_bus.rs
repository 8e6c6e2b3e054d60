//! Packet-level view of a [`Transport`]: encodes outgoing packets with the
//! configured serializer chain and decodes incoming deliveries.

use super::{ChannelKind, Delivery, Subscription, Transport};
use crate::error::SerializationError;
use crate::packet::{Outbound, Packet, SerializerChain};

use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct PacketBus {
    transport: Arc<dyn Transport>,
    serializers: Arc<SerializerChain>,
}

impl PacketBus {
    pub fn new(transport: Arc<dyn Transport>, serializers: Arc<SerializerChain>) -> Self {
        Self {
            transport,
            serializers,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn declare(&self, channel: &str, kind: ChannelKind) -> Result<()> {
        self.transport.declare(channel, kind).await?;
        Ok(())
    }

    pub async fn send(&self, channel: &str, packet: &Packet) -> Result<()> {
        let body = self.serializers.dump(packet)?;
        self.transport.publish(channel, body).await?;
        tracing::trace!("Sent {} to {}", packet.kind(), channel);
        Ok(())
    }

    pub async fn publish(&self, outbound: &Outbound) -> Result<()> {
        self.send(&outbound.channel, &outbound.packet).await
    }

    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        Ok(self.transport.subscribe(channel).await?)
    }

    pub async fn fetch(&self, channel: &str) -> Result<Option<Delivery>> {
        Ok(self.transport.fetch(channel).await?)
    }

    pub fn decode(&self, delivery: &Delivery) -> Result<Packet, SerializationError> {
        self.serializers.load(&delivery.body)
    }
}
