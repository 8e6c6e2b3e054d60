use super::proxy::{MapperProxy, ResponseHandle};
use crate::config::Config;
use crate::dispatcher::{ActorRegistry, Dispatcher};
use crate::error::ProtocolError;
use crate::packet::{
    self, Outbound, Packet, Ping, Pong, Register, Request, SerializerChain, UnRegister,
};
use crate::transport::{Acknowledger, ChannelKind, Delivery, PacketBus, Subscription, Transport};

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Produces the load indicator sent with every heartbeat.
pub type StatusProvider = Arc<dyn Fn() -> Value + Send + Sync>;

/// One-minute load average of the host.
pub fn system_load() -> StatusProvider {
    Arc::new(|| {
        let load = sysinfo::System::load_average();
        json!((load.one * 100.0).round() / 100.0)
    })
}

/// Requests run without a worker pool: one at a time, polled by the event
/// loop next to its other arms so heartbeats and replies keep flowing.
#[derive(Default)]
struct InlineQueue {
    running: Option<BoxFuture<'static, Option<Outbound>>>,
    waiting: VecDeque<(Request, Box<dyn Acknowledger>)>,
}

impl InlineQueue {
    fn push(&mut self, dispatcher: &Arc<Dispatcher>, request: Request, acker: Box<dyn Acknowledger>) {
        self.waiting.push_back((request, acker));
        self.advance(dispatcher);
    }

    fn advance(&mut self, dispatcher: &Arc<Dispatcher>) {
        if self.running.is_some() {
            return;
        }
        if let Some((request, acker)) = self.waiting.pop_front() {
            let dispatcher = dispatcher.clone();
            self.running = Some(Box::pin(async move { dispatcher.dispatch(request, acker).await }));
        }
    }

    /// Resolves when the running dispatch finishes; never resolves while idle.
    async fn finished(&mut self) -> Option<Outbound> {
        let reply = match self.running.as_mut() {
            Some(running) => running.await,
            None => std::future::pending().await,
        };
        self.running = None;
        reply
    }

    /// Drops the running dispatch and hands every waiting request back to
    /// the broker.
    fn abandon(&mut self) {
        self.running = None;
        for (request, acker) in self.waiting.drain(..) {
            tracing::debug!("Requeueing {} on shutdown", request.token);
            acker.reject(true);
        }
    }
}

/// A worker process: advertises its actors to the mapper, heartbeats and
/// executes the requests routed to it.
pub struct Agent {
    config: Config,
    bus: PacketBus,
    dispatcher: Arc<Dispatcher>,
    proxy: Arc<MapperProxy>,
    status: StatusProvider,
    pool: Option<Arc<Semaphore>>,
    outbox: mpsc::UnboundedSender<Outbound>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        registry: Arc<ActorRegistry>,
        status: Option<StatusProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let serializers = Arc::new(SerializerChain::from_config(&config)?);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        let pool = match config.worker_pool_size {
            0 => None,
            size => Some(Arc::new(Semaphore::new(size))),
        };

        Ok(Arc::new(Self {
            dispatcher: Arc::new(Dispatcher::new(
                config.identity.clone(),
                registry,
                outbox.clone(),
            )),
            bus: PacketBus::new(transport, serializers),
            proxy: MapperProxy::new(),
            status: status.unwrap_or_else(system_load),
            pool,
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn services(&self) -> Vec<String> {
        self.dispatcher.registry().services()
    }

    pub fn proxy(&self) -> &Arc<MapperProxy> {
        &self.proxy
    }

    /// Declares channels, registers with the mapper and spawns the event loop.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let identity = self.identity().to_string();
        let outbox_rx = self
            .outbox_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent {} already started", identity))?;

        self.bus
            .declare(&identity, ChannelKind::Queue { durable: false })
            .await?;
        self.bus.declare(packet::HEARTBEAT, ChannelKind::Fanout).await?;
        self.bus
            .declare(packet::REGISTRATION, ChannelKind::Fanout)
            .await?;
        self.bus
            .declare(packet::REQUEST, ChannelKind::Queue { durable: false })
            .await?;

        let inbox = self.bus.subscribe(&identity).await?;

        self.advertise().await;

        tracing::info!(
            "Agent {} started with {} services (pool: {})",
            identity,
            self.services().len(),
            self.pool
                .as_ref()
                .map(|p| p.available_permits().to_string())
                .unwrap_or_else(|| "inline".to_string())
        );

        let agent = self.clone();
        Ok(tokio::spawn(async move {
            agent.run(inbox, outbox_rx).await;
        }))
    }

    /// Stops the event loop; the agent unregisters on the way out.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(
        self: Arc<Self>,
        mut inbox: Subscription,
        mut outbox_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut inline = InlineQueue::default();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                _ = heartbeat.tick() => self.heartbeat().await,

                Some(outbound) = outbox_rx.recv() => {
                    if let Err(e) = self.bus.publish(&outbound).await {
                        tracing::warn!(
                            "Failed to publish {} to {}: {}",
                            outbound.packet.kind(),
                            outbound.channel,
                            e
                        );
                    }
                }

                reply = inline.finished() => {
                    if let Some(reply) = reply {
                        self.queue(reply);
                    }
                    inline.advance(&self.dispatcher);
                }

                delivery = inbox.next() => match delivery {
                    Some(delivery) => self.handle_delivery(delivery, &mut inline),
                    None => {
                        tracing::warn!("Inbox of agent {} closed", self.identity());
                        break;
                    }
                },
            }
        }

        inline.abandon();

        let goodbye = Packet::UnRegister(UnRegister {
            identity: self.identity().to_string(),
        });
        if let Err(e) = self.bus.send(packet::REGISTRATION, &goodbye).await {
            tracing::warn!("Agent {} could not unregister: {}", self.identity(), e);
        }

        tracing::info!("Agent {} stopped", self.identity());
    }

    fn register_packet(&self) -> Packet {
        Packet::Register(Register {
            identity: self.identity().to_string(),
            services: self.services(),
            status: (self.status)(),
            tags: self.config.tags.clone(),
        })
    }

    async fn advertise(&self) {
        if let Err(e) = self.bus.send(packet::REGISTRATION, &self.register_packet()).await {
            tracing::warn!("Agent {} failed to register: {}", self.identity(), e);
        }
    }

    async fn heartbeat(&self) {
        let ping = Packet::Ping(Ping {
            identity: self.identity().to_string(),
            status: (self.status)(),
            from: self.identity().to_string(),
            token: None,
        });

        if let Err(e) = self.bus.send(packet::HEARTBEAT, &ping).await {
            tracing::warn!("Agent {} heartbeat failed: {}", self.identity(), e);
        }
    }

    fn handle_delivery(self: &Arc<Self>, delivery: Delivery, inline: &mut InlineQueue) {
        let packet = match self.bus.decode(&delivery) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Agent {} dropped undecodable packet: {}", self.identity(), e);
                delivery.reject(false);
                return;
            }
        };

        match packet {
            Packet::Request(request) => self.execute(request, delivery, inline),

            Packet::Ping(ping) => {
                delivery.ack();
                if let Some(token) = ping.token {
                    let pong = Packet::Pong(Pong {
                        token,
                        from: Some(self.identity().to_string()),
                    });
                    self.queue(Outbound::new(ping.from, pong));
                }
            }

            Packet::Advertise(advertise) => {
                delivery.ack();
                tracing::info!(
                    "Agent {} asked to advertise again ({})",
                    self.identity(),
                    advertise.token
                );
                self.queue(Outbound::new(packet::REGISTRATION, self.register_packet()));
            }

            reply @ (Packet::Result(_) | Packet::IntermediateMessage(_)) => {
                delivery.ack();
                self.proxy.process(reply);
            }

            other => {
                let channel = delivery.channel.clone();
                delivery.ack();
                tracing::warn!(
                    "{}",
                    ProtocolError::UnexpectedPacket {
                        kind: other.kind(),
                        channel,
                    }
                );
            }
        }
    }

    /// Queues a request for inline execution, or hands it to the worker pool
    /// when one is configured. Replies always go through the outbox so the
    /// event loop publishes them.
    fn execute(self: &Arc<Self>, request: Request, delivery: Delivery, inline: &mut InlineQueue) {
        let Delivery { acker, .. } = delivery;

        let Some(pool) = self.pool.clone() else {
            inline.push(&self.dispatcher, request, acker);
            return;
        };

        let agent = self.clone();
        tokio::spawn(async move {
            let permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!("Worker pool closed: {}", e);
                    acker.reject(true);
                    return;
                }
            };

            if let Some(reply) = agent.dispatcher.dispatch(request, acker).await {
                agent.queue(reply);
            }
            drop(permit);
        });
    }

    fn queue(&self, outbound: Outbound) {
        if self.outbox.send(outbound).is_err() {
            tracing::warn!("Outbox of agent {} is closed", self.identity());
        }
    }

    /// Sends `request` to the mapper and tracks its aggregated result.
    pub async fn request(&self, mut request: Request) -> Result<ResponseHandle> {
        request.from = self.identity().to_string();
        request.reply_to = Some(self.identity().to_string());

        let handle = self.proxy.track(&request.token);
        if let Err(e) = self.bus.send(packet::REQUEST, &Packet::Request(request)).await {
            self.proxy.forget(handle.token());
            return Err(e);
        }

        Ok(handle)
    }

    /// Sends `request` to the mapper without expecting a reply.
    pub async fn push(&self, mut request: Request) -> Result<()> {
        request.from = self.identity().to_string();
        request.reply_to = None;
        self.bus.send(packet::REQUEST, &Packet::Request(request)).await
    }
}
