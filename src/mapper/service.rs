use super::role::{Election, HeartbeatPromotion, MasterCheck, REPLY_WINDOW, Role};
use crate::cluster::{ClusterState, EvictionReason, MemoryStore, SledStore, StateStore};
use crate::config::Config;
use crate::error::DispatchError;
use crate::job::{CompletionHandler, IntermediateHandler, JobResults, JobWarden};
use crate::packet::{
    self, DeleteAgent, MapperStateRequest, Outbound, Packet, Ping, Request, SerializerChain,
    new_token,
};
use crate::reaper::{Reaper, TimeoutCallback};
use crate::routing::RoutingPolicy;
use crate::security::{PolicyDecision, SecurityProvider};
use crate::transport::{ChannelKind, Delivery, PacketBus, Subscription, Transport};

use anyhow::{Result, anyhow};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the event loop reacts to besides its own timers.
pub(super) enum Event {
    Delivery(Delivery),
    Publish(Outbound),
    MasterDeadline(String),
    RoundDeadline(String),
    Evicted(String, EvictionReason),
    Call(LocalCall),
}

/// An in-process request waiting to be routed by the event loop.
pub(super) struct LocalCall {
    pub request: Request,
    pub intermediate: Option<IntermediateHandler>,
    pub opened: oneshot::Sender<Result<oneshot::Receiver<JobResults>>>,
}

/// An open liveness round: agents that still owe a pong for `token`.
pub(super) struct LivenessRound {
    pub token: String,
    pub awaiting: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapperStatus {
    pub identity: String,
    pub role: Role,
    pub agents: usize,
    pub jobs: usize,
}

/// Routes requests to agents and aggregates their results.
///
/// Every mapper starts as a slave mirroring the master's agent table. A slave
/// that loses the master promotes itself and takes over the master channels.
pub struct Mapper {
    pub(super) config: Config,
    pub(super) bus: PacketBus,
    pub(super) cluster: Arc<ClusterState>,
    pub(super) routing: RoutingPolicy,
    pub(super) reaper: Arc<Reaper>,
    pub(super) jobs: Mutex<JobWarden>,
    pub(super) security: Arc<dyn SecurityProvider>,
    pub(super) election: Box<dyn Election>,
    pub(super) role: RwLock<Role>,
    pub(super) master_check: Mutex<Option<String>>,
    pub(super) round: Mutex<Option<LivenessRound>>,
    pub(super) events: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    slave_feed: Mutex<Option<JoinHandle<()>>>,
    feeds: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Mapper {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityProvider>,
    ) -> Result<Arc<Self>> {
        Self::with_election(config, transport, security, Box::new(HeartbeatPromotion))
    }

    pub fn with_election(
        config: Config,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityProvider>,
        election: Box<dyn Election>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let serializers = Arc::new(SerializerChain::from_config(&config)?);

        let store: Box<dyn StateStore> = if config.persist {
            Box::new(SledStore::open(&config.persist_path)?)
        } else {
            Box::new(MemoryStore::new())
        };
        let cluster = ClusterState::new(store, config.agent_timeout);
        let reaper = Reaper::new(config.reaper_interval);
        let (events, events_rx) = mpsc::unbounded_channel();

        let hook_reaper = reaper.clone();
        let hook_events = events.clone();
        cluster.on_eviction(Arc::new(move |identity, reason| {
            hook_reaper.unregister(identity);
            let _ = hook_events.send(Event::Evicted(identity.to_string(), reason));
        }));

        Ok(Arc::new(Self {
            bus: PacketBus::new(transport, serializers),
            routing: RoutingPolicy::new(cluster.clone()),
            cluster,
            reaper,
            jobs: Mutex::new(JobWarden::with_job_timeout(config.job_timeout)),
            security,
            election,
            role: RwLock::new(Role::Slave),
            master_check: Mutex::new(None),
            round: Mutex::new(None),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            slave_feed: Mutex::new(None),
            feeds: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn is_master(&self) -> bool {
        self.role().is_master()
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    pub fn outstanding_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn status(&self) -> MapperStatus {
        MapperStatus {
            identity: self.identity().to_string(),
            role: self.role(),
            agents: self.cluster.len(),
            jobs: self.outstanding_jobs(),
        }
    }

    /// Declares the channels, joins as a slave and spawns the event loop.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let identity = self.identity().to_string();
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow!("mapper {} already started", identity))?;

        self.declare_channels().await?;

        let inbox = self.bus.subscribe(&identity).await?;
        self.feed(inbox);

        let slave = self.bus.subscribe(packet::MAPPER_SLAVE).await?;
        let slave_feed = self.spawn_feed(slave);
        *self.slave_feed.lock() = Some(slave_feed);

        self.request_state(packet::MAPPER_MASTER).await;

        if let Some(addr) = self.config.admin_bind {
            let admin = self.clone();
            tokio::spawn(async move {
                if let Err(e) = super::admin::serve(admin, addr).await {
                    tracing::error!("Admin server on {} failed: {}", addr, e);
                }
            });
        }

        tracing::info!("Mapper {} started as {}", identity, self.role());

        let mapper = self.clone();
        Ok(tokio::spawn(async move {
            mapper.run(events_rx).await;
        }))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn declare_channels(&self) -> Result<()> {
        let queue = ChannelKind::Queue { durable: false };

        self.bus.declare(self.identity(), queue).await?;
        self.bus.declare(packet::HEARTBEAT, ChannelKind::Fanout).await?;
        self.bus
            .declare(packet::REGISTRATION, ChannelKind::Fanout)
            .await?;
        self.bus.declare(packet::REQUEST, queue).await?;
        self.bus.declare(packet::MAPPER_MASTER, queue).await?;
        self.bus.declare(packet::MAPPER_MASTER_HEARTBEAT, queue).await?;
        self.bus.declare(packet::MAPPER_SLAVE, ChannelKind::Fanout).await?;
        self.bus
            .declare(packet::MAPPER_OFFLINE, ChannelKind::Queue { durable: true })
            .await?;

        Ok(())
    }

    fn spawn_feed(&self, mut subscription: Subscription) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(delivery) = subscription.next().await {
                if events.send(Event::Delivery(delivery)).is_err() {
                    break;
                }
            }
            tracing::debug!("Feed for {} closed", subscription.channel());
        })
    }

    fn feed(&self, subscription: Subscription) {
        let handle = self.spawn_feed(subscription);
        self.feeds.lock().push(handle);
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut master_check = tokio::time::interval(self.config.master_heartbeat_interval);
        let mut liveness = tokio::time::interval(self.config.ping_interval);
        liveness.tick().await;
        let mut sweep = tokio::time::interval(self.reaper.interval());
        let mut redelivery = tokio::time::interval(self.config.offline_redelivery_frequency);
        redelivery.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                _ = master_check.tick() => self.check_master().await,

                _ = liveness.tick() => self.liveness_round().await,

                _ = sweep.tick() => self.sweep(),

                _ = redelivery.tick() => self.redeliver_offline().await,

                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        let slave_feed = self.slave_feed.lock().take();
        if let Some(feed) = slave_feed {
            feed.abort();
        }
        for feed in self.feeds.lock().drain(..) {
            feed.abort();
        }

        tracing::info!("Mapper {} stopped", self.identity());
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::Delivery(delivery) => self.handle_delivery(delivery).await,
            Event::Publish(outbound) => {
                if let Err(e) = self.bus.publish(&outbound).await {
                    tracing::warn!(
                        "Failed to publish {} to {}: {}",
                        outbound.packet.kind(),
                        outbound.channel,
                        e
                    );
                    self.on_undeliverable(outbound, e);
                }
            }
            Event::MasterDeadline(token) => self.on_master_deadline(token).await,
            Event::RoundDeadline(token) => self.close_round(&token),
            Event::Evicted(identity, reason) => self.on_evicted(&identity, reason),
            Event::Call(call) => {
                let LocalCall {
                    request,
                    intermediate,
                    opened,
                } = call;
                let _ = opened.send(self.open_local(request, intermediate));
            }
        }
    }

    pub(super) fn queue(&self, outbound: Outbound) {
        if self.events.send(Event::Publish(outbound)).is_err() {
            tracing::warn!("Event loop of mapper {} is gone", self.identity());
        }
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    pub(super) fn timeout_callback(&self) -> TimeoutCallback {
        let cluster = self.cluster.clone();
        Arc::new(move |identity| {
            cluster.evict(identity, EvictionReason::Timeout);
            true
        })
    }

    async fn request_state(&self, channel: &str) {
        let request = Packet::MapperStateRequest(MapperStateRequest {
            from: self.identity().to_string(),
        });
        if let Err(e) = self.bus.send(channel, &request).await {
            tracing::debug!("No state from {} for {}: {}", channel, self.identity(), e);
        }
    }

    // ============================================================
    // Master election
    // ============================================================

    async fn check_master(&self) {
        if self.is_master() {
            return;
        }

        let token = new_token();
        let ping = Packet::Ping(Ping {
            identity: self.identity().to_string(),
            status: json!(self.cluster.len()),
            from: self.identity().to_string(),
            token: Some(token.clone()),
        });

        match self.bus.send(packet::MAPPER_MASTER_HEARTBEAT, &ping).await {
            Ok(()) => {
                *self.master_check.lock() = Some(token.clone());
                let window = self
                    .election
                    .pong_window(self.config.master_heartbeat_interval);
                self.schedule(window, Event::MasterDeadline(token));
            }
            Err(e) => {
                tracing::debug!("Master unreachable from {}: {}", self.identity(), e);
                if self.election.should_promote(MasterCheck::Unreachable) {
                    self.promote().await;
                }
            }
        }
    }

    async fn on_master_deadline(&self, token: String) {
        let silent = {
            let mut check = self.master_check.lock();
            if check.as_deref() == Some(token.as_str()) {
                *check = None;
                true
            } else {
                false
            }
        };

        if silent && !self.is_master() && self.election.should_promote(MasterCheck::Silent) {
            tracing::warn!("Master did not answer {} in time", self.identity());
            self.promote().await;
        }
    }

    /// Whether `token` answers this slave's outstanding master check.
    pub(super) fn master_answered(&self, token: &str) -> bool {
        let mut check = self.master_check.lock();
        if check.as_deref() == Some(token) {
            *check = None;
            true
        } else {
            false
        }
    }

    /// Takes over the master channels. Idempotent.
    pub async fn promote(&self) {
        {
            let mut role = self.role.write();
            if role.is_master() {
                return;
            }
            *role = Role::Master;
        }
        *self.master_check.lock() = None;

        let slave_feed = self.slave_feed.lock().take();
        if let Some(feed) = slave_feed {
            feed.abort();
        }

        for channel in [
            packet::HEARTBEAT,
            packet::REGISTRATION,
            packet::REQUEST,
            packet::MAPPER_MASTER,
            packet::MAPPER_MASTER_HEARTBEAT,
        ] {
            match self.bus.subscribe(channel).await {
                Ok(subscription) => self.feed(subscription),
                Err(e) => tracing::error!("Master {} cannot consume {}: {}", self.identity(), channel, e),
            }
        }

        // Mirrored records only carry the time they were replicated.
        match self.cluster.touch_all(Instant::now()) {
            Ok(touched) => tracing::debug!("Refreshed {} inherited agents", touched),
            Err(e) => tracing::error!("Failed to refresh inherited agents: {}", e),
        }
        for identity in self.cluster.identities() {
            self.reaper
                .register(&identity, self.cluster.agent_timeout(), self.timeout_callback());
        }

        self.request_state(packet::MAPPER_SLAVE).await;

        tracing::info!(
            "Mapper {} promoted to master with {} agents",
            self.identity(),
            self.cluster.len()
        );
    }

    // ============================================================
    // Liveness
    // ============================================================

    async fn liveness_round(&self) {
        if !self.is_master() {
            return;
        }

        let agents = self.cluster.identities();
        if agents.is_empty() {
            return;
        }

        let token = new_token();
        *self.round.lock() = Some(LivenessRound {
            token: token.clone(),
            awaiting: agents.iter().cloned().collect(),
        });

        for agent in &agents {
            let ping = Packet::Ping(Ping {
                identity: agent.clone(),
                status: json!(null),
                from: self.identity().to_string(),
                token: Some(token.clone()),
            });
            if let Err(e) = self.bus.send(agent, &ping).await {
                tracing::debug!("Liveness ping to {} failed: {}", agent, e);
            }
        }

        tracing::debug!("Liveness round {} pinged {} agents", token, agents.len());
        self.schedule(
            self.config.ping_interval.mul_f64(REPLY_WINDOW),
            Event::RoundDeadline(token),
        );
    }

    fn close_round(&self, token: &str) {
        let round = {
            let mut current = self.round.lock();
            match current.as_ref() {
                Some(round) if round.token == token => current.take(),
                _ => None,
            }
        };

        let Some(round) = round else {
            return;
        };

        for identity in round.awaiting {
            self.cluster.evict(&identity, EvictionReason::MissedPing);
        }
    }

    fn on_evicted(&self, identity: &str, reason: EvictionReason) {
        if let Some(round) = self.round.lock().as_mut() {
            round.awaiting.remove(identity);
        }

        tracing::warn!("Agent {} evicted ({})", identity, reason);

        if self.is_master() && reason != EvictionReason::Remote {
            self.queue(Outbound::new(
                packet::MAPPER_SLAVE,
                Packet::DeleteAgent(DeleteAgent {
                    identity: identity.to_string(),
                }),
            ));
        }
    }

    fn sweep(&self) {
        if self.is_master() {
            self.reaper.sweep();
        }

        let expired = self.jobs.lock().expire(Instant::now());
        if !expired.is_empty() {
            tracing::debug!("Mapper {} expired {} jobs", self.identity(), expired.len());
        }
    }

    // ============================================================
    // Offline queue
    // ============================================================

    async fn redeliver_offline(&self) {
        if !self.config.offline_queue || !self.is_master() {
            return;
        }

        // Drain first so requests parked again are not fetched twice.
        let mut parked = Vec::new();
        loop {
            match self.bus.fetch(packet::MAPPER_OFFLINE).await {
                Ok(Some(delivery)) => parked.push(delivery),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Cannot drain {}: {}", packet::MAPPER_OFFLINE, e);
                    break;
                }
            }
        }

        if parked.is_empty() {
            return;
        }
        tracing::debug!("Redelivering {} parked requests", parked.len());

        for delivery in parked {
            match self.bus.decode(&delivery) {
                Ok(Packet::Request(request)) => self.on_request(request, delivery, true).await,
                Ok(other) => {
                    tracing::warn!("Dropping parked {} packet", other.kind());
                    delivery.ack();
                }
                Err(e) => {
                    tracing::warn!("Dropping undecodable parked request: {}", e);
                    delivery.reject(false);
                }
            }
        }
    }

    // ============================================================
    // In-process callers
    // ============================================================

    /// Routes `request` on behalf of this process. The receiver yields the
    /// results keyed by agent once every target has replied.
    ///
    /// Routing and job bookkeeping run on the event loop, so the mapper must
    /// be started.
    pub async fn request(
        &self,
        mut request: Request,
        intermediate: Option<IntermediateHandler>,
    ) -> Result<oneshot::Receiver<JobResults>> {
        if self.events_rx.lock().is_some() {
            return Err(anyhow!("mapper {} is not running", self.identity()));
        }

        request.from = self.identity().to_string();
        request.reply_to = Some(self.identity().to_string());

        let (opened, opened_rx) = oneshot::channel();
        self.events
            .send(Event::Call(LocalCall {
                request,
                intermediate,
                opened,
            }))
            .map_err(|_| anyhow!("mapper {} has stopped", self.identity()))?;

        opened_rx
            .await
            .map_err(|_| anyhow!("mapper {} has stopped", self.identity()))?
    }

    fn open_local(
        &self,
        request: Request,
        intermediate: Option<IntermediateHandler>,
    ) -> Result<oneshot::Receiver<JobResults>> {
        if let PolicyDecision::Deny(reason) = self.security.authorize_request(&request) {
            return Err(anyhow!("request {} denied: {}", request.token, reason));
        }

        let targets = self.routing.targets_for(&request);
        if targets.is_empty() {
            return Err(DispatchError::NoTargets(request.service_path()).into());
        }

        let (tx, rx) = oneshot::channel();
        let completion = CompletionHandler::results(move |results| {
            let _ = tx.send(results);
            Ok(())
        });
        self.jobs
            .lock()
            .new_job(&request, targets.clone(), intermediate, Some(completion))
            .map(|_| ())?;

        self.forward(&request, &targets, true);
        Ok(rx)
    }
}
