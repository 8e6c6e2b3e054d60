use super::service::{Event, Mapper};
use crate::cluster::{AgentRecord, EvictionReason, HeartbeatOutcome};
use crate::dispatcher::ErrorDescriptor;
use crate::error::{DispatchError, ProtocolError};
use crate::job::{CompletionHandler, IntermediateCallback, IntermediateHandler};
use crate::packet::{
    self, AddAgent, Advertise, DeleteAgent, IntermediateMessage, JobResult, MapperState,
    MapperStateRequest, Outbound, Packet, Ping, Pong, Register, Request, UnRegister, new_token,
};
use crate::security::PolicyDecision;
use crate::transport::Delivery;

use anyhow::anyhow;
use serde_json::Value;

impl Mapper {
    pub(super) async fn handle_delivery(&self, delivery: Delivery) {
        let packet = match self.bus.decode(&delivery) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Mapper {} dropped undecodable packet: {}", self.identity(), e);
                delivery.reject(false);
                return;
            }
        };

        tracing::trace!("Mapper {} got {} on {}", self.identity(), packet.kind(), delivery.channel);

        match packet {
            Packet::Request(request) => self.on_request(request, delivery, false).await,
            other => {
                let channel = delivery.channel.clone();
                delivery.ack();
                self.handle_packet(&channel, other);
            }
        }
    }

    fn handle_packet(&self, channel: &str, packet: Packet) {
        match packet {
            Packet::Register(register) => self.on_register(register),
            Packet::UnRegister(unregister) => self.on_unregister(unregister),
            Packet::Ping(ping) if channel == packet::MAPPER_MASTER_HEARTBEAT => {
                self.on_master_ping(ping)
            }
            Packet::Ping(ping) => self.on_heartbeat(ping),
            Packet::Pong(pong) => self.on_pong(pong),
            reply @ (Packet::Result(_) | Packet::IntermediateMessage(_)) => self.on_reply(reply),
            Packet::MapperStateRequest(request) => self.on_state_request(request),
            Packet::MapperState(state) => self.on_state(state),
            Packet::AddAgent(add) => self.on_add_agent(add),
            Packet::DeleteAgent(delete) => self.on_delete_agent(delete),
            other => tracing::warn!(
                "{}",
                ProtocolError::UnexpectedPacket {
                    kind: other.kind(),
                    channel: channel.to_string(),
                }
            ),
        }
    }

    // ============================================================
    // Membership
    // ============================================================

    fn on_register(&self, register: Register) {
        if let PolicyDecision::Deny(reason) = self.security.authorize_registration(&register) {
            tracing::warn!("Registration of {} denied: {}", register.identity, reason);
            return;
        }

        let Register {
            identity,
            services,
            status,
            tags,
        } = register;
        let record = AgentRecord::new(services, tags, status);

        match self.cluster.upsert(&identity, record.clone()) {
            Ok(previous) => tracing::info!(
                "Agent {} {} with {} services",
                identity,
                if previous.is_some() { "re-registered" } else { "registered" },
                record.services.len()
            ),
            Err(e) => {
                tracing::error!("Failed to store agent {}: {}", identity, e);
                return;
            }
        }

        self.reaper
            .update(&identity, self.cluster.agent_timeout(), self.timeout_callback());

        self.queue(Outbound::new(
            packet::MAPPER_SLAVE,
            Packet::AddAgent(AddAgent { identity, record }),
        ));
    }

    fn on_unregister(&self, unregister: UnRegister) {
        if self.cluster.unregister(&unregister.identity) {
            tracing::info!("Agent {} unregistered", unregister.identity);
        }
    }

    fn on_heartbeat(&self, ping: Ping) {
        match self.cluster.heartbeat(&ping.identity, ping.status) {
            Ok(HeartbeatOutcome::Refreshed) => {
                self.reaper.update(
                    &ping.identity,
                    self.cluster.agent_timeout(),
                    self.timeout_callback(),
                );
            }
            Ok(HeartbeatOutcome::UnknownAgent) => {
                tracing::debug!("Heartbeat from unknown agent {}, asking it to advertise", ping.identity);
                self.queue(Outbound::new(
                    ping.identity,
                    Packet::Advertise(Advertise { token: new_token() }),
                ));
            }
            Err(e) => tracing::error!("Failed to refresh agent {}: {}", ping.identity, e),
        }
    }

    fn on_pong(&self, pong: Pong) {
        if self.master_answered(&pong.token) {
            tracing::trace!("Master answered {}", self.identity());
            return;
        }

        let mut round = self.round.lock();
        match (round.as_mut(), pong.from) {
            (Some(round), Some(from)) if round.token == pong.token => {
                round.awaiting.remove(&from);
            }
            _ => tracing::debug!("Stale pong {} dropped", pong.token),
        }
    }

    // ============================================================
    // Mapper coordination
    // ============================================================

    fn on_master_ping(&self, ping: Ping) {
        let Some(token) = ping.token else {
            return;
        };
        if !self.is_master() {
            return;
        }

        self.queue(Outbound::new(
            ping.from,
            Packet::Pong(Pong {
                token,
                from: Some(self.identity().to_string()),
            }),
        ));
    }

    fn on_state_request(&self, request: MapperStateRequest) {
        if request.from == self.identity() {
            return;
        }

        self.queue(Outbound::new(
            request.from,
            Packet::MapperState(MapperState {
                from: self.identity().to_string(),
                agents: self.cluster.snapshot(),
            }),
        ));
    }

    /// Slaves adopt the master's table, deletions included. A master only
    /// adds members it does not know yet, since slave tables may lag behind.
    fn on_state(&self, state: MapperState) {
        if state.from == self.identity() {
            return;
        }

        if !self.is_master() {
            match self.cluster.merge(state.agents) {
                Ok(summary) => tracing::info!(
                    "Mapper {} merged state from {}: {} upserted, {} removed",
                    self.identity(),
                    state.from,
                    summary.upserted,
                    summary.removed
                ),
                Err(e) => tracing::error!("Failed to merge state from {}: {}", state.from, e),
            }
            return;
        }

        for (identity, record) in state.agents {
            if self.cluster.contains(&identity) {
                continue;
            }
            if let Err(e) = self.cluster.upsert(&identity, record) {
                tracing::error!("Failed to store agent {}: {}", identity, e);
                continue;
            }
            self.reaper
                .update(&identity, self.cluster.agent_timeout(), self.timeout_callback());
        }
    }

    fn on_add_agent(&self, add: AddAgent) {
        if self.is_master() {
            return;
        }
        if let Err(e) = self.cluster.upsert(&add.identity, add.record) {
            tracing::error!("Failed to mirror agent {}: {}", add.identity, e);
        }
    }

    fn on_delete_agent(&self, delete: DeleteAgent) {
        self.cluster.evict(&delete.identity, EvictionReason::Remote);
    }

    // ============================================================
    // Requests
    // ============================================================

    /// Routes one request. `redelivered` requests come from the offline
    /// queue and go back there when still nobody can serve them.
    pub(super) async fn on_request(&self, request: Request, delivery: Delivery, redelivered: bool) {
        if let PolicyDecision::Deny(reason) = self.security.authorize_request(&request) {
            tracing::warn!(
                "Request {} from {} denied: {}",
                request.token,
                request.from,
                reason
            );
            delivery.ack();
            return;
        }

        let targets = self.routing.targets_for(&request);
        if targets.is_empty() {
            if redelivered {
                tracing::debug!("Still no target for {}, parking it again", request.token);
                delivery.reject(true);
                return;
            }
            delivery.ack();
            self.park_or_fail(request).await;
            return;
        }

        delivery.ack();
        self.route(request, targets);
    }

    async fn park_or_fail(&self, request: Request) {
        if self.config.offline_queue {
            match self
                .bus
                .send(packet::MAPPER_OFFLINE, &Packet::Request(request.clone()))
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "No target for {} ({}), parked on {}",
                        request.token,
                        request.service_path(),
                        packet::MAPPER_OFFLINE
                    );
                    return;
                }
                Err(e) => tracing::warn!("Cannot park request {}: {}", request.token, e),
            }
        }

        let error = DispatchError::NoTargets(request.service_path());
        tracing::warn!("Request {} failed: {}", request.token, error);
        self.reply_error(&request, &error);
    }

    fn reply_error(&self, request: &Request, error: &DispatchError) {
        let Some(reply_to) = &request.reply_to else {
            return;
        };

        self.queue(Outbound::new(
            reply_to.clone(),
            Packet::Result(JobResult {
                token: request.token.clone(),
                to: request.from.clone(),
                from: self.identity().to_string(),
                results: ErrorDescriptor::from_error(error).into_value(),
            }),
        ));
    }

    /// Opens a job that relays the aggregated result to the requester, then
    /// forwards the request to every target. Requests without `reply_to` are
    /// forwarded and forgotten.
    fn route(&self, request: Request, targets: Vec<String>) {
        if let Some(reply_to) = &request.reply_to {
            let intermediate = self.relay_intermediates(&request, reply_to);
            let completion = self.relay_results(&request, reply_to);

            let opened = self
                .jobs
                .lock()
                .new_job(&request, targets.clone(), Some(intermediate), Some(completion))
                .map(|_| ());
            if let Err(e) = opened {
                tracing::warn!("Request {} not routed: {}", request.token, e);
                return;
            }
        }

        self.forward(&request, &targets, request.reply_to.is_some());
    }

    pub(super) fn forward(&self, request: &Request, targets: &[String], expects_reply: bool) {
        let mut forwarded = request.clone();
        forwarded.reply_to = expects_reply.then(|| self.identity().to_string());

        for target in targets {
            self.queue(Outbound::new(
                target.clone(),
                Packet::Request(forwarded.clone()),
            ));
        }

        tracing::debug!(
            "Request {} for {} routed to {:?}",
            request.token,
            request.service_path(),
            targets
        );
    }

    fn relay_results(&self, request: &Request, reply_to: &str) -> CompletionHandler {
        let events = self.events.clone();
        let reply_to = reply_to.to_string();
        let token = request.token.clone();
        let to = request.from.clone();
        let from = self.identity().to_string();

        CompletionHandler::results(move |results| {
            let packet = Packet::Result(JobResult {
                token,
                to,
                from,
                results: Value::Object(results.into_iter().collect()),
            });
            events
                .send(Event::Publish(Outbound::new(reply_to, packet)))
                .map_err(|_| anyhow!("mapper event loop is gone"))
        })
    }

    fn relay_intermediates(&self, request: &Request, reply_to: &str) -> IntermediateHandler {
        let events = self.events.clone();
        let reply_to = reply_to.to_string();
        let token = request.token.clone();
        let to = request.from.clone();

        IntermediateHandler::Any(IntermediateCallback::message(move |key, from, message| {
            let packet = Packet::IntermediateMessage(IntermediateMessage {
                token: token.clone(),
                to: to.clone(),
                from: from.to_string(),
                messagekey: key.to_string(),
                message: message.clone(),
            });
            events
                .send(Event::Publish(Outbound::new(
                    reply_to.clone(),
                    packet,
                )))
                .map_err(|_| anyhow!("mapper event loop is gone"))
        }))
    }

    fn on_reply(&self, reply: Packet) {
        match self.jobs.lock().process(&reply) {
            Ok(outcome) => tracing::trace!(
                "{} for {:?}: {:?}",
                reply.kind(),
                reply.token(),
                outcome
            ),
            Err(e) => tracing::warn!("Job error: {}", e),
        }
    }

    /// A request that cannot reach its target counts as that target's
    /// (failed) answer, so the job still completes.
    pub(super) fn on_undeliverable(&self, outbound: Outbound, error: anyhow::Error) {
        let Packet::Request(request) = outbound.packet else {
            return;
        };
        if request.reply_to.as_deref() != Some(self.identity()) {
            return;
        }

        let failure = Packet::Result(JobResult {
            token: request.token,
            to: request.from,
            from: outbound.channel,
            results: ErrorDescriptor {
                kind: "Unreachable".to_string(),
                message: error.to_string(),
                trace: Vec::new(),
            }
            .into_value(),
        });
        self.on_reply(failure);
    }
}
