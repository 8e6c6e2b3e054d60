use crate::cluster::AgentRecord;
use crate::routing::Selector;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Generates a request token. Tokens identify one logical request for its
/// whole lifetime.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A call to an actor operation, routed by the mapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Service path, `/prefix/operation` or just `/prefix`.
    #[serde(rename = "type")]
    pub service: String,
    pub payload: Value,
    pub from: String,
    pub token: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub selector: Option<Selector>,
    /// Seconds the caller is willing to wait; informational for the core.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Explicit target identity, bypassing every routing policy.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Request {
    pub fn new(service: impl Into<String>, payload: Value, from: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            payload,
            from: from.into(),
            token: new_token(),
            reply_to: None,
            selector: None,
            timeout: None,
            target: None,
            tags: Vec::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// The service in `/prefix/operation` form, as agents advertise it.
    pub fn service_path(&self) -> String {
        crate::dispatcher::canonical_service(&self.service)
    }
}

/// Final outcome of a request from one target (or the mapper's aggregate).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub token: String,
    pub to: String,
    pub from: String,
    pub results: Value,
}

/// A streamed partial result emitted before the target's final result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntermediateMessage {
    pub token: String,
    pub to: String,
    pub from: String,
    pub messagekey: String,
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Register {
    pub identity: String,
    pub services: Vec<String>,
    pub status: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnRegister {
    pub identity: String,
}

/// Agent heartbeat, mapper liveness ping or slave-to-master heartbeat.
/// Liveness pings carry a `token` the answering Pong must echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub identity: String,
    pub status: Value,
    pub from: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    pub token: String,
    #[serde(default)]
    pub from: Option<String>,
}

/// Asks an agent to register again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Advertise {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapperStateRequest {
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapperState {
    pub from: String,
    pub agents: BTreeMap<String, AgentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddAgent {
    pub identity: String,
    pub record: AgentRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteAgent {
    pub identity: String,
}

/// Every message that travels over the bus, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    Request(Request),
    Result(JobResult),
    IntermediateMessage(IntermediateMessage),
    Register(Register),
    UnRegister(UnRegister),
    Ping(Ping),
    Pong(Pong),
    Advertise(Advertise),
    MapperStateRequest(MapperStateRequest),
    MapperState(MapperState),
    AddAgent(AddAgent),
    DeleteAgent(DeleteAgent),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Request(_) => "request",
            Packet::Result(_) => "result",
            Packet::IntermediateMessage(_) => "intermediate_message",
            Packet::Register(_) => "register",
            Packet::UnRegister(_) => "un_register",
            Packet::Ping(_) => "ping",
            Packet::Pong(_) => "pong",
            Packet::Advertise(_) => "advertise",
            Packet::MapperStateRequest(_) => "mapper_state_request",
            Packet::MapperState(_) => "mapper_state",
            Packet::AddAgent(_) => "add_agent",
            Packet::DeleteAgent(_) => "delete_agent",
        }
    }

    /// The correlation token for packets that carry one.
    pub fn token(&self) -> Option<&str> {
        match self {
            Packet::Request(r) => Some(&r.token),
            Packet::Result(r) => Some(&r.token),
            Packet::IntermediateMessage(m) => Some(&m.token),
            Packet::Pong(p) => Some(&p.token),
            Packet::Advertise(a) => Some(&a.token),
            Packet::Ping(p) => p.token.as_deref(),
            _ => None,
        }
    }
}

/// A packet waiting to be published on `channel`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub channel: String,
    pub packet: Packet,
}

impl Outbound {
    pub fn new(channel: impl Into<String>, packet: Packet) -> Self {
        Self {
            channel: channel.into(),
            packet,
        }
    }
}
