//! Authorization
//!
//! The mapper asks a [`SecurityProvider`] before accepting a registration or
//! routing a request. A denial is logged as a warning and the packet is
//! dropped with no reply and no state change.

use crate::packet::{Register, Request};

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

pub trait SecurityProvider: Send + Sync {
    fn authorize_registration(&self, register: &Register) -> PolicyDecision;
    fn authorize_request(&self, request: &Request) -> PolicyDecision;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SecurityProvider for AllowAll {
    fn authorize_registration(&self, _register: &Register) -> PolicyDecision {
        PolicyDecision::Allow
    }

    fn authorize_request(&self, _request: &Request) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Rejects registrations and requests from the listed identities.
#[derive(Debug, Default, Clone)]
pub struct IdentityDenyList {
    denied: HashSet<String>,
}

impl IdentityDenyList {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: identities.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, identity: &str) -> PolicyDecision {
        if self.denied.contains(identity) {
            PolicyDecision::Deny(format!("identity '{}' is denied", identity))
        } else {
            PolicyDecision::Allow
        }
    }
}

impl SecurityProvider for IdentityDenyList {
    fn authorize_registration(&self, register: &Register) -> PolicyDecision {
        self.check(&register.identity)
    }

    fn authorize_request(&self, request: &Request) -> PolicyDecision {
        self.check(&request.from)
    }
}
