//! Target Selection
//!
//! Picks which agent(s) receive a request. Every policy starts from the live
//! providers of the requested service (timed-out members are evicted on the
//! way) and then narrows them down:
//!
//! - **`all`**: every live provider.
//! - **`random`**: one provider, uniformly.
//! - **`least_loaded`**: the provider with the lowest numeric status.
//! - **`rr`**: a per-service rotation cursor.
//!
//! An explicit `target` on the request bypasses every policy.

pub mod policy;

pub use policy::RoutingPolicy;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selector {
    #[serde(rename = "least_loaded")]
    LeastLoaded,
    #[serde(rename = "random")]
    Random,
    #[serde(rename = "all")]
    All,
    #[serde(rename = "rr")]
    RoundRobin,
}

/// Used when a request names neither a target nor a selector.
pub const DEFAULT_SELECTOR: Selector = Selector::LeastLoaded;

impl Selector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selector::LeastLoaded => "least_loaded",
            Selector::Random => "random",
            Selector::All => "all",
            Selector::RoundRobin => "rr",
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_loaded" => Ok(Selector::LeastLoaded),
            "random" => Ok(Selector::Random),
            "all" => Ok(Selector::All),
            "rr" => Ok(Selector::RoundRobin),
            other => Err(format!("unknown selector '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests;
