use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Fraction of an interval a peer gets to answer a ping.
pub const REPLY_WINDOW: f64 = 0.66;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Slave,
    Master,
}

impl Role {
    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Slave => f.write_str("slave"),
            Role::Master => f.write_str("master"),
        }
    }
}

/// What a slave learned from one master check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterCheck {
    /// The master answered within the window.
    Answered,
    /// The ping went out but no pong came back in time.
    Silent,
    /// Nobody consumes the master heartbeat channel.
    Unreachable,
}

/// Decides when a slave takes over as master.
pub trait Election: Send + Sync {
    /// How long a slave waits for the master's pong after each check.
    fn pong_window(&self, check_interval: Duration) -> Duration;

    fn should_promote(&self, check: MasterCheck) -> bool;
}

/// The first slave whose master check goes unanswered promotes itself.
/// There is no quorum: two slaves timing out together both promote.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatPromotion;

impl Election for HeartbeatPromotion {
    fn pong_window(&self, check_interval: Duration) -> Duration {
        check_interval.mul_f64(REPLY_WINDOW)
    }

    fn should_promote(&self, check: MasterCheck) -> bool {
        !matches!(check, MasterCheck::Answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_window_is_two_thirds_of_interval() {
        let window = HeartbeatPromotion.pong_window(Duration::from_secs(5));
        assert!(window > Duration::from_millis(3299));
        assert!(window < Duration::from_millis(3301));
    }

    #[test]
    fn test_promotes_unless_answered() {
        assert!(!HeartbeatPromotion.should_promote(MasterCheck::Answered));
        assert!(HeartbeatPromotion.should_promote(MasterCheck::Silent));
        assert!(HeartbeatPromotion.should_promote(MasterCheck::Unreachable));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Master).unwrap(), "\"master\"");
        assert_eq!(Role::Slave.to_string(), "slave");
    }
}
