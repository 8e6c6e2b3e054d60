//! Node Configuration
//!
//! One `Config` is built at process start (TOML file, then CLI overrides) and
//! handed to every mapper and agent constructor. Durations are written in
//! seconds in files.

use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Preferred wire format. The other formats are still accepted on load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Yaml,
    /// MessagePack with named fields.
    #[serde(rename = "msgpack")]
    #[value(name = "msgpack")]
    MessagePack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this node on the bus.
    #[serde(default = "default_identity")]
    pub identity: String,

    /// How often agents heartbeat.
    #[serde(default = "default_heartbeat", with = "seconds")]
    pub heartbeat_interval: Duration,

    /// How often a slave mapper checks on the master.
    #[serde(default = "default_master_heartbeat", with = "seconds")]
    pub master_heartbeat_interval: Duration,

    /// Silence after which an agent is considered gone.
    #[serde(default = "default_agent_timeout", with = "seconds")]
    pub agent_timeout: Duration,

    /// Period of the master's liveness rounds.
    #[serde(default = "default_ping_interval", with = "seconds")]
    pub ping_interval: Duration,

    #[serde(default = "default_reaper_interval", with = "seconds")]
    pub reaper_interval: Duration,

    #[serde(default = "default_offline_redelivery", with = "seconds")]
    pub offline_redelivery_frequency: Duration,

    /// Park undeliverable requests on `mapper-offline` instead of failing them.
    #[serde(default = "default_true")]
    pub offline_queue: bool,

    #[serde(default)]
    pub format: Format,

    /// Keep the agent table in sled under `persist_path`.
    #[serde(default)]
    pub persist: bool,

    #[serde(default = "default_persist_path")]
    pub persist_path: PathBuf,

    /// Sign every packet with `secret`.
    #[serde(default)]
    pub secure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Accept unsigned packets while `secure` is on.
    #[serde(default)]
    pub insecure: bool,

    /// Concurrent actor invocations per agent; 0 runs them inline.
    #[serde(default)]
    pub worker_pool_size: usize,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Abandon jobs that stay outstanding longer than this.
    #[serde(
        default,
        with = "optional_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub job_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_bind: Option<SocketAddr>,
}

fn default_identity() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(15)
}

fn default_master_heartbeat() -> Duration {
    Duration::from_secs(5)
}

fn default_agent_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_offline_redelivery() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_persist_path() -> PathBuf {
    PathBuf::from("agent-mapper.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            heartbeat_interval: default_heartbeat(),
            master_heartbeat_interval: default_master_heartbeat(),
            agent_timeout: default_agent_timeout(),
            ping_interval: default_ping_interval(),
            reaper_interval: default_reaper_interval(),
            offline_redelivery_frequency: default_offline_redelivery(),
            offline_queue: true,
            format: Format::Json,
            persist: false,
            persist_path: default_persist_path(),
            secure: false,
            secret: None,
            insecure: false,
            worker_pool_size: 0,
            tags: Vec::new(),
            job_timeout: None,
            admin_bind: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            None => {
                tracing::debug!("No configuration file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Copy of this configuration under another identity.
    pub fn with_identity(&self, identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("identity cannot be empty".to_string()));
        }

        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("master_heartbeat_interval", self.master_heartbeat_interval),
            ("agent_timeout", self.agent_timeout),
            ("ping_interval", self.ping_interval),
            ("reaper_interval", self.reaper_interval),
            ("offline_redelivery_frequency", self.offline_redelivery_frequency),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        if self.secure && self.secret.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Invalid(
                "secure mode requires a non-empty secret".to_string(),
            ));
        }

        Ok(())
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod optional_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_f64(duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.master_heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reaper_interval, Duration::from_secs(2));
        assert!(config.offline_queue);
        assert_eq!(config.format, Format::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            identity = "mapper-1"
            agent_timeout = 2.5
            format = "yaml"
            tags = ["gpu"]
            job_timeout = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.identity, "mapper-1");
        assert_eq!(config.agent_timeout, Duration::from_millis(2500));
        assert_eq!(config.format, Format::Yaml);
        assert_eq!(config.tags, vec!["gpu".to_string()]);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.ping_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_msgpack_format_name() {
        let config = Config::from_toml_str(r#"format = "msgpack""#).unwrap();
        assert_eq!(config.format, Format::MessagePack);
    }

    #[test]
    fn test_secure_requires_secret() {
        let err = Config::from_toml_str("secure = true").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let ok = Config::from_toml_str("secure = true\nsecret = \"s3cret\"").unwrap();
        assert!(ok.secure);
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(Config::from_toml_str("agent_timeout = -1.0").is_err());
        assert!(Config::from_toml_str("reaper_interval = 0").is_err());
    }

    #[test]
    fn test_with_identity_keeps_settings() {
        let base = Config {
            worker_pool_size: 4,
            ..Config::default()
        };
        let copy = base.with_identity("agent-7");
        assert_eq!(copy.identity, "agent-7");
        assert_eq!(copy.worker_pool_size, 4);
    }
}
