//! Packet Serializers
//!
//! Every packet is plain maps, sequences and scalars, so any self-describing
//! format can carry it. The chain dumps with the preferred format and loads
//! by trying each configured format in turn: JSON, YAML and MessagePack.
//!
//! When security is on, each format is wrapped in [`SignedSerializer`], which
//! prefixes the body with an HMAC-SHA256 tag. Unsigned packets are accepted
//! only through the `insecure` escape hatch.

use super::types::Packet;
use crate::config::{Config, Format};
use crate::error::{ConfigError, SerializationError};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &[u8] = b"hmac:";

pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;
    fn dump(&self, packet: &Packet) -> Result<Vec<u8>, SerializationError>;
    fn load(&self, bytes: &[u8]) -> Result<Packet, SerializationError>;
}

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn dump(&self, packet: &Packet) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(packet).map_err(|e| SerializationError::Encode {
            format: "json",
            reason: e.to_string(),
        })
    }

    fn load(&self, bytes: &[u8]) -> Result<Packet, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            format: "json",
            reason: e.to_string(),
        })
    }
}

pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn dump(&self, packet: &Packet) -> Result<Vec<u8>, SerializationError> {
        serde_yaml::to_string(packet)
            .map(String::into_bytes)
            .map_err(|e| SerializationError::Encode {
                format: "yaml",
                reason: e.to_string(),
            })
    }

    fn load(&self, bytes: &[u8]) -> Result<Packet, SerializationError> {
        serde_yaml::from_slice(bytes).map_err(|e| SerializationError::Decode {
            format: "yaml",
            reason: e.to_string(),
        })
    }
}

/// Binary MessagePack. Structs are written as maps so the packet tag and
/// free-form payloads survive the trip.
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn dump(&self, packet: &Packet) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(packet).map_err(|e| SerializationError::Encode {
            format: "msgpack",
            reason: e.to_string(),
        })
    }

    fn load(&self, bytes: &[u8]) -> Result<Packet, SerializationError> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializationError::Decode {
            format: "msgpack",
            reason: e.to_string(),
        })
    }
}

pub struct SignedSerializer {
    inner: Arc<dyn Serializer>,
    secret: Vec<u8>,
    insecure: bool,
}

impl SignedSerializer {
    pub fn new(inner: Arc<dyn Serializer>, secret: &[u8], insecure: bool) -> Self {
        Self {
            inner,
            secret: secret.to_vec(),
            insecure,
        }
    }

    fn mac(&self) -> Result<HmacSha256, SerializationError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SerializationError::Signature(e.to_string()))
    }
}

impl Serializer for SignedSerializer {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn dump(&self, packet: &Packet) -> Result<Vec<u8>, SerializationError> {
        let body = self.inner.dump(packet)?;
        let mut mac = self.mac()?;
        mac.update(&body);
        let tag = hex::encode(mac.finalize().into_bytes());

        let mut framed = Vec::with_capacity(SIGNATURE_PREFIX.len() + tag.len() + 1 + body.len());
        framed.extend_from_slice(SIGNATURE_PREFIX);
        framed.extend_from_slice(tag.as_bytes());
        framed.push(b'\n');
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    fn load(&self, bytes: &[u8]) -> Result<Packet, SerializationError> {
        let Some(rest) = bytes.strip_prefix(SIGNATURE_PREFIX) else {
            if self.insecure {
                return self.inner.load(bytes);
            }
            return Err(SerializationError::Signature("unsigned packet".to_string()));
        };

        let split = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| SerializationError::Signature("malformed frame".to_string()))?;
        let (tag_hex, body) = (&rest[..split], &rest[split + 1..]);

        let tag = hex::decode(tag_hex).map_err(|e| SerializationError::Signature(e.to_string()))?;
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&tag)
            .map_err(|_| SerializationError::Signature("signature mismatch".to_string()))?;

        self.inner.load(body)
    }
}

/// Preferred serializer plus fallbacks, tried in order on load.
pub struct SerializerChain {
    serializers: Vec<Arc<dyn Serializer>>,
}

impl SerializerChain {
    pub fn new(serializers: Vec<Arc<dyn Serializer>>) -> Self {
        Self { serializers }
    }

    /// Plain chain preferring `format`, falling back to the other formats.
    pub fn plain(format: Format) -> Self {
        Self::new(Self::ordered(format))
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let formats = Self::ordered(config.format);
        if !config.secure {
            return Ok(Self::new(formats));
        }

        let secret = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid("secure mode requires a secret".to_string()))?;

        let signed = formats
            .into_iter()
            .map(|inner| {
                Arc::new(SignedSerializer::new(inner, secret.as_bytes(), config.insecure))
                    as Arc<dyn Serializer>
            })
            .collect();

        Ok(Self::new(signed))
    }

    /// Every format, `preferred` first.
    fn ordered(preferred: Format) -> Vec<Arc<dyn Serializer>> {
        let mut formats = vec![preferred];
        formats.extend(
            [Format::Json, Format::MessagePack, Format::Yaml]
                .into_iter()
                .filter(|format| *format != preferred),
        );
        formats.into_iter().map(Self::serializer).collect()
    }

    fn serializer(format: Format) -> Arc<dyn Serializer> {
        match format {
            Format::Json => Arc::new(JsonSerializer),
            Format::Yaml => Arc::new(YamlSerializer),
            Format::MessagePack => Arc::new(MessagePackSerializer),
        }
    }

    pub fn preferred(&self) -> Option<&'static str> {
        self.serializers.first().map(|s| s.name())
    }

    pub fn dump(&self, packet: &Packet) -> Result<Vec<u8>, SerializationError> {
        match self.serializers.first() {
            Some(serializer) => serializer.dump(packet),
            None => Err(SerializationError::Exhausted("no serializers configured".to_string())),
        }
    }

    pub fn load(&self, bytes: &[u8]) -> Result<Packet, SerializationError> {
        let mut failures = Vec::new();

        for serializer in &self.serializers {
            match serializer.load(bytes) {
                Ok(packet) => return Ok(packet),
                Err(e) => failures.push(e.to_string()),
            }
        }

        Err(SerializationError::Exhausted(failures.join("; ")))
    }
}
