//! Envelope encodings.
//!
//! Two equivalent encodings exist: compact binary (bincode, varint integers)
//! and JSON text. One is chosen per connection during the handshake and kept
//! for the connection's lifetime.

use super::envelope::Envelope;
use crate::config::ProtocolConfig;
use crate::{ProviderError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Binary,
    Json,
}

impl Codec {
    /// Subprotocol name announced during negotiation.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Codec::Binary => ProtocolConfig::SUBPROTOCOL_BINARY,
            Codec::Json => ProtocolConfig::SUBPROTOCOL_JSON,
        }
    }

    pub fn from_subprotocol(name: &str) -> Option<Self> {
        match name {
            ProtocolConfig::SUBPROTOCOL_BINARY => Some(Codec::Binary),
            ProtocolConfig::SUBPROTOCOL_JSON => Some(Codec::Json),
            _ => None,
        }
    }

    fn bincode_options() -> impl Options {
        bincode::DefaultOptions::new().with_limit(ProtocolConfig::MAX_MESSAGE_SIZE as u64)
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match self {
            Codec::Binary => Ok(Self::bincode_options().serialize(envelope)?),
            Codec::Json => Ok(serde_json::to_vec(envelope)?),
        }
    }

    /// Decode an envelope; any failure is a protocol violation.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        match self {
            Codec::Binary => Self::bincode_options()
                .deserialize(bytes)
                .map_err(|e| ProviderError::protocol(format!("malformed binary envelope: {}", e))),
            Codec::Json => serde_json::from_slice(bytes)
                .map_err(|e| ProviderError::protocol(format!("malformed json envelope: {}", e))),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.subprotocol())
    }
}

impl std::str::FromStr for Codec {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "binary" => Ok(Codec::Binary),
            "json" => Ok(Codec::Json),
            other => Codec::from_subprotocol(other).ok_or_else(|| ProviderError::Negotiation {
                subprotocol: other.to_string(),
            }),
        }
    }
}
