//! Centralized configuration for the provider runtime.
//!
//! Constant tables follow the protocol and cache defaults; `ProviderConfig`
//! carries the values a single provider process is started with.

use crate::protocol::Codec;
use crate::{ProviderError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Maximum size of one fragment on size-limited channels.
    pub const MAX_FRAGMENT_SIZE: usize = 64_000;
    /// Smallest usable fragment: 4 length bytes plus one payload byte.
    pub const MIN_FRAGMENT_SIZE: usize = 5;
    /// Ceiling for any declared message length (100 MB).
    pub const MAX_MESSAGE_SIZE: usize = 100_000_000;
    /// Ceiling for a handshake frame, which only lists subprotocol names.
    pub const MAX_HANDSHAKE_SIZE: usize = 4096;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SUBPROTOCOL_BINARY: &'static str = "provider_v1_binary";
    pub const SUBPROTOCOL_JSON: &'static str = "provider_v1_json";
    /// Label of the data channel the peer transport accepts.
    pub const DATA_CHANNEL_LABEL: &'static str = "offload";
}

/// Content store constants.
pub struct StoreConfig;

impl StoreConfig {
    pub const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
    pub const CACHE_MAX_BYTES: u64 = 128 * 1024 * 1024;
    pub const CACHE_MAX_ENTRIES: usize = 64;
    /// Path segment under the origin that serves stored files.
    pub const REMOTE_PATH: &'static str = "storage";
    /// Response header carrying the server-side name of a fetched file.
    pub const REF_HEADER: &'static str = "x-content-ref";
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_CONTENT_TYPE: &'static str = "application/octet-stream";
}

/// Worker pool constants.
pub struct PoolConfig;

impl PoolConfig {
    /// Default pool capacity: the number of available hardware threads.
    pub fn default_capacity() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Eviction budget of one in-memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBudget {
    /// Lifetime of an entry since its last insertion.
    pub ttl: Duration,
    /// Ceiling for the summed byte size of live entries.
    pub max_bytes: u64,
    /// Ceiling for the number of live entries.
    pub max_entries: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            ttl: StoreConfig::CACHE_TTL,
            max_bytes: StoreConfig::CACHE_MAX_BYTES,
            max_entries: StoreConfig::CACHE_MAX_ENTRIES,
        }
    }
}

/// Configuration of one provider process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Broker address (`tcp://host:port`, or an http(s) origin whose host and
    /// port are used for the socket).
    pub broker_url: String,
    /// Name announced in the hello event.
    pub name: String,
    /// Number of executors to run.
    pub workers: usize,
    /// Directory for the on-disk store; `None` keeps files in memory.
    pub storage_dir: Option<PathBuf>,
    /// Origin to fetch missing files from; defaults to the broker's http origin.
    pub storage_origin: Option<String>,
    /// Sandbox runtime invoked for every task.
    pub runtime: String,
    /// Extra arguments passed to the runtime before the module path.
    pub runtime_args: Vec<String>,
    /// Encodings offered to the broker, in order of preference.
    pub encodings: Vec<Codec>,
    /// Replace each executor after it ran one task.
    #[serde(default)]
    pub respawn_after_task: bool,
    pub module_cache: CacheBudget,
    pub archive_cache: CacheBudget,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://localhost:4080".to_string(),
            name: "offload-provider".to_string(),
            workers: PoolConfig::default_capacity(),
            storage_dir: None,
            storage_origin: None,
            runtime: "wasmtime".to_string(),
            runtime_args: vec!["run".to_string()],
            encodings: vec![Codec::Binary, Codec::Json],
            respawn_after_task: false,
            module_cache: CacheBudget::default(),
            archive_cache: CacheBudget::default(),
        }
    }
}

impl ProviderConfig {
    /// Check the values and normalize the broker URL.
    pub fn validate(&self) -> Result<url::Url> {
        if self.workers == 0 {
            return Err(ProviderError::Config {
                message: "workers must be a positive number".to_string(),
            });
        }
        if self.encodings.is_empty() {
            return Err(ProviderError::Config {
                message: "at least one encoding must be offered".to_string(),
            });
        }

        let url = url::Url::parse(&self.broker_url).map_err(|e| ProviderError::Config {
            message: format!("Invalid broker url {}: {}", self.broker_url, e),
        })?;
        match url.scheme() {
            "http" | "https" | "tcp" => {}
            other => {
                return Err(ProviderError::Config {
                    message: format!("Unsupported broker url scheme: {}", other),
                })
            }
        }
        if url.host_str().is_none() {
            return Err(ProviderError::Config {
                message: format!("Broker url has no host: {}", self.broker_url),
            });
        }

        if let Some(origin) = &self.storage_origin {
            let parsed = url::Url::parse(origin).map_err(|e| ProviderError::Config {
                message: format!("Invalid storage origin {}: {}", origin, e),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ProviderError::Config {
                    message: "storage origin must be an http(s) url".to_string(),
                });
            }
        }

        Ok(url)
    }

    /// Origin used for remote storage fetches.
    pub fn effective_storage_origin(&self) -> Option<String> {
        if let Some(origin) = &self.storage_origin {
            return Some(origin.trim_end_matches('/').to_string());
        }
        let url = url::Url::parse(&self.broker_url).ok()?;
        match url.scheme() {
            "http" | "https" => Some(url.origin().ascii_serialization()),
            _ => None,
        }
    }

    /// `host:port` of the broker socket.
    pub fn broker_socket_addr(&self) -> Result<String> {
        let url = self.validate()?;
        let host = url.host_str().unwrap_or("localhost");
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProviderError::Config {
                message: format!("Broker url has no port: {}", self.broker_url),
            })?;
        Ok(format!("{}:{}", host, port))
    }
}
