//! Cached resolution of module and archive references.

use super::lru::LruCache;
use super::{content_ref, filesize, is_ref, FileStore, StoredFile};
use crate::config::{CacheBudget, StoreConfig};
use crate::{ProviderError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_VERSION: &[u8; 4] = &[1, 0, 0, 0];

/// A module checked and ready to hand to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    /// Name the module was resolved under.
    pub name: String,
    /// Content hash of `bytes`.
    pub digest: String,
    pub bytes: Bytes,
}

impl CompiledModule {
    /// Validate a binary module header and wrap the bytes.
    pub fn compile(name: &str, bytes: Bytes) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != WASM_MAGIC {
            return Err(ProviderError::InvalidRequest {
                message: format!("{} is not a WebAssembly module", name),
            });
        }
        if &bytes[4..8] != WASM_VERSION {
            return Err(ProviderError::InvalidRequest {
                message: format!("{} has an unsupported module version", name),
            });
        }
        Ok(Self {
            name: name.to_string(),
            digest: content_ref(&bytes),
            bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Names added to or removed from the backing store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub modules: CacheStats,
    pub archives: CacheStats,
}

/// Resolves references to bytes through two caches, the backing store and
/// an optional remote origin.
pub struct ContentStore {
    files: Arc<dyn FileStore>,
    origin: Option<url::Url>,
    http: reqwest::Client,
    modules: Mutex<LruCache<String, Arc<CompiledModule>>>,
    archives: Mutex<LruCache<String, Bytes>>,
    // one remote fetch per name at a time
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    updates: broadcast::Sender<StorageUpdate>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("origin", &self.origin.as_ref().map(|u| u.as_str()))
            .field("stats", &self.stats())
            .finish()
    }
}

impl ContentStore {
    /// Create a store over `files`, fetching misses from `origin` if given.
    pub fn new(files: Arc<dyn FileStore>, origin: Option<url::Url>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StoreConfig::FETCH_TIMEOUT)
            .user_agent(concat!("offload-provider/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let (updates, _) = broadcast::channel(64);

        Ok(Self {
            files,
            origin,
            http,
            modules: Mutex::new(LruCache::new(CacheBudget::default())),
            archives: Mutex::new(LruCache::new(CacheBudget::default())),
            inflight: Mutex::new(HashMap::new()),
            updates,
        })
    }

    /// Replace the cache budgets; clears both caches.
    pub fn with_budgets(self, modules: CacheBudget, archives: CacheBudget) -> Self {
        Self {
            modules: Mutex::new(LruCache::new(modules)),
            archives: Mutex::new(LruCache::new(archives)),
            ..self
        }
    }

    pub fn origin(&self) -> Option<&url::Url> {
        self.origin.as_ref()
    }

    /// Subscribe to added/removed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageUpdate> {
        self.updates.subscribe()
    }

    /// Resolve a module reference, served from the module cache when possible.
    pub async fn get_module(&self, name: &str) -> Result<Arc<CompiledModule>> {
        if let Some(module) = self.modules.lock().ok().and_then(|mut c| c.get(&name.to_string())) {
            debug!("Module cache hit for {}", name);
            return Ok(module);
        }

        let file = self.resolve(name).await?.ok_or_else(|| ProviderError::NotFound {
            name: name.to_string(),
        })?;
        let module = Arc::new(CompiledModule::compile(name, file.bytes)?);

        let size = module.size();
        let cached = match self.modules.lock() {
            Ok(mut cache) => cache.insert(name.to_string(), module.clone(), size),
            Err(_) => false,
        };
        if !cached {
            debug!("Module {} ({}) not cached", name, filesize(size));
        }
        Ok(module)
    }

    /// Resolve an archive reference, served from the archive cache when possible.
    pub async fn get_archive(&self, name: &str) -> Result<Bytes> {
        if let Some(bytes) = self.archives.lock().ok().and_then(|mut c| c.get(&name.to_string())) {
            debug!("Archive cache hit for {}", name);
            return Ok(bytes);
        }

        let file = self.resolve(name).await?.ok_or_else(|| ProviderError::NotFound {
            name: name.to_string(),
        })?;
        let size = file.bytes.len() as u64;
        if let Ok(mut cache) = self.archives.lock() {
            if !cache.insert(name.to_string(), file.bytes.clone(), size) {
                debug!("Archive {} ({}) not cached", name, filesize(size));
            }
        }
        Ok(file.bytes)
    }

    /// Look `name` up in the backing store, then at the origin.
    ///
    /// A fetched file is persisted under the name the origin reports, or its
    /// content hash, before it is returned. A failed fetch is `None`.
    pub async fn resolve(&self, name: &str) -> Result<Option<StoredFile>> {
        if let Some(file) = self.files.get(name).await? {
            return Ok(Some(file));
        }
        let Some(origin) = self.origin.clone() else {
            return Ok(None);
        };

        let flight = self.join_flight(name);
        let result = {
            let _guard = flight.lock().await;
            match self.files.get(name).await {
                // a concurrent fetch of the same name finished first
                Ok(Some(file)) => Ok(Some(file)),
                Ok(None) => self.fetch_and_persist(&origin, name).await,
                Err(e) => Err(e),
            }
        };
        self.leave_flight(name, &flight);
        result
    }

    async fn fetch_and_persist(&self, origin: &url::Url, name: &str) -> Result<Option<StoredFile>> {
        let fetched = match self.fetch(origin, name).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                debug!("{} not found at origin", name);
                return Ok(None);
            }
            Err(e) => {
                warn!("Fetching {} failed: {}", name, e);
                return Ok(None);
            }
        };

        let (remote_name, content_type, bytes) = fetched;
        let stored_name = remote_name.unwrap_or_else(|| content_ref(&bytes));
        info!(
            "Fetched {} ({}) as {}",
            name,
            filesize(bytes.len() as u64),
            stored_name
        );
        let file = self.files.put(&stored_name, bytes, &content_type).await?;
        self.notify(StorageUpdate {
            added: vec![stored_name],
            removed: Vec::new(),
        });
        Ok(Some(file))
    }

    async fn fetch(
        &self,
        origin: &url::Url,
        name: &str,
    ) -> Result<Option<(Option<String>, String, Bytes)>> {
        let mut url = origin.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Config {
                message: format!("{} cannot be a storage origin", origin),
            })?
            .pop_if_empty()
            .push(StoreConfig::REMOTE_PATH)
            .push(name);

        let response = self.http.get(url.clone()).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Network {
                message: format!("{} returned {}", url, response.status()),
                source: None,
            });
        }

        let header = |key: &str| {
            response
                .headers()
                .get(key)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let remote_name = header(StoreConfig::REF_HEADER);
        let content_type = header(reqwest::header::CONTENT_TYPE.as_str())
            .unwrap_or_else(|| StoreConfig::DEFAULT_CONTENT_TYPE.to_string());

        let bytes = response.bytes().await?;
        Ok(Some((remote_name, content_type, bytes)))
    }

    fn join_flight(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.inflight.lock() {
            Ok(mut inflight) => inflight
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn leave_flight(&self, name: &str, flight: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut inflight) = self.inflight.lock() {
            // the map and this caller are the last holders
            if Arc::strong_count(flight) <= 2 {
                inflight.remove(name);
            }
        }
    }

    /// Store an uploaded file and return the name it was stored under.
    ///
    /// A supplied name is kept only if it is already a content reference.
    pub async fn upload(&self, name: Option<&str>, bytes: Bytes, content_type: &str) -> Result<String> {
        let name = match name {
            Some(name) if is_ref(name) => name.to_string(),
            _ => content_ref(&bytes),
        };
        let content_type = if content_type.is_empty() {
            StoreConfig::DEFAULT_CONTENT_TYPE
        } else {
            content_type
        };
        info!("Storing upload {} ({})", name, filesize(bytes.len() as u64));
        self.files.put(&name, bytes, content_type).await?;
        self.invalidate(&name);
        self.notify(StorageUpdate {
            added: vec![name.clone()],
            removed: Vec::new(),
        });
        Ok(name)
    }

    /// Remove a file from the backing store and both caches.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let present = self.files.delete(name).await?;
        self.invalidate(name);
        if present {
            info!("Deleted {}", name);
            self.notify(StorageUpdate {
                added: Vec::new(),
                removed: vec![name.to_string()],
            });
        }
        Ok(present)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.files.list().await
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        self.files.has(name).await
    }

    /// Forget cached copies of `name`.
    pub fn invalidate(&self, name: &str) {
        let key = name.to_string();
        if let Ok(mut modules) = self.modules.lock() {
            modules.remove(&key);
        }
        if let Ok(mut archives) = self.archives.lock() {
            archives.remove(&key);
        }
    }

    pub fn stats(&self) -> StoreStats {
        let modules = self
            .modules
            .lock()
            .map(|c| CacheStats {
                entries: c.len(),
                bytes: c.bytes(),
            })
            .unwrap_or_default();
        let archives = self
            .archives
            .lock()
            .map(|c| CacheStats {
                entries: c.len(),
                bytes: c.bytes(),
            })
            .unwrap_or_default();
        StoreStats { modules, archives }
    }

    fn notify(&self, update: StorageUpdate) {
        // no subscribers is fine
        let _ = self.updates.send(update);
    }
}
