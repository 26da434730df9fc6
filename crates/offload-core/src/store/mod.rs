//! Content storage for task inputs.
//!
//! Files are kept in a pluggable [`FileStore`] and resolved through a
//! [`ContentStore`], which layers two bounded in-memory caches (compiled
//! modules and raw archives) over it and falls back to a remote origin on a
//! miss.
//!
//! A reference shaped like `sha256:<64 lowercase hex>` names a file by its
//! content hash. Any other reference is an opaque name. Stored content is
//! never re-verified against a hash-shaped name.

mod content;
mod directory;
pub mod lru;
mod memory;

pub use content::{CacheStats, CompiledModule, ContentStore, StorageUpdate, StoreStats};
pub use directory::DirectoryFileStore;
pub use lru::LruCache;
pub use memory::MemoryFileStore;

use crate::Result;
use bytes::Bytes;
use sha2::{Digest, Sha256};

const REF_PREFIX: &str = "sha256:";

/// A file held by a [`FileStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl StoredFile {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Backing storage for named files.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Names of all stored files.
    async fn list(&self) -> Result<Vec<String>>;

    async fn has(&self, name: &str) -> Result<bool>;

    async fn get(&self, name: &str) -> Result<Option<StoredFile>>;

    /// Store a file, replacing any file with the same name.
    async fn put(&self, name: &str, bytes: Bytes, content_type: &str) -> Result<StoredFile>;

    /// Remove a file; returns whether it was present.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// Check whether `name` is a content hash reference.
pub fn is_ref(name: &str) -> bool {
    name.strip_prefix(REF_PREFIX).is_some_and(|hash| {
        hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    })
}

/// Content hash reference of `bytes`.
pub fn content_ref(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{}", REF_PREFIX, hex::encode(hasher.finalize()))
}

/// Human-readable byte size for log lines.
pub fn filesize(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
