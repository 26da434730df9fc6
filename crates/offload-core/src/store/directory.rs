//! On-disk file store.
//!
//! Every file is kept as two entries in one flat directory:
//!
//! ```text
//! <key>.bin    contents
//! <key>.json   metadata: original name, content type, size, store time
//! ```
//!
//! `key` is the hex sha256 of the file name, so arbitrary names (including
//! `sha256:` references) map to portable file names. Both entries are written
//! to a temp file first and renamed into place; the metadata goes last, which
//! makes it the commit marker for `list`.

use super::{FileStore, StoredFile};
use crate::{ProviderError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileMetadata {
    name: String,
    content_type: String,
    size: u64,
    stored_at: chrono::DateTime<chrono::Utc>,
}

/// File store persisted in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryFileStore {
    root: PathBuf,
}

impl DirectoryFileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ProviderError::io_with_path(e, &root))?;
        debug!("Opened file store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key(name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.bin", Self::key(name)))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::key(name)))
    }

    async fn read_metadata(path: &Path) -> Result<Option<FileMetadata>> {
        match tokio::fs::read(path).await {
            Ok(raw) => {
                let meta = serde_json::from_slice(&raw).map_err(|e| ProviderError::Json {
                    message: format!("Failed to parse {}: {}", path.display(), e),
                    source: Some(e),
                })?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io_with_path(e, path)),
        }
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, contents)
            .await
            .map_err(|e| ProviderError::io_with_path(e, &temp_path))?;
        if let Err(e) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ProviderError::io_with_path(e, path));
        }
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProviderError::io_with_path(e, path)),
        }
    }
}

#[async_trait::async_trait]
impl FileStore for DirectoryFileStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ProviderError::io_with_path(e, &self.root))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::io_with_path(e, &self.root))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_metadata(&path).await {
                Ok(Some(meta)) => names.push(meta.name),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable metadata {}: {}", path.display(), e),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(Self::read_metadata(&self.meta_path(name)).await?.is_some())
    }

    async fn get(&self, name: &str) -> Result<Option<StoredFile>> {
        let Some(meta) = Self::read_metadata(&self.meta_path(name)).await? else {
            return Ok(None);
        };
        let path = self.data_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Metadata without contents for {}", name);
                return Ok(None);
            }
            Err(e) => return Err(ProviderError::io_with_path(e, &path)),
        };
        Ok(Some(StoredFile {
            name: meta.name,
            content_type: meta.content_type,
            bytes: Bytes::from(bytes),
        }))
    }

    async fn put(&self, name: &str, bytes: Bytes, content_type: &str) -> Result<StoredFile> {
        let meta = FileMetadata {
            name: name.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            stored_at: chrono::Utc::now(),
        };
        let encoded = serde_json::to_vec_pretty(&meta)?;

        Self::write_atomic(&self.data_path(name), &bytes).await?;
        Self::write_atomic(&self.meta_path(name), &encoded).await?;

        Ok(StoredFile {
            name: meta.name,
            content_type: meta.content_type,
            bytes,
        })
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let present = Self::remove_if_present(&self.meta_path(name)).await?;
        Self::remove_if_present(&self.data_path(name)).await?;
        Ok(present)
    }
}
