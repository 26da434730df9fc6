//! In-memory file store.

use super::{FileStore, StoredFile};
use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// File store keeping everything in a map; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, StoredFile>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FileStore for MemoryFileStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.files.read().await.contains_key(name))
    }

    async fn get(&self, name: &str) -> Result<Option<StoredFile>> {
        Ok(self.files.read().await.get(name).cloned())
    }

    async fn put(&self, name: &str, bytes: Bytes, content_type: &str) -> Result<StoredFile> {
        let file = StoredFile {
            name: name.to_string(),
            content_type: content_type.to_string(),
            bytes,
        };
        self.files
            .write()
            .await
            .insert(name.to_string(), file.clone());
        Ok(file)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.files.write().await.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryFileStore::new();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get("a").await.unwrap().is_none());

        store
            .put("b", Bytes::from_static(b"bee"), "text/plain")
            .await
            .unwrap();
        store
            .put("a", Bytes::from_static(b"ay"), "text/plain")
            .await
            .unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
        assert!(store.has("a").await.unwrap());
        assert_eq!(store.get("b").await.unwrap().unwrap().bytes, "bee");

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(!store.has("a").await.unwrap());
    }
}
