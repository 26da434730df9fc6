//! Builder for configuring Provider initialization.

use super::Provider;
use crate::config::ProviderConfig;
use crate::executor::CommandExecutorFactory;
use crate::pool::{ExecutorFactory, WorkerPool};
use crate::store::{ContentStore, DirectoryFileStore, FileStore, MemoryFileStore};
use crate::{ProviderError, Result};
use std::sync::Arc;
use tracing::info;

/// Builder for a [`Provider`].
///
/// # Example
///
/// ```rust,ignore
/// use offload_core::{Provider, ProviderConfig};
///
/// let provider = Provider::builder(ProviderConfig::default())
///     .build()
///     .await?;
/// ```
pub struct ProviderBuilder {
    config: ProviderConfig,
    factory: Option<Arc<dyn ExecutorFactory>>,
    files: Option<Arc<dyn FileStore>>,
    origin: Option<Option<url::Url>>,
}

impl ProviderBuilder {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            factory: None,
            files: None,
            origin: None,
        }
    }

    /// Use `factory` instead of running tasks through the configured runtime
    /// command.
    pub fn executor_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use `files` as the backing store instead of the configured one.
    pub fn file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    /// Override the remote origin; `None` disables remote fetches.
    pub fn origin(mut self, origin: Option<url::Url>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Build the provider and start its executors.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<Provider> {
        let config = self.config;
        config.validate()?;

        let files: Arc<dyn FileStore> = match (self.files, &config.storage_dir) {
            (Some(files), _) => files,
            (None, Some(dir)) => Arc::new(DirectoryFileStore::open(dir).await?),
            (None, None) => Arc::new(MemoryFileStore::new()),
        };

        let origin = match self.origin {
            Some(origin) => origin,
            None => config
                .effective_storage_origin()
                .map(|origin| {
                    url::Url::parse(&origin).map_err(|e| ProviderError::Config {
                        message: format!("Invalid storage origin {}: {}", origin, e),
                    })
                })
                .transpose()?,
        };
        if let Some(origin) = &origin {
            info!("Fetching missing files from {}", origin);
        }

        let store = Arc::new(
            ContentStore::new(files, origin)?.with_budgets(config.module_cache, config.archive_cache),
        );
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(CommandExecutorFactory::from_config(&config)));
        let pool = WorkerPool::new(factory, config.workers);

        let provider = Provider::from_parts(config.name.clone(), store, pool);
        let size = provider.pool().scale(config.workers).await?;
        info!("Started {} executors", size);
        Ok(provider)
    }
}
