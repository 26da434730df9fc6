//! The provider: one broker connection serving tasks from a pool.
//!
//! A `Provider` owns the content store and the worker pool and, once
//! connected, a messenger. Pool concurrency changes and storage updates are
//! forwarded to the broker as events.

mod builder;
mod dispatch;

pub use builder::ProviderBuilder;

use crate::config::ProviderConfig;
use crate::messenger::Messenger;
use crate::pool::{PoolSnapshot, WorkerPool};
use crate::protocol::{FileSystemUpdate, ProviderHello, ProviderResources};
use crate::store::ContentStore;
use crate::transport::Transport;
use crate::{ProviderError, Result};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type MessengerSlot = Arc<RwLock<Option<Arc<Messenger>>>>;

struct ProviderInner {
    name: String,
    store: Arc<ContentStore>,
    pool: WorkerPool,
    messenger: MessengerSlot,
    /// Event forwarders running for the provider's lifetime.
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    /// Tasks bound to the current connection.
    connection: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        for handles in [&self.forwarders, &self.connection] {
            if let Ok(mut handles) = handles.lock() {
                for handle in handles.drain(..) {
                    handle.abort();
                }
            }
        }
    }
}

/// A compute provider serving one broker.
///
/// Cloning shares the provider.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.inner.name)
            .field("pool", &self.inner.pool)
            .field("connected", &self.messenger().is_some())
            .finish()
    }
}

impl Provider {
    pub fn builder(config: ProviderConfig) -> ProviderBuilder {
        ProviderBuilder::new(config)
    }

    pub(crate) fn from_parts(name: String, store: Arc<ContentStore>, pool: WorkerPool) -> Self {
        let messenger: MessengerSlot = Arc::new(RwLock::new(None));

        let (snapshots_tx, snapshots_rx) = watch::channel(pool.snapshot());
        pool.set_observer(move |snapshot| {
            snapshots_tx.send_replace(snapshot);
        });
        let forwarders = vec![
            tokio::spawn(forward_resources(snapshots_rx, messenger.clone())),
            tokio::spawn(forward_storage(store.subscribe(), messenger.clone())),
        ];

        Self {
            inner: Arc::new(ProviderInner {
                name,
                store,
                pool,
                messenger,
                forwarders: Mutex::new(forwarders),
                connection: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.inner.store
    }

    /// Messenger of the current connection, if any.
    pub fn messenger(&self) -> Option<Arc<Messenger>> {
        self.inner.messenger.read().ok().and_then(|m| m.clone())
    }

    /// Attach to a broker over `transport`, replacing any previous connection.
    ///
    /// Announces the provider with a hello event followed by its current
    /// resources.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<Arc<Messenger>> {
        if let Some(previous) = self.messenger() {
            previous.close("reconnecting");
        }
        self.abort_connection_tasks();

        transport.ready().await?;
        let messenger = Arc::new(Messenger::new(transport));

        messenger
            .send_event(ProviderHello {
                name: self.inner.name.clone(),
                platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
                useragent: concat!("offload-provider/", env!("CARGO_PKG_VERSION")).to_string(),
            })
            .await?;
        messenger
            .send_event(resources(self.inner.pool.snapshot()))
            .await?;

        // forwarders see the connection only after the hello
        if let Ok(mut slot) = self.inner.messenger.write() {
            *slot = Some(messenger.clone());
        }
        let events = tokio::spawn(log_events(messenger.clone()));
        if let Ok(mut connection) = self.inner.connection.lock() {
            connection.push(events);
        }

        info!("Provider {} connected", self.inner.name);
        Ok(messenger)
    }

    /// Answer inbound requests until the connection closes.
    ///
    /// Every request is handled on its own task, so a long running task never
    /// holds up the others.
    pub async fn handle_requests(&self) -> Result<()> {
        let messenger = self.messenger().ok_or_else(|| ProviderError::TransportClosed {
            reason: "not connected to a broker".to_string(),
        })?;

        while let Some(call) = messenger.next_request().await {
            let provider = self.clone();
            tokio::spawn(async move {
                let sequence = call.sequence();
                let result = call
                    .respond_with(|payload| async move { provider.dispatch(payload).await })
                    .await;
                if let Err(e) = result {
                    debug!("Could not answer request #{}: {}", sequence, e);
                }
            });
        }

        let reason = messenger
            .close_reason()
            .unwrap_or_else(|| "closed".to_string());
        info!("Connection closed: {}", reason);
        Ok(())
    }

    /// Close the connection and let running tasks finish.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(messenger) = self.messenger() {
            messenger.close("provider shutting down");
        }
        self.abort_connection_tasks();
        info!("Waiting for running tasks to finish");
        self.inner.pool.scale(0).await?;
        Ok(())
    }

    /// Terminate every executor immediately.
    pub fn killall(&self) {
        if let Some(messenger) = self.messenger() {
            messenger.close("provider killed");
        }
        self.inner.pool.killall();
    }

    fn abort_connection_tasks(&self) {
        if let Ok(mut connection) = self.inner.connection.lock() {
            for handle in connection.drain(..) {
                handle.abort();
            }
        }
    }
}

fn resources(snapshot: PoolSnapshot) -> ProviderResources {
    ProviderResources {
        concurrency: snapshot.pool_size as u32,
        tasks: snapshot.active_tasks as u32,
    }
}

fn current(messenger: &MessengerSlot) -> Option<Arc<Messenger>> {
    messenger
        .read()
        .ok()
        .and_then(|m| m.clone())
        .filter(|m| !m.is_closed())
}

/// Send the latest pool snapshot; intermediate ones may be skipped.
async fn forward_resources(mut snapshots: watch::Receiver<PoolSnapshot>, messenger: MessengerSlot) {
    while snapshots.changed().await.is_ok() {
        let snapshot = *snapshots.borrow_and_update();
        let Some(messenger) = current(&messenger) else {
            continue;
        };
        if let Err(e) = messenger.send_event(resources(snapshot)).await {
            debug!("Dropped resources update: {}", e);
        }
    }
}

async fn forward_storage(
    mut updates: broadcast::Receiver<crate::store::StorageUpdate>,
    messenger: MessengerSlot,
) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Skipped {} storage updates", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(messenger) = current(&messenger) else {
            continue;
        };
        let event = FileSystemUpdate {
            added: update.added,
            removed: update.removed,
        };
        if let Err(e) = messenger.send_event(event).await {
            debug!("Dropped storage update: {}", e);
        }
    }
}

async fn log_events(messenger: Arc<Messenger>) {
    while let Some(event) = messenger.next_event().await {
        debug!("Event #{}: {:?}", event.sequence, event.payload);
    }
}
