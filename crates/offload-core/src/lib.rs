//! Offload Core - provider runtime for a compute-offload platform.
//!
//! A broker dispatches sandboxed tasks to many providers. This crate is the
//! provider side: it multiplexes RPCs and events over one connection, runs
//! tasks on a bounded pool of executors and resolves task inputs through a
//! cached content store.
//!
//! # Example
//!
//! ```rust,ignore
//! use offload_core::{Provider, ProviderConfig, TcpTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> offload_core::Result<()> {
//!     let config = ProviderConfig::default();
//!     let provider = Provider::builder(config.clone()).build().await?;
//!
//!     let addr = config.broker_socket_addr()?;
//!     let transport = TcpTransport::connect(&addr, &config.encodings).await?;
//!     provider.connect(Arc::new(transport)).await?;
//!     provider.handle_requests().await
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod messenger;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{CacheBudget, ProviderConfig};
pub use error::{ProviderError, Result};
pub use executor::{CommandExecutor, CommandExecutorFactory};
pub use messenger::{InboundEvent, Messenger, PendingCall};
pub use pool::{Executor, ExecutorFactory, PoolSnapshot, TaskParams, WorkerInfo, WorkerPool};
pub use protocol::{Codec, Envelope, MessageType, Payload};
pub use provider::{Provider, ProviderBuilder};
pub use store::{ContentStore, DirectoryFileStore, FileStore, MemoryFileStore, StoredFile};
pub use transport::{MemoryTransport, PeerTransport, TcpTransport, Transmit, Transport};
