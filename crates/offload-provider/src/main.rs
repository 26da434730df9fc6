//! Offload Provider - connects to a broker and executes offloaded tasks.
//!
//! The first Ctrl-C closes the connection and waits for running tasks; a
//! second one terminates them.

use anyhow::{Context, Result};
use clap::Parser;
use offload_core::{Codec, Provider, ProviderConfig, TcpTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "offload-provider")]
#[command(about = "Serve compute tasks for an offload broker")]
struct Args {
    /// Broker URL (tcp://host:port or http(s)://host:port)
    #[arg(short, long, default_value = "http://localhost:4080")]
    url: String,

    /// Number of executors (defaults to the available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Name announced to the broker
    #[arg(long)]
    name: Option<String>,

    /// Directory for stored files (files are kept in memory if unset)
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Store files in the user data directory
    #[arg(long, conflicts_with = "storage_dir")]
    persist: bool,

    /// Origin to fetch missing files from (defaults to the broker's origin)
    #[arg(long)]
    origin: Option<String>,

    /// Sandbox runtime command
    #[arg(long, default_value = "wasmtime")]
    runtime: String,

    /// Argument passed to the runtime before the module path (repeatable)
    #[arg(long = "runtime-arg", allow_hyphen_values = true)]
    runtime_args: Vec<String>,

    /// Replace each executor after every task (for runtimes that leak state)
    #[arg(long)]
    respawn_after_task: bool,

    /// Encoding offered to the broker, in order of preference (repeatable)
    #[arg(long = "encoding")]
    encodings: Vec<Codec>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> ProviderConfig {
        let defaults = ProviderConfig::default();
        let storage_dir = match (self.storage_dir, self.persist) {
            (Some(dir), _) => Some(dir),
            (None, true) => dirs::data_local_dir().map(|d| d.join("offload-provider").join("storage")),
            (None, false) => None,
        };
        ProviderConfig {
            broker_url: self.url,
            name: self.name.unwrap_or(defaults.name),
            workers: self.workers.unwrap_or(defaults.workers),
            storage_dir,
            storage_origin: self.origin,
            runtime: self.runtime,
            runtime_args: if self.runtime_args.is_empty() {
                defaults.runtime_args
            } else {
                self.runtime_args
            },
            encodings: if self.encodings.is_empty() {
                defaults.encodings
            } else {
                self.encodings
            },
            respawn_after_task: self.respawn_after_task,
            module_cache: defaults.module_cache,
            archive_cache: defaults.archive_cache,
        }
    }
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let config = args.into_config();
    config.validate().context("invalid configuration")?;
    if let Some(dir) = &config.storage_dir {
        info!("Storage directory: {}", dir.display());
    }

    let provider = Provider::builder(config.clone())
        .build()
        .await
        .context("failed to start provider")?;

    let addr = config.broker_socket_addr()?;
    let transport = TcpTransport::connect(&addr, &config.encodings)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    info!("Negotiated {} encoding", transport.codec());
    provider.connect(Arc::new(transport)).await?;

    // intentional stdout for wrapper scripts
    println!("Provider {} connected to {}", provider.name(), addr);

    tokio::select! {
        result = provider.handle_requests() => {
            result?;
            warn!("Broker closed the connection");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, waiting for running tasks (Ctrl-C again to kill)");
        }
    }

    let killer = {
        let provider = provider.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second signal received, killing all executors");
                provider.killall();
            }
        })
    };
    provider.shutdown().await?;
    killer.abort();

    info!("Provider stopped");
    Ok(())
}
