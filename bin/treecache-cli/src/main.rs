//! treecache CLI - operator command line
//!
//! Opens a redb-backed store and runs one command against it. Commands that
//! write flush the cache before exiting; `serve` keeps the background tasks
//! running until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use treecache_common::{CacheConfig, LogicalTime};
use treecache_kv::RedbKv;
use treecache_store::Store;

#[derive(Parser, Debug)]
#[command(name = "treecache-cli")]
#[command(about = "treecache operator CLI")]
#[command(version)]
struct Args {
    /// Backing database file
    #[arg(short, long, default_value = "treecache.redb", env = "TREECACHE_DB")]
    db: PathBuf,

    /// Cache configuration file (TOML)
    #[arg(short, long, env = "TREECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a value
    Get {
        key: String,
        /// Print the value parsed as JSON
        #[arg(long)]
        json: bool,
        /// Also print the logical time of the write
        #[arg(long)]
        time: bool,
    },
    /// Write a value and flush it
    Set {
        key: String,
        value: String,
        /// Logical time (defaults to now)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        op_time: LogicalTime,
        /// Only write if the key holds no value
        #[arg(long)]
        if_absent: bool,
    },
    /// Delete a value and flush the tombstone
    Delete {
        key: String,
        /// Logical time (defaults to now)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        op_time: LogicalTime,
    },
    /// List keys matching a pattern (`a.b.*`, `a.>`, `a.b`)
    Keys { pattern: String },
    /// Write barrier operations
    Barrier {
        #[command(subcommand)]
        action: BarrierCommands,
    },
    /// Run the ingestion and lazy writer tasks until Ctrl-C, then print
    /// the cache metrics in Prometheus format
    Serve {
        /// Print changes to the direct children of this pattern (`a.b.*`)
        #[arg(long)]
        watch: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BarrierCommands {
    /// Reject writes newer than a timestamp
    Lock {
        /// Barrier timestamp (defaults to now)
        #[arg(default_value_t = -1, allow_hyphen_values = true)]
        timestamp: LogicalTime,
    },
    /// Release the barrier
    Unlock,
    /// Show the barrier state
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(CacheConfig::default()),
    }
}

/// Write pending changes to the backing store before exit
async fn flush(store: &Store) -> Result<()> {
    let report = store.run_sync_cycle().await;
    if report.failed > 0 {
        anyhow::bail!("{} writes could not be flushed", report.failed);
    }
    Ok(())
}

async fn serve(store: &Arc<Store>, watch: Option<&str>) -> Result<()> {
    store.start().await?;

    let printer = match watch {
        Some(pattern) => {
            let mut rx = store.subscribe_level_callback(pattern, "cli")?;
            let prefix = pattern.trim_end_matches('*').to_string();
            Some(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event.value {
                        Some(value) => println!(
                            "set {}{} = {}",
                            prefix,
                            event.token,
                            String::from_utf8_lossy(&value)
                        ),
                        None => println!("del {}{}", prefix, event.token),
                    }
                }
            }))
        }
        None => None,
    };

    info!("Serving {}; press Ctrl-C to stop", store.config().id);
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    if let Some(pattern) = watch {
        store.unsubscribe_level_callback(pattern, "cli")?;
    }
    store.destroy().await;
    if let Some(printer) = printer {
        printer.abort();
    }
    if let Err(e) = flush(store).await {
        warn!("{}", e);
    }
    print!("{}", store.metrics().export_prometheus(&store.config().id));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_ref())?;
    let backend = RedbKv::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?;
    let store = Store::new(config, Arc::new(backend))?;

    match args.command {
        Commands::Get { key, json, time } => {
            if json {
                let value = store.get_value_as_json(&key).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                let (value, written_at) = store.get_value_with_record_time(&key).await?;
                if time {
                    println!("{}\t{}", written_at, String::from_utf8_lossy(&value));
                } else {
                    println!("{}", String::from_utf8_lossy(&value));
                }
            }
        }
        Commands::Set {
            key,
            value,
            op_time,
            if_absent,
        } => {
            let applied = if if_absent {
                store
                    .set_value_if_does_not_exist(&key, value, true, op_time)
                    .await?
            } else {
                store.set_value_kv_sync(&key, value, op_time).await?
            };
            flush(&store).await?;
            if !applied {
                println!("{key}: not written (newer value or already present)");
            }
        }
        Commands::Delete { key, op_time } => {
            if !store.delete_value_kv_sync(&key, op_time).await? {
                println!("{key}: newer value recorded, not deleted");
            }
            flush(&store).await?;
        }
        Commands::Keys { pattern } => {
            // an empty tree only answers patterns once the records are loaded
            store.start().await?;
            let keys = store.get_keys_by_pattern(&pattern).await;
            store.destroy().await;
            for key in keys? {
                println!("{key}");
            }
        }
        Commands::Barrier { action } => match action {
            BarrierCommands::Lock { timestamp } => {
                let timestamp = treecache_common::resolve_op_time(timestamp);
                store.lock_write_barrier(timestamp).await?;
                println!("Barrier published at {timestamp}");
            }
            BarrierCommands::Unlock => {
                store.unlock_write_barrier().await?;
                println!("Barrier released");
            }
            BarrierCommands::Status => {
                let state = store.write_barrier_state().await;
                println!("Status:    {:?}", state.status);
                println!("Timestamp: {}", state.barrier_timestamp);
            }
        },
        Commands::Serve { watch } => serve(&store, watch.as_deref()).await?,
    }

    Ok(())
}
