//! StrataStor node storage tool
//!
//! Opens the shards described by an engine configuration file and runs one
//! administrative operation against them.
//!
//! ```text
//! stratastor --config /etc/stratastor/engine.yaml info
//! stratastor --config engine.yaml status <container>/<object>
//! stratastor --config engine.yaml restore <shard-id> shard.dump --ignore-errors
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratastor::engine::EngineCursor;
use stratastor::{
    Address, AtomicEpoch, ContainerId, EngineConfig, EngineOptions, Error, Mode, ReadOptions, ShardId,
    StorageEngine,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StrataStor - local object storage engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file
    #[arg(short, long, env = "STRATASTOR_CONFIG")]
    config: PathBuf,

    /// Network epoch the engine starts at
    #[arg(long, env = "STRATASTOR_EPOCH", default_value = "0")]
    epoch: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the state of every shard
    Info,

    /// Show where every shard keeps an object
    Status { address: Address },

    /// Print an object header, optionally saving its payload
    Get {
        address: Address,

        /// Write the payload to this file
        #[arg(long)]
        out: Option<PathBuf>,

        /// Report split info instead of resolving a split parent
        #[arg(long)]
        raw: bool,
    },

    /// List available objects
    List {
        /// Objects fetched per page
        #[arg(long, default_value = "100")]
        count: usize,
    },

    /// Payload volume of a container
    ContainerSize { container: ContainerId },

    /// Erase a container from every shard right away
    DeleteContainer { container: ContainerId },

    /// Mark every object of a container for collection
    InhumeContainer { container: ContainerId },

    /// Switch a shard's mode
    SetMode {
        shard: ShardId,
        mode: Mode,

        /// Clear the shard's error counter too
        #[arg(long)]
        reset_errors: bool,
    },

    /// Write every object of a shard to a new dump file
    Dump {
        shard: ShardId,
        path: PathBuf,

        #[arg(long)]
        ignore_errors: bool,
    },

    /// Put every object of a dump file into a shard
    Restore {
        shard: ShardId,
        path: PathBuf,

        #[arg(long)]
        ignore_errors: bool,
    },

    /// Advance the epoch and collect what expired
    Epoch { epoch: u64 },

    /// Erase one batch of garbage in every shard
    Gc,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = EngineConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if config.shards.is_empty() {
        bail!("{} describes no shards", args.config.display());
    }

    let options = EngineOptions {
        epoch: Arc::new(AtomicEpoch::new(args.epoch)),
        containers: None,
    };
    let engine = StorageEngine::from_config(config, options)
        .await
        .context("opening shards")?;
    engine.init().await.context("initializing engine")?;
    info!(shards = engine.shard_ids().len(), "Engine ready");

    let res = run(&engine, args.command).await;
    engine.close().await.context("closing engine")?;
    res
}

async fn run(engine: &StorageEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Info => print_json(&engine.dump_info().await)?,
        Command::Status { address } => print_json(&engine.object_status(&address).await?)?,
        Command::Get { address, out, raw } => {
            let opts = ReadOptions {
                raw,
                ..Default::default()
            };
            match out {
                Some(path) => {
                    let object = engine.get(&address, opts).await?;
                    tokio::fs::write(&path, &object.payload)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    print_json(&object.header)?;
                }
                None => match engine.head(&address, opts).await {
                    Ok(header) => print_json(&header)?,
                    Err(Error::SplitInfo(info)) => print_json(&info)?,
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Command::List { count } => {
            let mut cursor: Option<EngineCursor> = None;
            loop {
                match engine.list_with_cursor(count, cursor).await {
                    Ok((page, next)) => {
                        for item in page {
                            println!("{} {}", item.address, item.object_type);
                        }
                        cursor = Some(next);
                    }
                    Err(Error::EndOfListing) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Command::ContainerSize { container } => {
            println!("{}", engine.container_size(&container).await?);
        }
        Command::DeleteContainer { container } => engine.delete_container(&container).await?,
        Command::InhumeContainer { container } => {
            let removed = engine.inhume_container(&container).await?;
            println!("{} objects inhumed", removed);
        }
        Command::SetMode {
            shard,
            mode,
            reset_errors,
        } => engine.set_shard_mode(&shard, mode, reset_errors).await?,
        Command::Dump {
            shard,
            path,
            ignore_errors,
        } => {
            let count = engine.dump_shard(&shard, &path, ignore_errors).await?;
            println!("{} objects written to {}", count, path.display());
        }
        Command::Restore {
            shard,
            path,
            ignore_errors,
        } => {
            let stats = engine.restore_shard(&shard, &path, ignore_errors).await?;
            println!("{} objects restored, {} failed", stats.restored, stats.failed);
        }
        Command::Epoch { epoch } => {
            let count = engine.collect_expired(epoch).await?;
            println!("epoch {}: {} expired records collected", engine.epoch(), count);
        }
        Command::Gc => {
            let count = engine.collect_garbage().await?;
            println!("{} objects erased", count);
        }
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("sled=warn".parse().unwrap_or_else(|_| level.into()));

    // logs go to stderr, command output to stdout
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
