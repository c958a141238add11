//! hashsync CLI - differential table synchronization over hashed key ranges.
//!
//! `sync` runs both endpoints in-process against JSON fixtures (the
//! in-memory engine); `from` serves the source responder over stdio so an
//! external orchestrator can drive the engine across a pipe or SSH.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hashsync::drivers::memory::MemoryDb;
use hashsync::worker::SourceWorker;
use hashsync::{sync_from, sync_to, Endpoint, HashAlgorithm, SyncError, SyncOptions};
use tokio::io::{duplex, split};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hashsync")]
#[command(about = "Synchronize table contents by exchanging hashes over key ranges")]
#[command(version)]
struct Cli {
    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "warn")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize one fixture database into another, in-process
    Sync {
        /// Source fixture (JSON), the end that wins
        #[arg(long)]
        from: PathBuf,

        /// Destination fixture (JSON), rewritten on success
        #[arg(long)]
        to: PathBuf,

        /// Number of concurrent workers at each end
        #[arg(long, default_value = "1")]
        workers: usize,

        /// Target bytes per hash/rows exchange unit
        #[arg(long)]
        block_size: Option<u64>,

        /// Range-hash algorithm: md5 or xxh64
        #[arg(long, default_value = "md5")]
        algorithm: String,

        /// Comma-separated list of tables to ignore
        #[arg(long)]
        ignore: Option<String>,

        /// Comma-separated list restricting which tables to sync
        #[arg(long)]
        only: Option<String>,

        /// Attempt to commit changes even if some workers hit errors
        #[arg(long)]
        partial: bool,

        /// Roll back at the end instead of committing
        #[arg(long)]
        rollback_after: bool,

        /// Skip snapshot sharing between workers
        #[arg(long)]
        no_snapshot: bool,
    },

    /// Serve the source responder over stdin/stdout
    From {
        /// Source fixture (JSON)
        #[arg(long)]
        fixture: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity);

    match cli.command {
        Commands::Sync {
            from,
            to,
            workers,
            block_size,
            algorithm,
            ignore,
            only,
            partial,
            rollback_after,
            no_snapshot,
        } => {
            let algorithm: HashAlgorithm = algorithm.parse()?;
            let mut options = SyncOptions {
                algorithm,
                ignore_tables: name_set(ignore.as_deref()),
                only_tables: name_set(only.as_deref()),
                snapshot: !no_snapshot,
                partial,
                rollback_after,
                ..Default::default()
            };
            if let Some(block_size) = block_size {
                options.target_block_size = block_size;
            }
            if workers == 0 {
                return Err(SyncError::protocol("--workers must be at least 1"));
            }

            let source = MemoryDb::from_json(&std::fs::read_to_string(&from)?)?;
            let dest = MemoryDb::from_json(&std::fs::read_to_string(&to)?)?;

            let mut src_endpoints = Vec::new();
            let mut dst_endpoints = Vec::new();
            for _ in 0..workers {
                let (dest_stream, src_stream) = duplex(1 << 20);
                let (dest_in, dest_out) = split(dest_stream);
                let (src_in, src_out) = split(src_stream);
                dst_endpoints.push(Endpoint::new(dest.client(), dest_in, dest_out));
                src_endpoints.push(Endpoint::new(source.client(), src_in, src_out));
            }

            let responder = tokio::spawn(sync_from(src_endpoints));
            let stats = sync_to(dst_endpoints, options).await?;
            responder.await.map_err(|e| SyncError::database(e.to_string()))??;

            if !rollback_after {
                std::fs::write(&to, dest.to_json())?;
            }
            info!(
                tables = stats.tables,
                hash_commands = stats.hash_commands,
                rows_commands = stats.rows_commands,
                rows_changed = stats.rows_changed,
                "finished syncing"
            );
            println!(
                "synced {} tables, {} rows changed ({} hash / {} rows exchanges)",
                stats.tables, stats.rows_changed, stats.hash_commands, stats.rows_commands
            );
            Ok(())
        }

        Commands::From { fixture } => {
            let source = MemoryDb::from_json(&std::fs::read_to_string(&fixture)?)?;
            let worker = SourceWorker::new(source.client(), tokio::io::stdin(), tokio::io::stdout());
            worker.run().await
        }
    }
}

fn name_set(list: Option<&str>) -> BTreeSet<String> {
    list.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn setup_logging(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hashsync={}", verbosity)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
