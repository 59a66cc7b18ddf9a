//! Inspects the replication spool of a distributed table.
//!
//! ```bash
//! # Pending entries per shard
//! fathom-spoolctl --data-path /var/lib/fathom --table hits_all list
//!
//! # Re-read every entry and report corruption
//! fathom-spoolctl --data-path /var/lib/fathom --table hits_all verify
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fathom_distributed::{escape_for_file_name, parse_shard_dir_name, QueuedBatch};
use fathom_spool::{Spool, SpoolConfig, Storage, TokioStorage};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Replication spool inspector.
#[derive(Parser, Debug)]
#[command(name = "fathom-spoolctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data path of the server.
    #[arg(long)]
    data_path: PathBuf,

    /// Distributed table name (unescaped).
    #[arg(long)]
    table: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// List shard spools with pending counts and sequence ranges.
    List,
    /// Re-read every pending entry and report the ones that fail checks.
    Verify,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let storage = Arc::new(TokioStorage);
    let root = args.data_path.join(escape_for_file_name(&args.table));
    if !storage.exists(&root).await? {
        error!(root = %root.display(), "no spool for table");
        return Ok(ExitCode::FAILURE);
    }
    info!(root = %root.display(), command = ?args.command, "scanning spool");

    let mut corrupt = 0_u64;
    for dir in storage.list_dirs(&root).await? {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let replicas = parse_shard_dir_name(&name).map_or_else(
            || "?".to_string(),
            |r| r.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        );
        // Read-only: the server may be appending to this spool right now.
        let spool = Spool::inspect(Arc::clone(&storage), SpoolConfig::new(&dir)).await?;

        match args.command {
            Command::List => {
                let summary = spool.summary().await?;
                let range = match (summary.first, summary.last) {
                    (Some(first), Some(last)) => format!("{}..={}", first.get(), last.get()),
                    _ => "-".to_string(),
                };
                println!(
                    "{name}\treplicas={replicas}\tpending={}\tseq={range}\tbroken={}",
                    summary.pending, summary.broken
                );
            }
            Command::Verify => {
                for pending in spool.pending().await? {
                    let check = match spool.read(&pending).await {
                        Ok(entry) => QueuedBatch::decode(entry.payload)
                            .map(|_| ())
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    if let Err(reason) = check {
                        corrupt += 1;
                        println!("{}\t{reason}", pending.path.display());
                    }
                }
            }
        }
    }

    if corrupt > 0 {
        error!(corrupt, "spool verification failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
