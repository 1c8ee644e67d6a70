//! Operator CLI for the tree mirror
//!
//! Loads an engine configuration and a JSON snapshot of the content tree, then
//! runs one administrative command against the mirror database.
//!
//! # Usage
//!
//! ```bash
//! treemirror <config.json> <snapshot.json> <command>
//! ```
//!
//! Commands:
//!
//! - `reindex` - truncate and rebuild the mirror
//! - `reconcile` - apply one periodic update
//! - `serve` - run the periodic scheduler until Ctrl-C
//! - `status` - print the current state as JSON
//! - `history` - print the most recent state records
//! - `reset` - clear the state log
//! - `disable` / `enable` - halt or resume synchronization
//!
//! Logging follows `RUST_LOG`, defaulting to `info`.

use anyhow::{bail, Context};
use std::sync::Arc;
use treemirror_core::services::{ReconcileOutcome, ReindexOutcome};
use treemirror_core::tree::InMemoryTree;
use treemirror_core::{SyncConfig, SyncEngine};

const USAGE: &str = "usage: treemirror <config.json> <snapshot.json> \
                     <reindex|reconcile|serve|status|history|reset|disable|enable>";

const HISTORY_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [config_path, snapshot_path, command] = args.as_slice() else {
        eprintln!("{}", USAGE);
        bail!("expected 3 arguments, got {}", args.len());
    };

    let config = SyncConfig::from_json_file(config_path)
        .with_context(|| format!("loading configuration {}", config_path))?;
    let tree = InMemoryTree::from_json_file(snapshot_path)
        .with_context(|| format!("loading tree snapshot {}", snapshot_path))?;
    let engine = SyncEngine::new(config, Arc::new(tree))
        .await
        .context("opening the mirror database")?;

    match command.as_str() {
        "reindex" => match engine.reindexer().run().await {
            ReindexOutcome::Completed(report) => println!(
                "Re-indexed {} nodes and {} properties in {:.2}s",
                report.walk.visited,
                report.properties,
                report.elapsed.as_secs_f64()
            ),
            ReindexOutcome::Rejected(state) => bail!("re-index locked, state is {}", state),
            ReindexOutcome::Failed(message) => bail!("re-index failed: {}", message),
        },
        "reconcile" => match engine.reconciler().run_once().await {
            ReconcileOutcome::Completed(report) => println!(
                "Applied {} queued changes, {} nodes from the modified-since scan",
                report.drained, report.scanned
            ),
            ReconcileOutcome::Skipped(reason) => println!("Skipped: {}", reason),
            ReconcileOutcome::Failed(message) => bail!("periodic update failed: {}", message),
        },
        "serve" => {
            let Some(handle) = engine.start_periodic() else {
                bail!("periodic updates are disabled in the configuration");
            };
            println!("Periodic reconciler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            handle.shutdown().await;
        }
        "status" => {
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "history" => {
            for record in engine.history(HISTORY_LIMIT).await? {
                println!(
                    "{:>6}  {}  {:<16} {}",
                    record.id,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.state.as_str(),
                    record.message
                );
            }
        }
        "reset" => {
            let removed = engine.reset_state().await?;
            println!("Removed {} state records", removed);
        }
        "disable" => {
            engine.disable().await?;
            println!("Synchronization disabled");
        }
        "enable" => {
            engine.enable().await?;
            println!("Synchronization enabled");
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("unknown command `{}`", other);
        }
    }

    Ok(())
}
