use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use mvil_core::RawPosting;
use mvil_storage::PgStore;
use mvil_sync::{export_baseline_snapshots, InsightsService, MvilConfig, RefreshMode, RefreshOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "mvil-cli")]
#[command(about = "MVIL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a JSON array of raw postings.
    Ingest {
        #[arg(long)]
        file: PathBuf,
        /// Run an opportunistic refresh once the batch is in.
        #[arg(long)]
        refresh: bool,
    },
    /// Recompute every role baseline.
    Refresh {
        /// Ignore the cooldown.
        #[arg(long)]
        force: bool,
    },
    /// Mark canonical postings unseen for this many days inactive.
    Deactivate {
        #[arg(long)]
        days: i64,
    },
    /// Write the current baselines as parquet plus a manifest.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MvilConfig::from_env();
    let store = Arc::new(
        PgStore::connect(&config.database_url, DB_MAX_CONNECTIONS)
            .await
            .context("connecting to postgres")?,
    );

    let taxonomy = config.load_taxonomy()?;
    let service = InsightsService::new(config, taxonomy, store.clone(), store.clone());

    match cli.command.unwrap_or(Commands::Refresh { force: false }) {
        Commands::Ingest { file, refresh } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let raws: Vec<RawPosting> = serde_json::from_str(&text)
                .with_context(|| format!("parsing raw postings from {}", file.display()))?;
            let (summary, outcome) = service.ingest_batch(raws, refresh).await;
            println!(
                "ingest complete: accepted={} unique={} duplicates={} failed={}",
                summary.accepted,
                summary.unique,
                summary.duplicates,
                summary.failed.len()
            );
            for failure in &summary.failed {
                println!("  failed {}: {}", failure.url, failure.error);
            }
            if let Some(outcome) = outcome {
                print_outcome(&outcome);
            }
        }
        Commands::Refresh { force } => {
            let cancel = cancel_on_ctrl_c();
            let mode = if force {
                RefreshMode::Forced
            } else {
                RefreshMode::Opportunistic
            };
            let outcome = service.refresh.refresh(mode, &cancel).await?;
            print_outcome(&outcome);
        }
        Commands::Deactivate { days } => {
            let cutoff = Utc::now() - Duration::days(days);
            let count = service.corpus.deactivate_stale(cutoff).await?;
            println!("deactivated {count} postings last seen before {cutoff}");
        }
        Commands::Export { out } => {
            let dir = out.unwrap_or_else(|| service.config.export_dir.clone());
            let set = service.baselines.current_baselines().await?;
            let run = service.baselines.last_successful_run().await?;
            let manifest = export_baseline_snapshots(&dir, &set, run.as_ref()).await?;
            println!("export complete: manifest={}", manifest.display());
        }
        Commands::Serve => {
            let shutdown = cancel_on_ctrl_c();
            let scheduler = service.maybe_build_scheduler(shutdown.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting refresh scheduler")?;
                info!(cron = %service.config.refresh_cron, "refresh scheduler started");
            }
            let port = service.config.web_port;
            let state = mvil_web::AppState {
                service,
                shutdown: shutdown.clone(),
            };
            mvil_web::serve(state, port, shutdown.clone().cancelled_owned()).await?;
            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler did not shut down cleanly");
                }
            }
        }
        Commands::Migrate => {
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

/// Token cancelled on the first Ctrl-C; in-flight refreshes abort without committing.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            child.cancel();
        }
    });
    token
}

fn print_outcome(outcome: &RefreshOutcome) {
    match outcome {
        RefreshOutcome::Completed(summary) => {
            println!(
                "refresh complete: run_id={} families={} rows={} duration_ms={}",
                summary.run_id, summary.families_processed, summary.rows_written, summary.duration_ms
            );
            if !summary.low_confidence_families.is_empty() {
                println!("  low confidence: {}", summary.low_confidence_families.join(", "));
            }
        }
        RefreshOutcome::Skipped { last_run_at } => {
            println!("refresh skipped: last run at {last_run_at} is within the cooldown");
        }
    }
}
