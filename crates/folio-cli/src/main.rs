use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use folio_core::{CaptureOutcome, ReconcileSummary};
use folio_storage::PgCatalog;
use folio_sync::{FeedCache, SyncConfig, SyncService, FEED_CACHE_KEY};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "folio-cli")]
#[command(about = "Developer portfolio directory command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed, reconcile the catalog, and capture screenshots.
    Sync {
        /// Reuse a fresh-enough cached feed payload instead of refetching.
        #[arg(long)]
        cached: bool,
    },
    /// Capture screenshots for the current active entries only.
    Capture,
    /// Apply pending database migrations.
    Migrate,
    /// Run recurring tasks from recurring.yaml until interrupted.
    Schedule,
    /// Drop the cached feed payload.
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { cached: false }) {
        Commands::Sync { cached } => {
            let service = SyncService::from_env().await?;
            let summary = if cached {
                service.run_reconcile_cached().await?
            } else {
                service.run_reconcile().await?
            };
            print_summary(&summary);
            let outcomes = service.run_captures().await?;
            print_outcomes(&outcomes);
        }
        Commands::Capture => {
            let service = SyncService::from_env().await?;
            let outcomes = service.run_captures().await?;
            print_outcomes(&outcomes);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let catalog = PgCatalog::connect(&config.database_url).await?;
            catalog.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let service = Arc::new(SyncService::from_env().await?);
            match service.maybe_build_scheduler().await? {
                Some(mut sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!("scheduler running; press ctrl-c to stop");
                    shutdown_signal().await;
                    sched.shutdown().await.context("stopping scheduler")?;
                }
                None => {
                    println!("scheduler disabled; set FOLIO_SCHEDULER_ENABLED=1 to enable");
                }
            }
        }
        Commands::ClearCache => {
            let config = SyncConfig::from_env();
            let cache = FeedCache::new(
                config.cache_dir.clone(),
                Duration::from_secs(config.feed_cache_ttl_secs),
            );
            cache.clear(FEED_CACHE_KEY).await?;
            println!("cleared cached feed payload");
        }
    }

    Ok(())
}

fn print_summary(summary: &ReconcileSummary) {
    println!(
        "sync complete: run_id={} items={} created={} updated={} reactivated={} deactivated={} skipped_invalid={} failures={}",
        summary.run_id,
        summary.total_items,
        summary.created,
        summary.updated,
        summary.reactivated,
        summary.deactivated,
        summary.skipped_invalid,
        summary.failures.len()
    );
    for failure in &summary.failures {
        println!("  failed item: {} ({}): {}", failure.name, failure.url, failure.reason);
    }
}

fn print_outcomes(outcomes: &[CaptureOutcome]) {
    let captured = outcomes.iter().filter(|o| o.succeeded()).count();
    println!(
        "captures complete: captured={} of {}",
        captured,
        outcomes.len()
    );
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install ctrl-c signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
