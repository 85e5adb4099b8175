use std::sync::Arc;

use adwatch_sync::{attach_status_sink, Engine, LoggingStatusSink};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adwatch")]
#[command(about = "Marketplace ad watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule every active watcher and run until Ctrl-C.
    Run,
    /// Run a single tick for one watcher and print its report.
    ///
    /// Each invocation starts with an empty cache, so this tick is always a
    /// first run: it seeds silently and never sends notifications.
    Once { watcher_id: String },
    /// Check schedules, marketplaces and query settings.
    Validate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ADWATCH_LOG_JSON").is_ok_and(|v| matches!(v.as_str(), "1" | "true"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let engine = Engine::from_env().await?;
    attach_status_sink(&engine.bus, Arc::new(LoggingStatusSink));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&engine).await?,
        Commands::Once { watcher_id } => {
            let watcher = engine
                .watcher(&watcher_id)
                .with_context(|| format!("no watcher named {watcher_id}"))?
                .clone();
            let report = engine.scheduler.run_watcher_once(&watcher).await?;
            let summary = json!({
                "watcherId": report.watcher_id,
                "firstRun": report.first_run,
                "fetched": report.fetched,
                "matched": report.matched,
                "seeded": report.seeded,
                "newAds": report.new_ads,
                "failedQueries": report.failed_queries,
                "cacheSize": engine.cache.size(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Validate => {
            let issues = engine.validate();
            if issues.is_empty() {
                println!("{} watchers ok", engine.workspace.watchers.len());
            } else {
                for issue in &issues {
                    eprintln!("{}: {}", issue.watcher_id, issue.message);
                }
                bail!("{} configuration issue(s)", issues.len());
            }
        }
    }

    Ok(())
}

async fn run(engine: &Engine) -> Result<()> {
    if !engine.config.scheduler_enabled {
        warn!("scheduler disabled via ADWATCH_SCHEDULER_ENABLED; nothing to run");
        return Ok(());
    }

    let started = engine.scheduler.start_all(&engine.workspace.watchers).await;
    engine.scheduler.start().await.context("starting scheduler")?;
    info!(started, "watchers scheduled");
    for status in engine.scheduler.job_status().await {
        info!(watcher_id = %status.id, next_run = ?status.next_run, "next run");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    engine.scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
