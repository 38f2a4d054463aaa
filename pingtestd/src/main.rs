//! Pingtest daemon.
//!
//! Keeps one recurring ping job registered per active scenario, runs the
//! cache refresh and result cleanup jobs, and persists every ping outcome
//! to SQLite.

#![forbid(unsafe_code)]

mod cache;
mod engine;
mod jobs;
mod maintenance;
mod ping;
mod reconcile;
mod registry;
mod session;
mod store;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use pingtest_common::config::FileConfig;
use pingtest_common::logging::{LogOptions, init_logging};
use pingtest_common::{Backend, JOB_NAMESPACE, Outcome, PingtestConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cache::ResultCache;
use engine::TestEngine;
use jobs::JobContext;
use reconcile::Reconciler;
use registry::{CronRegistry, JobRegistry};
use session::BackendConnector;
use store::Store;

#[derive(Parser)]
#[command(name = "pingtestd")]
#[command(author, version, about = "Pingtest daemon - scheduled ping tests from network devices")]
struct Cli {
    /// Delete every scheduled job and exit
    #[arg(long)]
    stop: bool,

    /// Run every active scenario once and exit
    #[arg(long, conflicts_with = "stop")]
    run_once: bool,

    /// Print the cached recent results the dashboard reads and exit
    #[arg(long, conflicts_with_all = ["stop", "run_once"])]
    show_cache: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, env = "PINGTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the SQLite database
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds between scenario polls
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    poll_interval: Option<u64>,

    /// How device sessions are opened (ssh or telnet)
    #[arg(long)]
    backend: Option<Backend>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log JSON lines instead of text
    #[arg(long)]
    log_json: bool,

    /// Also write daily-rotated log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir: cli.log_dir.clone(),
    });

    if cli.stop {
        return stop(&cli).await;
    }
    if cli.show_cache {
        return show_cache(&cli).await;
    }

    let mut config = PingtestConfig::load_with_backend(cli.config.as_deref(), cli.backend)
        .context("Failed to load configuration")?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
        config.mark_cli("db_path");
    }
    if let Some(secs) = cli.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
        config.mark_cli("poll_interval");
    }
    if config.backend == Backend::SshTunnel && config.ssh.is_none() {
        bail!("ssh backend selected but no jump host is configured");
    }
    for (setting, source) in &config.sources {
        debug!("Config {} from {}", setting, source);
    }

    info!(
        "Starting pingtest daemon (backend={}, db={:?}, poll={}s)",
        config.backend,
        config.db_path,
        config.poll_interval.as_secs()
    );

    let store = open_store(config.db_path.clone()).await?;
    match store.call(|store| store.count_results()).await {
        Ok(count) => info!("Database holds {} results", count),
        Err(e) => warn!("Could not count stored results: {}", e),
    }
    let engine = TestEngine::new(BackendConnector::from_config(&config), config.telnet.clone());
    let context = Arc::new(JobContext::new(
        engine,
        store.clone(),
        ResultCache::new(store.clone()),
    ));

    if cli.run_once {
        return run_once(&context).await;
    }

    let registry = Arc::new(
        CronRegistry::new(store.clone(), context)
            .await
            .context("Failed to create job runner")?,
    );
    maintenance::schedule_cleanup(registry.as_ref())
        .await
        .context("Failed to schedule result cleanup")?;
    maintenance::schedule_cache_refresh(registry.as_ref())
        .await
        .context("Failed to schedule cache refresh")?;
    registry.start().await.context("Failed to start job runner")?;
    info!("Maintenance jobs: {:?}", registry.names().await?);

    let cancel = CancellationToken::new();
    let mut poll_loop =
        Reconciler::new(registry.clone()).start(store, config.poll_interval, cancel.clone());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down");
            cancel.cancel();
            if let Err(e) = poll_loop.await {
                error!("Reconcile loop ended abnormally: {}", e);
            }
        }
        ended = &mut poll_loop => {
            match ended {
                Ok(()) => info!("Scheduled tests were stopped, shutting down"),
                Err(e) => error!("Reconcile loop ended abnormally: {}", e),
            }
        }
    }
    if let Err(e) = registry.shutdown().await {
        warn!("Job runner shutdown failed: {}", e);
    }
    Ok(())
}

/// Database location for `--stop` and `--show-cache`, which must work
/// without device credentials: flag, then environment, then config file,
/// then default.
fn standalone_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(db) = &cli.db {
        return Ok(db.clone());
    }
    if let Some(path) = std::env::var_os("PINGTEST_DB_PATH") {
        return Ok(PathBuf::from(path));
    }
    let from_file = match cli.config.as_deref() {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to read {:?}", path))?
            .db_path,
        None => None,
    };
    Ok(from_file.unwrap_or_else(pingtest_common::config::default_db_path))
}

async fn open_store(path: PathBuf) -> Result<Store> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || Store::open(&path))
        .await
        .context("Database open task failed")?
        .with_context(|| format!("Failed to open database {display}"))
}

/// Remove every registration. A running daemon sees its rows disappear,
/// drops the jobs and exits.
async fn stop(cli: &Cli) -> Result<()> {
    let store = open_store(standalone_db_path(cli)?).await?;
    let registry = CronRegistry::<BackendConnector>::detached(store);

    let tests = reconcile::stop_all(&registry).await?;
    let maintenance = maintenance::unschedule_maintenance(&registry).await?;
    info!(
        "Deleted {} {}* jobs and {} maintenance jobs",
        tests, JOB_NAMESPACE, maintenance
    );
    println!("All scheduled tests stopped");
    Ok(())
}

async fn show_cache(cli: &Cli) -> Result<()> {
    let store = open_store(standalone_db_path(cli)?).await?;
    let cache = ResultCache::new(store.clone());
    let cached = store
        .call(move |_| cache.get(maintenance::CACHE_KEY, Utc::now()))
        .await?;
    match cached {
        Some(results) => {
            for result in results.iter() {
                println!("{} {}", result.outcome.code(), result);
            }
        }
        None => println!("No cached results"),
    }
    Ok(())
}

async fn run_once(context: &Arc<JobContext<BackendConnector>>) -> Result<()> {
    let results = context.run_once().await;
    let count = |outcome: Outcome| results.iter().filter(|r| r.outcome == outcome).count();
    println!(
        "Ran {} tests: {} {}, {} {}, {} {}",
        results.len(),
        count(Outcome::NoFailure),
        Outcome::NoFailure.label(),
        count(Outcome::PartialFailure),
        Outcome::PartialFailure.label(),
        count(Outcome::TotalFailure),
        Outcome::TotalFailure.label(),
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
