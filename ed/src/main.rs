//! Encore - measurement task scheduler
//!
//! CLI entry point for running the engine and operating on its store.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::{debug, error, info, warn};

use encore::cli::{Cli, Command, OutputFormat, get_log_path};
use encore::config::Config;
use encore::definitions::Definitions;
use encore::engine::{Engine, geolocator, open_store};
use encore::metrics::CounterRegistry;
use encore::scheduler::Scheduler;
use encore::server::{TaskRequest, TaskResponse};
use encore::state::StoreManager;
use encore::stats::{Aggregator, normalize_referer, site_stats};

fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = log_file.map(Path::to_path_buf).unwrap_or_else(get_log_path);
    if let Some(log_dir) = log_path.parent()
        && !log_dir.as_os_str().is_empty()
    {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_file.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(database = %config.storage.database.display(), "Encore loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Load { file } => cmd_load(&config, &file).await,
        Command::Promote => cmd_promote(&config).await,
        Command::Status { format } => cmd_status(&config, format).await,
        Command::Select { path, hints, referer } => cmd_select(config, path, hints, referer).await,
        Command::Parse => cmd_parse(&config).await,
        Command::Stats { referer, format } => cmd_stats(&config, &referer, format).await,
    }
}

fn store_manager(config: &Config) -> Result<StoreManager> {
    Ok(StoreManager::with_store(open_store(&config.storage)?))
}

/// Run every loop until a signal arrives or the store stops
async fn cmd_serve(config: Config) -> Result<()> {
    debug!("cmd_serve: called");
    let metrics_interval = config.scheduling.interval();
    let mut engine = Engine::open(config).context("Failed to start engine")?;
    engine.start_loops();
    println!("{} encore {}", "Serving".green().bold(), env!("CARGO_PKG_VERSION"));
    info!("Engine running. Press Ctrl+C to stop.");

    let store = engine.store().clone();
    let mut metrics_tick = tokio::time::interval(metrics_interval);
    let mut fatal = false;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = metrics_tick.tick() => {
                    info!(metrics = ?engine.metrics_snapshot(), "Metrics");
                }
                _ = sigint.recv() => {
                    warn!("SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received");
                    break;
                }
                _ = store.closed() => {
                    error!("Store stopped on a fatal error");
                    fatal = true;
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                _ = metrics_tick.tick() => {
                    info!(metrics = ?engine.metrics_snapshot(), "Metrics");
                }
                result = tokio::signal::ctrl_c() => {
                    result?;
                    break;
                }
                _ = store.closed() => {
                    error!("Store stopped on a fatal error");
                    fatal = true;
                    break;
                }
            }
        }
    }

    info!(metrics = ?engine.metrics_snapshot(), "Shutting down");
    engine.shutdown().await?;
    if fatal {
        return Err(eyre!("Store stopped on a fatal error"));
    }
    Ok(())
}

async fn cmd_load(config: &Config, file: &Path) -> Result<()> {
    debug!(file = %file.display(), "cmd_load: called");
    let definitions = Definitions::load(file)?;
    let store = store_manager(config)?;
    let (tasks, schedules) = definitions.apply(&store).await?;
    store.shutdown().await?;
    println!(
        "{} {} tasks and {} schedules",
        "Loaded".green().bold(),
        tasks.len(),
        schedules.len()
    );
    Ok(())
}

async fn cmd_promote(config: &Config) -> Result<()> {
    debug!("cmd_promote: called");
    let store = store_manager(config)?;
    let scheduler = Scheduler::new(config.scheduling.clone(), store.clone(), Arc::new(CounterRegistry::new()));
    let report = scheduler.run_cycle().await.context("Promotion failed")?;
    store.shutdown().await?;

    println!("{} {} schedules", "Promoted".green().bold(), report.promoted.len());
    if !report.promoted.is_empty() {
        println!("  ids: {:?}", report.promoted);
    }
    println!("  expired: {}", report.expired);
    println!("  active: {}", report.active);
    if report.unfilled > 0 {
        println!("  {} {} slots", "unfilled:".yellow(), report.unfilled);
    }
    Ok(())
}

async fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let store = store_manager(config)?;
    let tasks = store.list_tasks().await?;
    let schedules = store.list_schedules().await?;
    let active = store.list_active().await?;
    store.shutdown().await?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "database": config.storage.database.display().to_string(),
                "tasks": tasks.len(),
                "schedules": schedules.len(),
                "active": active,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("{}", "Encore Status".bold());
            println!("-------------");
            println!("Database: {}", config.storage.database.display());
            println!("Tasks: {}", tasks.len());
            println!("Schedules: {}", schedules.len());
            println!("Active: {}/{}", active.len(), config.scheduling.concurrent_groups);
            for entry in &active {
                let remaining = entry
                    .measurements_remaining
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unlimited".to_string());
                println!(
                    "  schedule {} (priority {}) expires {} remaining {}",
                    entry.schedule_id.to_string().cyan(),
                    entry.priority,
                    entry.expiration_time.format("%Y-%m-%d %H:%M:%S"),
                    remaining
                );
            }
        }
    }
    Ok(())
}

/// Serve one task to stdout, recording it like any other served query
async fn cmd_select(
    config: Config,
    path: String,
    hints: Vec<(String, String)>,
    referer: Option<String>,
) -> Result<()> {
    debug!(%path, ?hints, "cmd_select: called");
    let engine = Engine::open(config).context("Failed to start engine")?;
    engine.dispatcher().refresh().await.context("Failed to load active task groups")?;

    let request = TaskRequest {
        path,
        query: hints,
        referer,
        remote_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let response = engine.server().serve(request).await;
    engine.shutdown().await?;

    match response {
        Ok(TaskResponse::Served {
            content_type,
            body,
            task_id,
            measurement_id,
        }) => {
            eprintln!(
                "{} task {} ({}) measurement {}",
                "Selected".green().bold(),
                task_id,
                content_type,
                measurement_id
            );
            std::io::stdout().write_all(&body)?;
            Ok(())
        }
        Ok(TaskResponse::OptedOut) => {
            eprintln!("{}", "Client opted out".yellow());
            Ok(())
        }
        Err(e) => Err(e).context("No task served"),
    }
}

/// Parse pending rows and rebuild the summaries once
async fn cmd_parse(config: &Config) -> Result<()> {
    debug!("cmd_parse: called");
    let store = store_manager(config)?;
    let aggregator = Aggregator::new(
        config.stats.clone(),
        store.clone(),
        geolocator(&config.geolocation),
        Arc::new(CounterRegistry::new()),
    );
    let report = aggregator.run_cycle().await.context("Aggregation failed")?;
    store.shutdown().await?;

    println!(
        "{} {} queries and {} results",
        "Parsed".green().bold(),
        report.parse.queries,
        report.parse.results
    );
    if report.parse.errors > 0 {
        println!("  {} {}", "unparseable requests:".yellow(), report.parse.errors);
    }
    for failure in report.rebuild.failures() {
        println!("  {} {:?}", "rebuild failed:".red(), failure);
    }
    Ok(())
}

async fn cmd_stats(config: &Config, referer: &str, format: OutputFormat) -> Result<()> {
    debug!(%referer, ?format, "cmd_stats: called");
    let site = normalize_referer(referer).ok_or_else(|| eyre!("Invalid referer: {}", referer))?;
    let store = store_manager(config)?;
    let stats = site_stats(&store, &site).await;
    store.shutdown().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("{}", stats.site.bold());
            println!("Results: {}", stats.total_results);
            if !stats.results_per_day.is_empty() {
                println!("Per day:");
                for (day, n) in &stats.results_per_day {
                    println!("  {} {}", day, n);
                }
            }
            if !stats.results_per_country.is_empty() {
                println!("Per country:");
                for (country, n) in &stats.results_per_country {
                    println!("  {} {}", country, n);
                }
            }
        }
    }
    Ok(())
}
