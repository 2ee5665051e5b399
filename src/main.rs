//! Process entrypoint: argument parsing, bootstrap, and graceful shutdown.
//!
//! Grounded in `neomind-cli::main`'s `clap::Parser` + `tokio::main` shape
//! and `neomind-api::shutdown::shutdown_signal`'s ctrl-c/SIGTERM handling;
//! `anyhow::Result` is used only at this boundary, matching
//! `neomind-cli`'s split between typed library errors and an
//! `anyhow`-wrapped `main`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use shelly_exporter::client::DeviceClient;
use shelly_exporter::config::{self, ConfigSnapshot};
use shelly_exporter::discovery::NetworkScanner;
use shelly_exporter::driver::DriverRegistry;
use shelly_exporter::http;
use shelly_exporter::metrics::MetricRegistry;
use shelly_exporter::model::LiveTargetRegistry;
use shelly_exporter::scheduler::Scheduler;
use shelly_exporter::watcher::ConfigWatcher;

/// Shelly relay/plug/dimmer Prometheus exporter.
#[derive(Parser, Debug)]
#[command(name = "shelly-exporter")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file. Overrides `CONFIG_PATH`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured log level (DEBUG, INFO, WARNING, ERROR).
    #[arg(long)]
    log_level: Option<String>,
}

fn resolve_config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from("./config.yaml")
}

fn init_tracing(level: &str) {
    let directive = match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("shelly_exporter={directive}")));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = resolve_config_path(&args);

    let snapshot = match config::load_from_path(&config_path) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            // Tracing isn't initialized yet; a config load failure at
            // startup is fatal, so a plain stderr line is sufficient.
            eprintln!("failed to load config from {}: {err}", config_path.display());
            std::process::exit(1);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&snapshot.global.log_level);
    init_tracing(log_level);
    tracing::info!(path = %config_path.display(), targets = snapshot.targets.len(), "configuration loaded");

    if let Err(err) = run(config_path, snapshot).await {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config_path: PathBuf, snapshot: ConfigSnapshot) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricRegistry::new());
    let client = DeviceClient::new();
    let drivers = Arc::new(DriverRegistry::with_builtin_drivers());
    let registry = Arc::new(LiveTargetRegistry::new());

    for target in &snapshot.targets {
        let next_run = Scheduler::initial_next_run(target.poll_interval);
        registry.insert_new(target.clone(), next_run);
    }

    let addr: SocketAddr = format!("{}:{}", snapshot.global.listen_host, snapshot.global.listen_port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", snapshot.global.listen_host, snapshot.global.listen_port))?;
    let listener = http::bind(addr).await.unwrap_or_else(|err| {
        tracing::error!(%addr, error = %err, "failed to bind metrics/health listener");
        std::process::exit(2);
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let request_timeout = snapshot.global.request_timeout;

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&registry),
        client.clone(),
        Arc::clone(&drivers),
        Arc::clone(&metrics),
        snapshot.global.max_concurrency,
        snapshot.global.device_info_refresh,
        snapshot.global.request_timeout,
        snapshot.global.backoff_base,
        snapshot.global.backoff_max,
    ));

    let scanner = Arc::new(NetworkScanner::new(
        client,
        Arc::clone(&drivers),
        Arc::clone(&metrics),
        Arc::clone(&registry),
        snapshot.discovery.clone(),
        snapshot.global.poll_interval,
    ));

    let watcher = Arc::new(
        ConfigWatcher::new(
            config_path,
            snapshot,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            Arc::clone(&scheduler),
        )
        .with_scanner(Arc::clone(&scanner)),
    );

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));
    tasks.spawn(Arc::clone(&scanner).run(shutdown_rx.clone()));
    tasks.spawn(Arc::clone(&watcher).run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let metrics_for_http = Arc::clone(&metrics);
    let http_handle = tokio::spawn(async move { http::serve_with_listener(listener, metrics_for_http, http_shutdown).await });

    shutdown_signal().await;
    tracing::info!("shutdown signal received; stopping");
    let _ = shutdown_tx.send(true);

    // Give in-flight polls a grace window, equal to the request timeout,
    // before the process exits, per the cancellation/shutdown model.
    let _ = tokio::time::timeout(request_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics/health server exited with an error"),
        Err(err) => tracing::warn!(error = %err, "metrics/health server task did not shut down cleanly"),
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
