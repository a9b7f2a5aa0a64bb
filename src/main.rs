//! Lambda Proxy - Entry Point
//!
//! Starts the proxy listener with graceful shutdown support.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lambda_proxy::config::{Config, LogConfig};
use lambda_proxy::proxy::{ProxyHandler, ProxyInstance, ProxyServer};
use lambda_proxy::stats::StatsRecorder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log, config.proxy.verbose);

    info!("Starting Lambda Proxy");
    config.validate().context("invalid configuration")?;

    let stats = Arc::new(StatsRecorder::new());
    let instance = Arc::new(
        ProxyInstance::from_config(&config, &stats).context("failed to build proxy backends")?,
    );
    info!(
        request_backend = instance.request_backend_name(),
        stream_backend = instance.stream_backend_name(),
        strategy = config.workers.strategy.as_str(),
        "Configuration loaded"
    );

    let (shutdown_tx, _) = watch::channel(false);

    let stats_task = (config.proxy.stats_interval > 0).then(|| {
        let interval = Duration::from_secs(config.proxy.stats_interval);
        tokio::spawn(report_stats(
            Arc::clone(&stats),
            Arc::clone(&instance),
            interval,
            shutdown_tx.subscribe(),
        ))
    });

    let server = ProxyServer::new(
        config.proxy.host.clone(),
        config.proxy.port,
        Arc::new(ProxyHandler::new(instance)),
    );
    let proxy_shutdown = shutdown_tx.subscribe();
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = server.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = proxy_task.await;
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    info!("Lambda Proxy stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("lambda_proxy={}", default_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Periodically log a stats snapshot until shutdown
async fn report_stats(
    stats: Arc<StatsRecorder>,
    instance: Arc<ProxyInstance>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!(stats = %json, "Stats"),
                    Err(e) => error!("Failed to serialize stats: {}", e),
                }
                if let Some(metrics) = instance.pool_metrics() {
                    info!(
                        active = metrics.active,
                        peak = metrics.peak,
                        idle_workers = metrics.idle_workers,
                        queue_depth = metrics.queue_depth,
                        overflowed = metrics.overflowed,
                        "Worker pool"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
