//! nginx-exporter - tails an nginx access log and serves upstream latency histograms.

use anyhow::{anyhow, Context, Result};
use nginx_exporter::config::Config;
use nginx_exporter::metrics::{ExporterMetrics, UpstreamMetrics};
use nginx_exporter::parser::AccessLogParser;
use nginx_exporter::pipeline::Pipeline;
use nginx_exporter::server;
use nginx_exporter::tailer::TailCursor;
use nginx_exporter::watcher::{FileWatcher, WATCHER_CHANNEL_CAPACITY};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    let log_path = config.log_file_path();

    let registry = Registry::new();
    let upstream = Arc::new(UpstreamMetrics::new(&registry, config.metrics.buckets.clone())?);
    let exporter_metrics = ExporterMetrics::new(&registry)?;
    let parser = AccessLogParser::new(config.log.duration_policy)?;

    let cursor = TailCursor::open(&log_path, config.start_position())?;
    let (event_tx, event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
    let watcher = FileWatcher::start(&log_path, config.poll_interval(), event_tx)?;

    let listener = server::bind(config.metrics.port).await?;
    let cancel_token = CancellationToken::new();
    let server_handle = tokio::spawn(server::serve_metrics(
        listener,
        registry.clone(),
        cancel_token.clone(),
    ));

    info!(
        path = %watcher.path().display(),
        port = config.metrics.port,
        duration_policy = ?config.log.duration_policy,
        skip_historical = config.log.skip_historical,
        "nginx-exporter started"
    );

    let pipeline = Pipeline::new(cursor, parser, upstream, exporter_metrics);
    let mut pipeline_handle = tokio::task::spawn_blocking(move || pipeline.run(event_rx));

    let result = tokio::select! {
        joined = &mut pipeline_handle => match joined {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err).context("pipeline thread terminated abnormally")),
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed while waiting for shutdown signal");
            }
            info!("shutdown signal received");
            Ok(())
        }
    };

    cancel_token.cancel();
    // Closes the signal channel so a still-running pipeline thread returns.
    drop(watcher);
    if let Err(err) = server_handle.await {
        error!(error = %err, "metrics server task failed");
    }

    result
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
