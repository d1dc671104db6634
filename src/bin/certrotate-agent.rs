use std::sync::Arc;

use certrotate::metrics::{PrometheusMetrics, RotationMetrics};
use anyhow::Context;
use certrotate::{Args, config, daemon};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting certificate rotation agent");

    let settings = Arc::new(load_settings(&args)?);
    log_settings(&settings);
    let metrics = Arc::new(
        PrometheusMetrics::new().context("Failed to register rotation metrics")?,
    );
    let sink: Arc<dyn RotationMetrics> = Arc::clone(&metrics) as Arc<dyn RotationMetrics>;

    if args.oneshot {
        match daemon::run_oneshot(settings, sink).await {
            Ok(()) => info!("Oneshot rotation check finished"),
            Err(err) => {
                error!("Certificate rotation failed: {err:?}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let result = daemon::run_daemon(settings, sink).await;
    debug!("Final metrics:\n{}", metrics.render());
    result
}

fn load_settings(args: &Args) -> anyhow::Result<config::Settings> {
    let mut settings = config::Settings::new(args.config.clone())?;
    settings.merge_with_args(args);
    settings.validate()?;
    Ok(settings)
}

fn log_settings(settings: &config::Settings) {
    info!("Device ID: {}", settings.device_id);
    info!("Rotation service: {}", settings.server);
    info!(
        "Certificate: {}, renewal threshold: {} days, check interval: {}",
        settings.paths.cert.display(),
        settings.rotation.renewal_threshold_days,
        humantime::format_duration(settings.rotation.monitor_interval)
    );
}
