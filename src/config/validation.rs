use std::path::Path;

use anyhow::Result;

use super::{RetrySettings, Settings};

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.device_id.trim().is_empty() {
        anyhow::bail!("device_id must not be empty");
    }
    if settings.server.trim().is_empty() {
        anyhow::bail!("server must not be empty");
    }
    if !settings.server.starts_with("https://") && !settings.server.starts_with("http://") {
        anyhow::bail!("server must be an http(s) URL");
    }
    validate_path(&settings.paths.cert, "paths.cert")?;
    validate_path(&settings.paths.key, "paths.key")?;
    if let Some(bundle) = &settings.paths.ca_bundle {
        validate_path(bundle, "paths.ca_bundle")?;
    }
    if settings.rotation.monitor_interval.is_zero() {
        anyhow::bail!("rotation.monitor_interval must be greater than 0");
    }
    if settings.submit.timeout.is_zero() {
        anyhow::bail!("submit.timeout must be greater than 0");
    }
    validate_retry_settings(&settings.retry)
}

fn validate_path(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("{field} must not be empty");
    }
    Ok(())
}

fn validate_retry_settings(retry: &RetrySettings) -> Result<()> {
    if retry.initial_interval.is_zero() {
        anyhow::bail!("retry.initial_interval must be greater than 0");
    }
    if retry.max_interval.is_zero() {
        anyhow::bail!("retry.max_interval must be greater than 0");
    }
    if retry.sweep_interval.is_zero() {
        anyhow::bail!("retry.sweep_interval must be greater than 0");
    }
    if retry.initial_interval > retry.max_interval {
        anyhow::bail!("retry.initial_interval must be <= retry.max_interval");
    }
    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        anyhow::bail!("retry.backoff_multiplier must be >= 1.0");
    }
    Ok(())
}
