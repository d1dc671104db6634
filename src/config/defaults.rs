use config::{ConfigBuilder, ConfigError, builder::DefaultState};

const DEFAULT_DEVICE_ID: &str = "";
const DEFAULT_SERVER: &str = "https://localhost:8443";
const DEFAULT_CERT_PATH: &str = "certs/cert.pem";
const DEFAULT_KEY_PATH: &str = "certs/key.pem";
const DEFAULT_MONITOR_INTERVAL: &str = "1h";
const DEFAULT_RENEWAL_THRESHOLD_DAYS: u32 = 30;
const DEFAULT_RETRY_INITIAL_INTERVAL: &str = "1m";
const DEFAULT_RETRY_MAX_INTERVAL: &str = "1h";
const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_RETRY_SWEEP_INTERVAL: &str = "1m";
const DEFAULT_SUBMIT_TIMEOUT: &str = "30s";

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("device_id", DEFAULT_DEVICE_ID)?
        .set_default("server", DEFAULT_SERVER)?
        .set_default("paths.cert", DEFAULT_CERT_PATH)?
        .set_default("paths.key", DEFAULT_KEY_PATH)?
        .set_default("rotation.monitor_interval", DEFAULT_MONITOR_INTERVAL)?
        .set_default(
            "rotation.renewal_threshold_days",
            u64::from(DEFAULT_RENEWAL_THRESHOLD_DAYS),
        )?
        .set_default("retry.initial_interval", DEFAULT_RETRY_INITIAL_INTERVAL)?
        .set_default("retry.max_interval", DEFAULT_RETRY_MAX_INTERVAL)?
        .set_default(
            "retry.backoff_multiplier",
            DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        )?
        .set_default("retry.sweep_interval", DEFAULT_RETRY_SWEEP_INTERVAL)?
        .set_default("submit.timeout", DEFAULT_SUBMIT_TIMEOUT)
}
