use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::agent::retry::RetryPolicy;

mod defaults;
mod validation;

pub const DEFAULT_CONFIG_PATH: &str = "agent.toml";
const ENV_PREFIX: &str = "CERTROTATE";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub device_id: String,
    pub server: String,
    pub paths: Paths,
    pub rotation: RotationSettings,
    pub retry: RetrySettings,
    pub submit: SubmitSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Paths {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RotationSettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub monitor_interval: Duration,
    pub renewal_threshold_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubmitSettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Settings {
    /// Loads defaults, the optional TOML file and `CERTROTATE_*` environment
    /// overrides, in that order.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format or
    /// an unparsable duration).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = defaults::apply_defaults(Config::builder())?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        s = s.add_source(File::from(path).required(false));

        // e.g. CERTROTATE_DEVICE_ID, CERTROTATE_PATHS__CERT
        s = s.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        s.build()?.try_deserialize()
    }

    /// Merges CLI arguments into the settings, overriding values if present.
    pub fn merge_with_args(&mut self, args: &crate::Args) {
        if let Some(device_id) = &args.device_id {
            device_id.clone_into(&mut self.device_id);
        }
        if let Some(server) = &args.server {
            server.clone_into(&mut self.server);
        }
        if let Some(cert_path) = &args.cert_path {
            cert_path.clone_into(&mut self.paths.cert);
        }
        if let Some(key_path) = &args.key_path {
            key_path.clone_into(&mut self.paths.key);
        }
        if let Some(ca_bundle) = &args.ca_bundle {
            self.paths.ca_bundle = Some(ca_bundle.clone());
        }
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is empty, zero or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: self.retry.initial_interval,
            max_interval: self.retry.max_interval,
            multiplier: self.retry.backoff_multiplier,
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}
