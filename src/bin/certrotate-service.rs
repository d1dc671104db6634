use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use certrotate::cert::TrustPool;
use certrotate::service::ca::{DEFAULT_VALIDITY_DAYS, LocalCa};
use certrotate::service::handler::RenewalHandler;
use certrotate::service::http;
use certrotate::service::issuer::CertificateIssuer;
use certrotate::service::store::InMemoryRenewalStore;
use certrotate::service::validator::Validator;
use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use poem::Server;
use poem::listener::TcpListener;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";
const DEFAULT_CONFIG_PATH: &str = "service.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Certificate rotation service")]
struct Args {
    /// Path to service configuration file (default: service.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
struct ServiceSettings {
    listen_addr: String,
    #[serde(default)]
    org_id: String,
    ca: CaSettings,
    #[serde(default)]
    trust: TrustSettings,
}

#[derive(Debug, Deserialize, Clone)]
struct CaSettings {
    cert: PathBuf,
    key: PathBuf,
    validity_days: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct TrustSettings {
    ca_bundle: Option<PathBuf>,
}

impl ServiceSettings {
    fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();
        s = s
            .set_default("listen_addr", DEFAULT_LISTEN_ADDR)?
            .set_default("org_id", "")?
            .set_default("ca.cert", "ca/ca.pem")?
            .set_default("ca.key", "ca/ca-key.pem")?
            .set_default("ca.validity_days", u64::from(DEFAULT_VALIDITY_DAYS))?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        s = s.add_source(File::from(path).required(false));

        s = s.add_source(
            Environment::with_prefix("CERTROTATE_SERVICE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        s.build()?.try_deserialize()
    }

    fn validate(&self) -> Result<()> {
        if self.ca.cert.as_os_str().is_empty() {
            anyhow::bail!("ca.cert must not be empty");
        }
        if self.ca.key.as_os_str().is_empty() {
            anyhow::bail!("ca.key must not be empty");
        }
        if self.ca.validity_days == 0 {
            anyhow::bail!("ca.validity_days must be greater than 0");
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("listen_addr invalid: {e}"))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(args.config)?;
    let handler = Arc::new(build_handler(&settings).await?);
    let listen_addr: SocketAddr = settings.listen_addr.parse().map_err(|e| {
        anyhow::anyhow!("Failed to parse listen_addr {}: {e}", settings.listen_addr)
    })?;

    info!("Starting certificate rotation service on {}", listen_addr);
    Server::new(TcpListener::bind(listen_addr))
        .run_with_graceful_shutdown(
            http::routes(handler),
            async {
                let _ = tokio::signal::ctrl_c().await;
                warn!("Shutdown signal received");
            },
            None,
        )
        .await
        .context("Rotation service failed")?;
    Ok(())
}

fn load_settings(config_path: Option<PathBuf>) -> Result<ServiceSettings> {
    let settings = ServiceSettings::new(config_path)?;
    settings.validate()?;
    Ok(settings)
}

async fn build_handler(settings: &ServiceSettings) -> Result<http::ServiceHandler> {
    let ca = LocalCa::load(&settings.ca.cert, &settings.ca.key, settings.ca.validity_days).await?;
    let trust = match &settings.trust.ca_bundle {
        Some(path) => {
            let bundle = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read trust bundle {}", path.display()))?;
            let pool = TrustPool::from_pem_bundle(&bundle)
                .with_context(|| format!("Failed to parse trust bundle {}", path.display()))?;
            info!("Loaded {} trusted CA certificate(s)", pool.len());
            Some(pool)
        }
        None => {
            warn!("No trust bundle configured; client chains are not verified here");
            None
        }
    };
    Ok(RenewalHandler::new(
        CertificateIssuer::new(ca),
        InMemoryRenewalStore::new(),
        Validator::new(trust),
        settings.org_id.clone(),
    ))
}
