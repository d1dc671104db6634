use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Certificate rotation agent", long_about = None)]
pub struct Args {
    /// Path to configuration file (default: agent.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Device identifier, used as the certificate common name
    #[arg(long, env = "CERTROTATE_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Base URL of the rotation service
    #[arg(long, env = "CERTROTATE_SERVER")]
    pub server: Option<String>,

    /// Path to the active certificate
    #[arg(long)]
    pub cert_path: Option<PathBuf>,

    /// Path to the private key of the active certificate
    #[arg(long)]
    pub key_path: Option<PathBuf>,

    /// CA bundle used to verify the rotation service
    #[arg(long)]
    pub ca_bundle: Option<PathBuf>,

    /// Run a single check and renewal, then exit (disable daemon loop)
    #[arg(long)]
    pub oneshot: bool,
}
