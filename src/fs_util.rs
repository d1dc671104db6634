use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;

const CERT_FILE_MODE: u32 = 0o644;
const BACKUP_SUFFIX: &str = ".bak";
const TEMP_SUFFIX: &str = ".tmp";

/// Path of the backup kept for the previously installed certificate.
#[must_use]
pub fn backup_path(cert_path: &Path) -> PathBuf {
    with_suffix(cert_path, BACKUP_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Replaces the certificate at `cert_path` without a window where no
/// certificate exists.
///
/// The new PEM is written to a sibling temp file, the current certificate is
/// copied to `<cert>.bak`, and the temp file is renamed over the original.
///
/// # Errors
/// Returns an error if the temp file cannot be written, the backup cannot be
/// made, or the rename fails. The original certificate is untouched on error.
pub async fn install_certificate(cert_path: &Path, cert_pem: &str) -> Result<()> {
    let cert_dir = cert_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cert path has no parent directory"))?;
    if !cert_dir.as_os_str().is_empty() {
        fs::create_dir_all(cert_dir).await.map_err(|e| {
            anyhow::anyhow!("Failed to create cert dir {}: {e}", cert_dir.display())
        })?;
    }

    let temp_path = with_suffix(cert_path, TEMP_SUFFIX);
    fs::write(&temp_path, cert_pem)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write temp cert file: {e}"))?;
    let permissions = std::fs::Permissions::from_mode(CERT_FILE_MODE);
    if let Err(err) = fs::set_permissions(&temp_path, permissions).await {
        let _ = fs::remove_file(&temp_path).await;
        anyhow::bail!("Failed to set cert file permissions: {err}");
    }

    if fs::try_exists(cert_path).await.unwrap_or(false)
        && let Err(err) = fs::copy(cert_path, backup_path(cert_path)).await
    {
        let _ = fs::remove_file(&temp_path).await;
        anyhow::bail!("Failed to back up current certificate: {err}");
    }

    if let Err(err) = fs::rename(&temp_path, cert_path).await {
        let _ = fs::remove_file(&temp_path).await;
        anyhow::bail!("Failed to install certificate: {err}");
    }
    Ok(())
}
