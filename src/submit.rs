//! Submission of renewal requests to the rotation service and installation of
//! the returned certificate.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Certificate, Client, Identity};
use tracing::info;

use crate::agent::types::RenewalRequest;
use crate::cert::{self, PEM_LABEL_CERTIFICATE, PEM_LABEL_CERTIFICATE_REQUEST};
use crate::config::Settings;
use crate::fs_util;
use crate::protocol::{self, ErrorResponse, RenewalRequestBody, RenewalResponse};

/// Posts renewal requests over mTLS using the device's current credential.
#[derive(Debug, Clone)]
pub struct HttpSubmitter {
    server: String,
    device_id: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    ca_bundle: Option<PathBuf>,
    timeout: Duration,
}

impl HttpSubmitter {
    #[must_use]
    pub fn new(
        server: &str,
        device_id: impl Into<String>,
        cert_path: PathBuf,
        key_path: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            device_id: device_id.into(),
            cert_path,
            key_path,
            ca_bundle: None,
            timeout,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.server,
            settings.device_id.clone(),
            settings.paths.cert.clone(),
            settings.paths.key.clone(),
            settings.submit.timeout,
        )
        .with_ca_bundle(settings.paths.ca_bundle.clone())
    }

    #[must_use]
    pub fn with_ca_bundle(mut self, ca_bundle: Option<PathBuf>) -> Self {
        self.ca_bundle = ca_bundle;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.server, protocol::renewal_path(&self.device_id))
    }

    // Rebuilt per submission: the client identity changes after every rotation.
    async fn client(&self) -> Result<Client> {
        let cert_pem = tokio::fs::read(&self.cert_path)
            .await
            .with_context(|| format!("Failed to read certificate {}", self.cert_path.display()))?;
        let key_pem = tokio::fs::read(&self.key_path)
            .await
            .with_context(|| format!("Failed to read private key {}", self.key_path.display()))?;
        let mut identity_pem = key_pem;
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&cert_pem);
        let identity =
            Identity::from_pem(&identity_pem).context("Failed to load client identity")?;

        let mut builder = Client::builder().timeout(self.timeout).identity(identity);
        if let Some(bundle_path) = &self.ca_bundle {
            let bundle = tokio::fs::read(bundle_path).await.with_context(|| {
                format!("Failed to read CA bundle {}", bundle_path.display())
            })?;
            for ca in Certificate::from_pem_bundle(&bundle).context("Failed to parse CA bundle")? {
                builder = builder.add_root_certificate(ca);
            }
        }
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build rotation client: {e}"))
    }

    /// Sends `request` to the rotation service.
    ///
    /// # Errors
    /// Returns an error if the client cannot be built, the request fails, or
    /// the service answers with a non-success status.
    pub async fn submit(&self, request: &RenewalRequest) -> Result<RenewalResponse> {
        let client = self.client().await?;
        let csr = String::from_utf8(request.csr.clone()).context("CSR is not valid UTF-8")?;
        let body = RenewalRequestBody {
            request_id: request.request_id.clone(),
            csr,
            security_proof_type: request.security_proof_type.as_str().to_string(),
            old_certificate_serial: Some(request.old_certificate_serial.clone())
                .filter(|serial| !serial.is_empty()),
        };

        let response = client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to submit renewal request: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            anyhow::bail!("Rotation service returned {status}: {message}");
        }

        let renewal: RenewalResponse = response
            .json()
            .await
            .context("Failed to parse renewal response")?;
        if renewal.request_id != request.request_id {
            anyhow::bail!(
                "Renewal response is for request {} (expected {})",
                renewal.request_id,
                request.request_id
            );
        }
        if renewal.status != protocol::RENEWAL_STATUS_COMPLETED {
            anyhow::bail!("Renewal response has status '{}'", renewal.status);
        }
        Ok(renewal)
    }

    /// Submits `request` and installs the issued certificate in place of the
    /// current one.
    ///
    /// # Errors
    /// Returns an error if submission fails, the returned certificate does not
    /// continue the device identity, or installation fails.
    pub async fn submit_and_install(&self, request: &RenewalRequest) -> Result<RenewalResponse> {
        let response = self.submit(request).await?;
        self.verify_issued_certificate(request, &response.certificate)?;
        fs_util::install_certificate(&self.cert_path, &response.certificate).await?;
        info!(
            event = "certificate.renewal.completed",
            request_id = %request.request_id,
            new_serial = %response.serial_number,
            not_after = %response.not_after,
            "Renewed certificate installed"
        );
        Ok(response)
    }

    fn verify_issued_certificate(&self, request: &RenewalRequest, cert_pem: &str) -> Result<()> {
        let cert_der = cert::pem_to_der(cert_pem.as_bytes(), PEM_LABEL_CERTIFICATE)
            .context("Issued certificate is not PEM")?;
        let issued = cert::parse_certificate(&cert_der)?;
        let common_name = cert::common_name(issued.subject());
        if common_name.as_deref() != Some(self.device_id.as_str()) {
            anyhow::bail!(
                "Issued certificate CN {:?} does not match device {}",
                common_name,
                self.device_id
            );
        }

        let csr_der = cert::pem_to_der(&request.csr, PEM_LABEL_CERTIFICATE_REQUEST)?;
        let csr = cert::parse_certificate_request(&csr_der)?;
        if issued.tbs_certificate.subject_pki.raw != csr.certification_request_info.subject_pki.raw
        {
            anyhow::bail!("Issued certificate public key does not match the device key");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let submitter = HttpSubmitter::new(
            "https://rotation.example.com/",
            "dev-1",
            PathBuf::from("cert.pem"),
            PathBuf::from("key.pem"),
            Duration::from_secs(5),
        );

        assert_eq!(
            submitter.endpoint(),
            "https://rotation.example.com/api/v1/devices/dev-1/certificaterenewal"
        );
    }

    #[tokio::test]
    async fn test_missing_identity_fails_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = HttpSubmitter::new(
            "http://127.0.0.1:9",
            "dev-1",
            dir.path().join("cert.pem"),
            dir.path().join("key.pem"),
            Duration::from_secs(5),
        );

        let err = submitter.client().await.unwrap_err();

        assert!(err.to_string().contains("Failed to read certificate"));
    }
}
