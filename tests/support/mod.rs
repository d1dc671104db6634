// Helper functions are shared across multiple test crates; not every helper is
// referenced in each test module.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use certrotate::config::{Paths, RetrySettings, RotationSettings, Settings, SubmitSettings};
use certrotate::protocol::{RenewalRequestBody, RenewalResponse};
use certrotate::service::ca::LocalCa;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use time::OffsetDateTime;
use wiremock::{Request, Respond, ResponseTemplate};

pub(crate) const DEVICE_ID: &str = "dev-1";

/// Self-signed CA kept as PEM so it can be rebuilt wherever it is needed.
#[derive(Debug, Clone)]
pub(crate) struct TestCa {
    pub(crate) cert_pem: String,
    pub(crate) key_pem: String,
}

impl TestCa {
    pub(crate) fn generate(name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().context("Failed to generate CA key")?;
        let cert = params.self_signed(&key).context("Failed to self-sign CA")?;
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    pub(crate) fn local_ca(&self, validity_days: u32) -> Result<LocalCa> {
        Ok(LocalCa::from_pem(&self.cert_pem, &self.key_pem, validity_days)?)
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.key_pem).context("Failed to parse CA key")?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key).context("Failed to load CA issuer")
    }

    /// Issues a client certificate for `common_name` valid from
    /// `now + not_before_days` to `now + not_after_days`.
    pub(crate) fn issue_device(
        &self,
        common_name: &str,
        not_before_days: i64,
        not_after_days: i64,
    ) -> Result<DeviceIdentity> {
        let key = KeyPair::generate().context("Failed to generate device key")?;
        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.not_before = now + time::Duration::days(not_before_days);
        params.not_after = now + time::Duration::days(not_after_days);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params
            .signed_by(&key, &self.issuer()?)
            .context("Failed to sign device certificate")?;
        Ok(DeviceIdentity {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key,
        })
    }

    /// Signs a CSR the way the rotation service does.
    pub(crate) fn sign_csr(&self, csr_pem: &str, common_name: &str, days: i64) -> Result<String> {
        let mut csr =
            CertificateSigningRequestParams::from_pem(csr_pem).context("Failed to parse CSR")?;
        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.not_before = now;
        params.not_after = now + time::Duration::days(days);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params = params;
        let cert = csr
            .signed_by(&self.issuer()?)
            .context("Failed to sign CSR")?;
        Ok(cert.pem())
    }
}

pub(crate) struct DeviceIdentity {
    pub(crate) key: KeyPair,
    pub(crate) cert_pem: String,
    pub(crate) cert_der: Vec<u8>,
}

impl DeviceIdentity {
    pub(crate) fn write_to(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        fs::write(&cert_path, &self.cert_pem).context("Failed to write device cert")?;
        fs::write(&key_path, self.key.serialize_pem()).context("Failed to write device key")?;
        Ok((cert_path, key_path))
    }
}

pub(crate) fn agent_settings(dir: &Path, server: &str) -> Settings {
    Settings {
        device_id: DEVICE_ID.to_string(),
        server: server.to_string(),
        paths: Paths {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            ca_bundle: None,
        },
        rotation: RotationSettings {
            monitor_interval: Duration::from_secs(60 * 60),
            renewal_threshold_days: 30,
        },
        retry: RetrySettings {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            sweep_interval: Duration::from_millis(50),
        },
        submit: SubmitSettings {
            timeout: Duration::from_secs(5),
        },
    }
}

/// Mock rotation service that signs whatever CSR it receives.
pub(crate) struct SigningResponder {
    pub(crate) ca: TestCa,
    pub(crate) common_name: String,
}

impl Respond for SigningResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<RenewalRequestBody>(&request.body) else {
            return ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "Invalid request format"
            }));
        };
        let Ok(certificate) = self.ca.sign_csr(&body.csr, &self.common_name, 90) else {
            return ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": "Certificate issuance failed"
            }));
        };
        let now = OffsetDateTime::now_utc();
        ResponseTemplate::new(200).set_body_json(RenewalResponse {
            request_id: body.request_id,
            status: "completed".to_string(),
            certificate,
            serial_number: "0a".to_string(),
            not_before: now,
            not_after: now + time::Duration::days(90),
            issued_at: now,
        })
    }
}

/// Polls until the certificate file no longer holds `original`.
pub(crate) async fn wait_for_rotation(cert_path: &Path, original: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(current) = tokio::fs::read_to_string(cert_path).await {
            if current != original {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
