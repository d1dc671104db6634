use std::future::Future;
use std::path::Path;

use anyhow::Context;
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use time::OffsetDateTime;

/// Signer profile used for device client certificates.
pub const CLIENT_BOOTSTRAP_SIGNER_NAME: &str = "client-bootstrap";
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
const SERIAL_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub signer_name: String,
    pub csr_pem: String,
    pub resource_name: String,
}

#[derive(Debug, Error)]
pub enum CaError {
    #[error("unknown signer '{0}'")]
    UnknownSigner(String),
    #[error("invalid certificate request: {0}")]
    Csr(String),
    #[error("failed to sign certificate: {0}")]
    Signing(String),
    #[error("failed to load CA: {0}")]
    Load(String),
}

/// Backend that turns a certificate request into a signed PEM certificate.
pub trait CaSigner: Send + Sync {
    fn sign(&self, request: &SignRequest) -> impl Future<Output = Result<String, CaError>> + Send;
}

/// In-process CA backed by a PEM certificate and key.
pub struct LocalCa {
    issuer: Issuer<'static, KeyPair>,
    validity_days: u32,
    rng: SystemRandom,
}

impl LocalCa {
    /// Builds a CA from PEM encoded certificate and key.
    ///
    /// # Errors
    /// Returns [`CaError::Load`] if either PEM cannot be parsed.
    pub fn from_pem(cert_pem: &str, key_pem: &str, validity_days: u32) -> Result<Self, CaError> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| CaError::Load(format!("key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| CaError::Load(format!("certificate: {e}")))?;
        Ok(Self {
            issuer,
            validity_days: if validity_days == 0 {
                DEFAULT_VALIDITY_DAYS
            } else {
                validity_days
            },
            rng: SystemRandom::new(),
        })
    }

    /// Reads the CA certificate and key from disk.
    ///
    /// # Errors
    /// Returns an error if either file cannot be read or parsed.
    pub async fn load(
        cert_path: &Path,
        key_path: &Path,
        validity_days: u32,
    ) -> anyhow::Result<Self> {
        let cert_pem = tokio::fs::read_to_string(cert_path)
            .await
            .with_context(|| format!("Failed to read CA certificate {}", cert_path.display()))?;
        let key_pem = tokio::fs::read_to_string(key_path)
            .await
            .with_context(|| format!("Failed to read CA key {}", key_path.display()))?;
        Ok(Self::from_pem(&cert_pem, &key_pem, validity_days)?)
    }

    fn random_serial(&self) -> Result<SerialNumber, CaError> {
        let mut bytes = [0_u8; SERIAL_LEN];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| CaError::Signing("failed to generate serial number".to_string()))?;
        // Positive and without a leading zero byte.
        bytes[0] = (bytes[0] & 0x7f) | 0x40;
        Ok(SerialNumber::from_slice(&bytes))
    }

    fn client_params(&self, common_name: &str) -> Result<CertificateParams, CaError> {
        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.to_string());
        params.not_before = now;
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.serial_number = Some(self.random_serial()?);
        Ok(params)
    }

    fn sign_now(&self, request: &SignRequest) -> Result<String, CaError> {
        if request.signer_name != CLIENT_BOOTSTRAP_SIGNER_NAME {
            return Err(CaError::UnknownSigner(request.signer_name.clone()));
        }
        if request.resource_name.trim().is_empty() {
            return Err(CaError::Csr("resource name must not be empty".to_string()));
        }
        let mut csr = CertificateSigningRequestParams::from_pem(&request.csr_pem)
            .map_err(|e| CaError::Csr(e.to_string()))?;
        csr.params = self.client_params(&request.resource_name)?;
        let cert = csr
            .signed_by(&self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        Ok(cert.pem())
    }
}

impl CaSigner for LocalCa {
    fn sign(&self, request: &SignRequest) -> impl Future<Output = Result<String, CaError>> + Send {
        std::future::ready(self.sign_now(request))
    }
}
