use std::path::PathBuf;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::TRACING_COMPONENT;
use super::types::{RenewalRequest, RenewalStatus, SecurityProofType};
use crate::cert::{self, CertificateMetadata};

#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("Failed to load private key {path}: {message}")]
    KeyLoad { path: PathBuf, message: String },
    #[error("Failed to generate CSR: {0}")]
    Csr(String),
}

impl RenewalError {
    /// Classified reason used for logs and the failure counter.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            RenewalError::KeyLoad { .. } => "private_key_load_failed",
            RenewalError::Csr(_) => "csr_generation_failed",
        }
    }
}

/// Builds renewal requests that continue the identity of the current key.
#[derive(Debug, Clone)]
pub struct Renewer {
    device_id: String,
    key_path: PathBuf,
}

impl Renewer {
    #[must_use]
    pub fn new(device_id: impl Into<String>, key_path: PathBuf) -> Self {
        Self {
            device_id: device_id.into(),
            key_path,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Generates a CSR over the existing private key and wraps it in a
    /// pending renewal request.
    ///
    /// # Errors
    /// Returns [`RenewalError::KeyLoad`] if the key cannot be read or cannot
    /// sign, and [`RenewalError::Csr`] if the request cannot be built.
    pub async fn generate_renewal_request(
        &self,
        metadata: &CertificateMetadata,
    ) -> Result<RenewalRequest, RenewalError> {
        let span = info_span!(
            "renewal.generate_request",
            component = TRACING_COMPONENT,
            device_id = %self.device_id,
            cert_serial = %metadata.serial_number,
        );
        self.generate(metadata).instrument(span).await
    }

    async fn generate(
        &self,
        metadata: &CertificateMetadata,
    ) -> Result<RenewalRequest, RenewalError> {
        let key_pem = tokio::fs::read_to_string(&self.key_path)
            .await
            .map_err(|e| RenewalError::KeyLoad {
                path: self.key_path.clone(),
                message: e.to_string(),
            })?;
        let key = cert::parse_signing_key(&key_pem).map_err(|e| RenewalError::KeyLoad {
            path: self.key_path.clone(),
            message: e.to_string(),
        })?;
        let csr = cert::make_csr(&key, &self.device_id)
            .map_err(|e| RenewalError::Csr(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let request = RenewalRequest {
            request_id: Uuid::new_v4().to_string(),
            device_id: self.device_id.clone(),
            old_certificate_serial: metadata.serial_number.clone(),
            csr: csr.into_bytes(),
            security_proof_type: determine_security_proof_type(metadata, now),
            created_at: now,
            retry_count: 0,
            next_retry_at: None,
            status: RenewalStatus::Pending,
        };

        info!(
            event = "certificate.renewal.request_created",
            request_id = %request.request_id,
            security_proof_type = %request.security_proof_type,
            "Renewal request created"
        );
        Ok(request)
    }
}

/// Chooses how the request proves continuity of identity.
///
/// A certificate outside its validity window still yields
/// [`SecurityProofType::ValidCertificate`]; the service decides whether to
/// accept it.
#[must_use]
pub fn determine_security_proof_type(
    metadata: &CertificateMetadata,
    now: OffsetDateTime,
) -> SecurityProofType {
    if metadata.not_before < now && now < metadata.not_after {
        return SecurityProofType::ValidCertificate;
    }
    warn!(
        cert_serial = %metadata.serial_number,
        not_before = %metadata.not_before,
        not_after = %metadata.not_after,
        "Certificate is outside its validity window, no recovery proof available; using valid_cert"
    );
    SecurityProofType::ValidCertificate
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use rcgen::KeyPair;
    use tempfile::tempdir;

    use super::*;
    use crate::cert::{
        PEM_LABEL_CERTIFICATE_REQUEST, common_name, parse_certificate_request, pem_to_der,
    };

    fn metadata(not_before: OffsetDateTime, not_after: OffsetDateTime) -> CertificateMetadata {
        CertificateMetadata {
            file_path: Path::new("cert.pem").to_path_buf(),
            not_before,
            not_after,
            subject: "CN=dev-1".to_string(),
            issuer: "CN=Test CA".to_string(),
            serial_number: "0a1b".to_string(),
            fingerprint: String::new(),
        }
    }

    fn valid_metadata() -> CertificateMetadata {
        let now = OffsetDateTime::now_utc();
        metadata(now - time::Duration::days(1), now + time::Duration::days(10))
    }

    #[tokio::test]
    async fn test_generate_renewal_request_uses_existing_key() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        let key = KeyPair::generate().unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();
        let renewer = Renewer::new("dev-1", key_path);

        let request = renewer
            .generate_renewal_request(&valid_metadata())
            .await
            .unwrap();

        assert!(Uuid::parse_str(&request.request_id).is_ok());
        assert_eq!(request.device_id, "dev-1");
        assert_eq!(request.old_certificate_serial, "0a1b");
        assert_eq!(request.status, RenewalStatus::Pending);
        assert_eq!(request.retry_count, 0);
        assert_eq!(request.security_proof_type, SecurityProofType::ValidCertificate);

        let der = pem_to_der(&request.csr, PEM_LABEL_CERTIFICATE_REQUEST).unwrap();
        let csr = parse_certificate_request(&der).unwrap();
        assert_eq!(
            common_name(&csr.certification_request_info.subject).as_deref(),
            Some("dev-1")
        );
        let reference = rcgen::CertificateParams::default().self_signed(&key).unwrap();
        let reference = crate::cert::parse_certificate(reference.der()).unwrap();
        assert_eq!(
            csr.certification_request_info.subject_pki.raw,
            reference.tbs_certificate.subject_pki.raw
        );
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        fs::write(&key_path, KeyPair::generate().unwrap().serialize_pem()).unwrap();
        let renewer = Renewer::new("dev-1", key_path);
        let metadata = valid_metadata();

        let first = renewer.generate_renewal_request(&metadata).await.unwrap();
        let second = renewer.generate_renewal_request(&metadata).await.unwrap();

        assert_ne!(first.request_id, second.request_id);
    }

    #[tokio::test]
    async fn test_missing_key_is_key_load_error() {
        let dir = tempdir().unwrap();
        let renewer = Renewer::new("dev-1", dir.path().join("missing.pem"));

        let err = renewer
            .generate_renewal_request(&valid_metadata())
            .await
            .unwrap_err();

        assert!(matches!(err, RenewalError::KeyLoad { .. }));
        assert_eq!(err.reason(), "private_key_load_failed");
    }

    #[tokio::test]
    async fn test_undecodable_key_is_key_load_error() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        fs::write(&key_path, "not a key").unwrap();
        let renewer = Renewer::new("dev-1", key_path);

        let err = renewer
            .generate_renewal_request(&valid_metadata())
            .await
            .unwrap_err();

        assert!(matches!(err, RenewalError::KeyLoad { .. }));
    }

    #[test]
    fn test_expired_cert_degrades_to_valid_cert() {
        let now = OffsetDateTime::now_utc();
        let expired = metadata(now - time::Duration::days(30), now - time::Duration::days(1));
        let future = metadata(now + time::Duration::days(1), now + time::Duration::days(30));

        assert_eq!(
            determine_security_proof_type(&expired, now),
            SecurityProofType::ValidCertificate
        );
        assert_eq!(
            determine_security_proof_type(&future, now),
            SecurityProofType::ValidCertificate
        );
    }
}
