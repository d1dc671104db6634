use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::cert::{self, ChainError, PEM_LABEL_CERTIFICATE_REQUEST, TrustPool};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("parsing CSR: {0}")]
    CsrParse(String),
    #[error("invalid CSR signature: {0}")]
    CsrSignature(String),
    #[error("CSR subject ({found}) does not match device ID ({device_id})")]
    CsrSubjectMismatch { found: String, device_id: String },
    #[error("certificate is missing")]
    CertificateMissing,
    #[error("parsing certificate: {0}")]
    CertificateParse(String),
    #[error("certificate not yet valid (NotBefore: {0})")]
    NotYetValid(String),
    #[error("certificate has expired (NotAfter: {0})")]
    Expired(String),
    #[error("certificate subject ({found}) does not match device ID ({device_id})")]
    CertificateSubjectMismatch { found: String, device_id: String },
    #[error("certificate chain verification failed: {0}")]
    ChainVerification(ChainError),
    #[error("public key length mismatch: CSR={csr}, cert={certificate}")]
    KeyLengthMismatch { csr: usize, certificate: usize },
    #[error("public keys do not match")]
    KeyMismatch,
}

impl ValidationError {
    /// Stable classification used in logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::CsrParse(_) => "csr_parse_failed",
            ValidationError::CsrSignature(_) => "csr_signature_invalid",
            ValidationError::CsrSubjectMismatch { .. } => "csr_subject_mismatch",
            ValidationError::CertificateMissing => "certificate_missing",
            ValidationError::CertificateParse(_) => "certificate_parse_failed",
            ValidationError::NotYetValid(_) => "certificate_not_yet_valid",
            ValidationError::Expired(_) => "certificate_expired",
            ValidationError::CertificateSubjectMismatch { .. } => "certificate_subject_mismatch",
            ValidationError::ChainVerification(_) => "certificate_chain_invalid",
            ValidationError::KeyLengthMismatch { .. } => "key_length_mismatch",
            ValidationError::KeyMismatch => "key_mismatch",
        }
    }

    #[must_use]
    pub fn is_key_mismatch(&self) -> bool {
        matches!(
            self,
            ValidationError::KeyMismatch | ValidationError::KeyLengthMismatch { .. }
        )
    }
}

/// A CSR that passed every check, ready for issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCsr {
    pub der: Vec<u8>,
    pub common_name: String,
}

/// Checks that a renewal request continues the identity of the presented
/// certificate. Holds no state besides the optional trust pool.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    trust: Option<TrustPool>,
}

impl Validator {
    #[must_use]
    pub fn new(trust: Option<TrustPool>) -> Self {
        Self { trust }
    }

    /// Validates the CSR, the presented certificate and their key binding.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate_renewal_request(
        &self,
        csr_pem: &[u8],
        device_id: &str,
        presented_der: Option<&[u8]>,
    ) -> Result<ValidatedCsr, ValidationError> {
        self.validate_renewal_request_at(
            csr_pem,
            device_id,
            presented_der,
            OffsetDateTime::now_utc(),
        )
    }

    /// Same as [`Validator::validate_renewal_request`] with an explicit clock.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate_renewal_request_at(
        &self,
        csr_pem: &[u8],
        device_id: &str,
        presented_der: Option<&[u8]>,
        now: OffsetDateTime,
    ) -> Result<ValidatedCsr, ValidationError> {
        let csr_der = validate_csr(csr_pem, device_id)?;
        let presented = presented_der.ok_or(ValidationError::CertificateMissing)?;
        self.validate_certificate_for_renewal(presented, device_id, now)?;
        verify_same_key_pair(&csr_der, presented)?;
        Ok(ValidatedCsr {
            der: csr_der,
            common_name: device_id.to_string(),
        })
    }

    /// Checks the validity window, subject and chain of the presented
    /// certificate.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] naming the failed check.
    pub fn validate_certificate_for_renewal(
        &self,
        presented_der: &[u8],
        device_id: &str,
        now: OffsetDateTime,
    ) -> Result<(), ValidationError> {
        let certificate = cert::parse_certificate(presented_der)
            .map_err(|e| ValidationError::CertificateParse(e.to_string()))?;
        let validity = certificate.validity();
        let not_before = validity.not_before.to_datetime();
        let not_after = validity.not_after.to_datetime();
        if now < not_before {
            return Err(ValidationError::NotYetValid(format_time(not_before)));
        }
        if now > not_after {
            return Err(ValidationError::Expired(format_time(not_after)));
        }

        let found = cert::common_name(certificate.subject()).unwrap_or_default();
        if found != device_id {
            return Err(ValidationError::CertificateSubjectMismatch {
                found,
                device_id: device_id.to_string(),
            });
        }

        if let Some(trust) = &self.trust {
            trust
                .verify_client_chain(&certificate, now)
                .map_err(ValidationError::ChainVerification)?;
        }

        debug!(
            device_id,
            serial = %cert::serial_hex(&certificate),
            not_after = %format_time(not_after),
            "Certificate validated successfully for renewal"
        );
        Ok(())
    }
}

/// Parses the CSR, checks its self-signature and its subject.
///
/// # Errors
/// Returns a [`ValidationError`] naming the failed check.
pub fn validate_csr(csr_pem: &[u8], device_id: &str) -> Result<Vec<u8>, ValidationError> {
    let der = cert::pem_to_der(csr_pem, PEM_LABEL_CERTIFICATE_REQUEST)
        .map_err(|e| ValidationError::CsrParse(e.to_string()))?;
    let csr = cert::parse_certificate_request(&der)
        .map_err(|e| ValidationError::CsrParse(e.to_string()))?;
    csr.verify_signature()
        .map_err(|e| ValidationError::CsrSignature(e.to_string()))?;

    let found = cert::common_name(&csr.certification_request_info.subject).unwrap_or_default();
    if found != device_id {
        return Err(ValidationError::CsrSubjectMismatch {
            found,
            device_id: device_id.to_string(),
        });
    }
    Ok(der)
}

/// Compares the DER `SubjectPublicKeyInfo` of the CSR and the certificate.
///
/// # Errors
/// Returns [`ValidationError::KeyLengthMismatch`] or
/// [`ValidationError::KeyMismatch`] when the keys differ.
pub fn verify_same_key_pair(csr_der: &[u8], cert_der: &[u8]) -> Result<(), ValidationError> {
    let csr = cert::parse_certificate_request(csr_der)
        .map_err(|e| ValidationError::CsrParse(e.to_string()))?;
    let certificate = cert::parse_certificate(cert_der)
        .map_err(|e| ValidationError::CertificateParse(e.to_string()))?;
    let csr_key = csr.certification_request_info.subject_pki.raw;
    let cert_key = certificate.tbs_certificate.subject_pki.raw;
    if csr_key.len() != cert_key.len() {
        return Err(ValidationError::KeyLengthMismatch {
            csr: csr_key.len(),
            certificate: cert_key.len(),
        });
    }
    if csr_key != cert_key {
        return Err(ValidationError::KeyMismatch);
    }
    Ok(())
}

fn format_time(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}
