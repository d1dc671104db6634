use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use x509_parser::certificate::X509Certificate;

use super::ca::{CLIENT_BOOTSTRAP_SIGNER_NAME, CaError, CaSigner, SignRequest};
use crate::cert::{self, PEM_LABEL_CERTIFICATE, PEM_LABEL_CERTIFICATE_REQUEST};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("creating sign request: {0}")]
    SignRequest(String),
    #[error("signing certificate: {0}")]
    Signing(#[from] CaError),
    #[error("parsing signed certificate: {0}")]
    Parse(String),
    #[error("certificate is nil")]
    MissingCertificate,
    #[error("certificate subject ({found}) does not match device ID ({device_id})")]
    SubjectMismatch { found: String, device_id: String },
    #[error("certificate NotAfter is before NotBefore")]
    InvalidValidity,
}

/// A freshly signed certificate and the facts the handler reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub pem: String,
    pub serial_number: String,
    pub common_name: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub fingerprint: String,
}

pub struct CertificateIssuer<C> {
    ca: C,
}

impl<C: CaSigner> CertificateIssuer<C> {
    #[must_use]
    pub fn new(ca: C) -> Self {
        Self { ca }
    }

    #[must_use]
    pub fn ca(&self) -> &C {
        &self.ca
    }

    /// Signs a validated CSR for `device_id` with the client-bootstrap profile.
    ///
    /// # Errors
    /// Returns an [`IssueError`] if the CA rejects the request or returns a
    /// certificate that does not belong to `device_id`.
    pub async fn issue_certificate(
        &self,
        csr_der: &[u8],
        device_id: &str,
    ) -> Result<IssuedCertificate, IssueError> {
        cert::parse_certificate_request(csr_der)
            .map_err(|e| IssueError::SignRequest(e.to_string()))?;
        let request = SignRequest {
            signer_name: CLIENT_BOOTSTRAP_SIGNER_NAME.to_string(),
            csr_pem: cert::der_to_pem(PEM_LABEL_CERTIFICATE_REQUEST, csr_der),
            resource_name: device_id.to_string(),
        };

        let pem = self.ca.sign(&request).await?;
        let der = cert::pem_to_der(pem.as_bytes(), PEM_LABEL_CERTIFICATE)
            .map_err(|e| IssueError::Parse(e.to_string()))?;
        let certificate =
            cert::parse_certificate(&der).map_err(|e| IssueError::Parse(e.to_string()))?;
        validate_certificate(Some(&certificate), device_id)?;

        let issued = IssuedCertificate {
            serial_number: cert::serial_hex(&certificate),
            common_name: device_id.to_string(),
            not_before: certificate.validity().not_before.to_datetime(),
            not_after: certificate.validity().not_after.to_datetime(),
            fingerprint: cert::sha256_hex(&der),
            pem,
        };
        debug!(
            device_id,
            serial = %issued.serial_number,
            not_after = %issued.not_after,
            "Certificate issued successfully"
        );
        Ok(issued)
    }
}

/// Sanity checks a certificate returned by the CA.
///
/// # Errors
/// Returns an [`IssueError`] if the certificate is absent, names another
/// device, or has an inverted validity window.
pub fn validate_certificate(
    certificate: Option<&X509Certificate<'_>>,
    device_id: &str,
) -> Result<(), IssueError> {
    let certificate = certificate.ok_or(IssueError::MissingCertificate)?;
    let found = cert::common_name(certificate.subject()).unwrap_or_default();
    if found != device_id {
        return Err(IssueError::SubjectMismatch {
            found,
            device_id: device_id.to_string(),
        });
    }
    let validity = certificate.validity();
    if validity.not_after.to_datetime() < validity.not_before.to_datetime() {
        return Err(IssueError::InvalidValidity);
    }
    Ok(())
}
