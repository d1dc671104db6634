use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DnType, KeyPair};
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

pub const PEM_LABEL_CERTIFICATE: &str = "CERTIFICATE";
pub const PEM_LABEL_CERTIFICATE_REQUEST: &str = "CERTIFICATE REQUEST";
const PEM_LABEL_NEW_CERTIFICATE_REQUEST: &str = "NEW CERTIFICATE REQUEST";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to parse PEM: {0}")]
    Pem(String),
    #[error("Unexpected PEM block '{found}' (expected '{expected}')")]
    UnexpectedLabel { expected: &'static str, found: String },
    #[error("Failed to parse X509 certificate: {0}")]
    Certificate(String),
    #[error("Failed to parse certificate request: {0}")]
    CertificateRequest(String),
    #[error("Failed to parse private key: {0}")]
    Key(String),
    #[error("Failed to build certificate request: {0}")]
    Csr(String),
    #[error("Trust bundle contains no certificates")]
    EmptyTrustBundle,
}

/// Expiry and identity facts derived from a certificate.
///
/// Recomputed on every check; the fingerprint depends only on the DER bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMetadata {
    pub file_path: PathBuf,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub fingerprint: String,
}

/// Extracts metadata from a PEM encoded certificate.
///
/// # Errors
/// Returns an error if the PEM block or the certificate cannot be parsed.
pub fn metadata_from_pem(
    file_path: &Path,
    pem_bytes: &[u8],
) -> Result<CertificateMetadata, CertError> {
    let der = pem_to_der(pem_bytes, PEM_LABEL_CERTIFICATE)?;
    metadata_from_der(file_path, &der)
}

/// Extracts metadata from a DER encoded certificate.
///
/// # Errors
/// Returns an error if the certificate cannot be parsed.
pub fn metadata_from_der(file_path: &Path, der: &[u8]) -> Result<CertificateMetadata, CertError> {
    let cert = parse_certificate(der)?;
    Ok(CertificateMetadata {
        file_path: file_path.to_path_buf(),
        not_before: cert.validity().not_before.to_datetime(),
        not_after: cert.validity().not_after.to_datetime(),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial_number: serial_hex(&cert),
        fingerprint: sha256_hex(der),
    })
}

/// Decodes the first PEM block and checks its label.
///
/// # Errors
/// Returns an error if the input is not PEM or the label does not match.
pub fn pem_to_der(pem_bytes: &[u8], expected: &'static str) -> Result<Vec<u8>, CertError> {
    let (_, pem) =
        x509_parser::pem::parse_x509_pem(pem_bytes).map_err(|e| CertError::Pem(e.to_string()))?;
    let label_ok = pem.label == expected
        || (expected == PEM_LABEL_CERTIFICATE_REQUEST
            && pem.label == PEM_LABEL_NEW_CERTIFICATE_REQUEST);
    if !label_ok {
        return Err(CertError::UnexpectedLabel {
            expected,
            found: pem.label,
        });
    }
    Ok(pem.contents)
}

#[must_use]
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(label, der.to_vec()))
}

/// Parses a DER encoded certificate.
///
/// # Errors
/// Returns an error if the bytes are not a valid X.509 certificate.
pub fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, CertError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| CertError::Certificate(e.to_string()))
}

/// Parses a DER encoded PKCS#10 certificate request.
///
/// # Errors
/// Returns an error if the bytes are not a valid certificate request.
pub fn parse_certificate_request(der: &[u8]) -> Result<X509CertificationRequest<'_>, CertError> {
    X509CertificationRequest::from_der(der)
        .map(|(_, csr)| csr)
        .map_err(|e| CertError::CertificateRequest(e.to_string()))
}

#[must_use]
pub fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string)
}

/// Serial number as big-endian hex without leading zero bytes.
#[must_use]
pub fn serial_hex(cert: &X509Certificate<'_>) -> String {
    let raw = cert.raw_serial();
    let start = raw.iter().position(|byte| *byte != 0).unwrap_or(raw.len());
    hex_encode(&raw[start..])
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    hex_encode(digest.as_ref())
}

#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(output, "{byte:02x}");
    }
    output
}

/// Parses a PEM private key into a signing key pair.
///
/// # Errors
/// Returns an error if the key is not PEM or uses an algorithm that cannot sign.
pub fn parse_signing_key(pem: &str) -> Result<KeyPair, CertError> {
    KeyPair::from_pem(pem).map_err(|e| CertError::Key(e.to_string()))
}

/// Builds a PEM certificate request over `key` with subject CN `common_name`.
///
/// # Errors
/// Returns an error if the request cannot be signed or serialized.
pub fn make_csr(key: &KeyPair, common_name: &str) -> Result<String, CertError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name.to_string());
    let csr = params
        .serialize_request(key)
        .map_err(|e| CertError::Csr(e.to_string()))?;
    csr.pem().map_err(|e| CertError::Csr(e.to_string()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("certificate is not permitted for client authentication")]
    ClientAuthNotPermitted,
    #[error("certificate signed by unknown authority")]
    UnknownAuthority,
}

/// Set of trusted CA certificates used to verify client chains.
#[derive(Debug, Clone)]
pub struct TrustPool {
    anchors: Vec<Vec<u8>>,
}

impl TrustPool {
    /// Loads every `CERTIFICATE` block from a PEM bundle.
    ///
    /// # Errors
    /// Returns an error if a block cannot be parsed or the bundle is empty.
    pub fn from_pem_bundle(bundle: &[u8]) -> Result<Self, CertError> {
        let mut anchors = Vec::new();
        for pem in Pem::iter_from_buffer(bundle) {
            let pem = pem.map_err(|e| CertError::Pem(e.to_string()))?;
            if pem.label != PEM_LABEL_CERTIFICATE {
                continue;
            }
            parse_certificate(&pem.contents)?;
            anchors.push(pem.contents);
        }
        if anchors.is_empty() {
            return Err(CertError::EmptyTrustBundle);
        }
        Ok(Self { anchors })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Verifies that `leaf` chains to a pool CA at `now` and allows client auth.
    ///
    /// # Errors
    /// Returns a [`ChainError`] describing why the chain was rejected.
    pub fn verify_client_chain(
        &self,
        leaf: &X509Certificate<'_>,
        now: OffsetDateTime,
    ) -> Result<(), ChainError> {
        if !permits_client_auth(leaf) {
            return Err(ChainError::ClientAuthNotPermitted);
        }
        for anchor_der in &self.anchors {
            let Ok(anchor) = parse_certificate(anchor_der) else {
                continue;
            };
            if anchor.subject().as_raw() != leaf.issuer().as_raw() {
                continue;
            }
            if !is_ca(&anchor) || !valid_at(&anchor, now) || !permits_client_auth(&anchor) {
                continue;
            }
            if leaf.verify_signature(Some(anchor.public_key())).is_ok() {
                return Ok(());
            }
        }
        Err(ChainError::UnknownAuthority)
    }
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

fn valid_at(cert: &X509Certificate<'_>, now: OffsetDateTime) -> bool {
    let validity = cert.validity();
    now >= validity.not_before.to_datetime() && now <= validity.not_after.to_datetime()
}

// No EKU extension means any usage.
fn permits_client_auth(cert: &X509Certificate<'_>) -> bool {
    match cert.extended_key_usage() {
        Ok(Some(eku)) => eku.value.any || eku.value.client_auth,
        Ok(None) => true,
        Err(_) => false,
    }
}
