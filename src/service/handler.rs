use std::time::Instant;

use poem::http::StatusCode;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::TRACING_COMPONENT;
use super::ca::CaSigner;
use super::issuer::{CertificateIssuer, IssueError};
use super::store::{
    CertificateRenewalRequest, RenewalStore, STATUS_COMPLETED, STATUS_FAILED, STATUS_PROCESSING,
};
use super::validator::{ValidationError, Validator};
use crate::agent::types::SecurityProofType;
use crate::cert::{self, PEM_LABEL_CERTIFICATE_REQUEST};
use crate::protocol::{
    ErrorResponse, RENEWAL_STATUS_COMPLETED, RenewalRequestBody, RenewalResponse,
};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request ID format: {0}")]
    InvalidRequestId(String),
    #[error("unsupported security proof type: {0} (only 'valid_cert' supported)")]
    UnsupportedProofType(String),
    #[error("invalid CSR format: {0}")]
    InvalidCsr(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] IssueError),
}

impl HandlerError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::InvalidRequestId(_)
            | HandlerError::UnsupportedProofType(_)
            | HandlerError::InvalidCsr(_) => StatusCode::BAD_REQUEST,
            HandlerError::Validation(_) => StatusCode::UNAUTHORIZED,
            HandlerError::Issuance(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing body: a classified message without internal detail.
    #[must_use]
    pub fn to_response(&self, request_id: Option<&str>) -> ErrorResponse {
        let (error, details) = match self {
            HandlerError::InvalidRequestId(_) => ("Invalid request ID format", None),
            HandlerError::UnsupportedProofType(proof) => {
                ("Unsupported security proof type", Some(proof.clone()))
            }
            HandlerError::InvalidCsr(_) => ("Invalid CSR format", None),
            HandlerError::Validation(err) => {
                ("Renewal request validation failed", Some(err.reason().to_string()))
            }
            HandlerError::Issuance(_) => ("Certificate issuance failed", None),
        };
        ErrorResponse {
            error: error.to_string(),
            details,
            request_id: request_id.map(ToString::to_string),
        }
    }
}

/// Renewal request metadata supplied by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct ClientContext<'a> {
    pub presented_certificate: Option<&'a [u8]>,
    pub client_ip: Option<String>,
}

pub struct RenewalHandler<C, S> {
    issuer: CertificateIssuer<C>,
    store: S,
    validator: Validator,
    org_id: String,
}

impl<C: CaSigner, S: RenewalStore> RenewalHandler<C, S> {
    #[must_use]
    pub fn new(
        issuer: CertificateIssuer<C>,
        store: S,
        validator: Validator,
        org_id: String,
    ) -> Self {
        Self {
            issuer,
            store,
            validator,
            org_id,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// Validates a renewal request, issues the replacement certificate and
    /// records the outcome in the audit store.
    ///
    /// # Errors
    /// Returns a [`HandlerError`] whose [`HandlerError::status`] is the HTTP
    /// status to answer with.
    pub async fn handle_renewal_request(
        &self,
        device_id: &str,
        request: &RenewalRequestBody,
        client: ClientContext<'_>,
    ) -> Result<RenewalResponse, HandlerError> {
        let span = info_span!(
            "renewal.handle",
            component = TRACING_COMPONENT,
            device_id,
            request_id = %request.request_id,
        );
        self.handle(device_id, request, client).instrument(span).await
    }

    async fn handle(
        &self,
        device_id: &str,
        request: &RenewalRequestBody,
        client: ClientContext<'_>,
    ) -> Result<RenewalResponse, HandlerError> {
        let started = Instant::now();
        let request_time = OffsetDateTime::now_utc();
        info!(
            proof_type = %request.security_proof_type,
            "Processing certificate renewal request"
        );

        Uuid::parse_str(&request.request_id)
            .map_err(|e| HandlerError::InvalidRequestId(e.to_string()))?;
        if SecurityProofType::parse(&request.security_proof_type)
            != Some(SecurityProofType::ValidCertificate)
        {
            return Err(HandlerError::UnsupportedProofType(
                request.security_proof_type.clone(),
            ));
        }
        cert::pem_to_der(request.csr.as_bytes(), PEM_LABEL_CERTIFICATE_REQUEST)
            .map_err(|e| HandlerError::InvalidCsr(e.to_string()))?;

        let validated = self
            .validator
            .validate_renewal_request(
                request.csr.as_bytes(),
                device_id,
                client.presented_certificate,
            )
            .inspect_err(|err| {
                warn!(reason = err.reason(), "Renewal request validation failed: {err}");
            })?;

        let mut record = CertificateRenewalRequest {
            device_id: device_id.to_string(),
            request_id: request.request_id.clone(),
            request_time,
            completion_time: None,
            status: STATUS_PROCESSING.to_string(),
            security_proof_type: request.security_proof_type.clone(),
            old_certificate_serial: request.old_certificate_serial.clone().unwrap_or_default(),
            new_certificate_serial: String::new(),
            new_certificate_pem: String::new(),
            client_ip: client.client_ip,
            error_message: String::new(),
            processing_duration_ms: 0,
        };
        if let Err(err) = self.store.create_renewal_request(&self.org_id, &record).await {
            error!("Failed to create renewal request record: {err}");
        }

        let issued = match self.issuer.issue_certificate(&validated.der, device_id).await {
            Ok(issued) => issued,
            Err(err) => {
                record.status = STATUS_FAILED.to_string();
                record.error_message = err.to_string();
                record.processing_duration_ms = elapsed_ms(started);
                record.completion_time = Some(OffsetDateTime::now_utc());
                if let Err(store_err) =
                    self.store.update_renewal_request(&self.org_id, &record).await
                {
                    error!("Failed to update renewal request record: {store_err}");
                }
                error!("Failed to issue certificate: {err}");
                return Err(err.into());
            }
        };

        let completed_at = OffsetDateTime::now_utc();
        record.status = STATUS_COMPLETED.to_string();
        record.new_certificate_serial.clone_from(&issued.serial_number);
        record.new_certificate_pem.clone_from(&issued.pem);
        record.processing_duration_ms = elapsed_ms(started);
        record.completion_time = Some(completed_at);
        if let Err(err) = self.store.update_renewal_request(&self.org_id, &record).await {
            warn!("Failed to update renewal request record: {err}");
        }

        info!(
            serial_number = %issued.serial_number,
            duration_ms = record.processing_duration_ms,
            "Certificate renewal completed successfully"
        );
        Ok(RenewalResponse {
            request_id: request.request_id.clone(),
            status: RENEWAL_STATUS_COMPLETED.to_string(),
            certificate: issued.pem,
            serial_number: issued.serial_number,
            not_before: issued.not_before,
            not_after: issued.not_after,
            issued_at: completed_at,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
