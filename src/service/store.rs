//! Audit trail of renewal requests handled by the service.

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRenewalRequest {
    pub device_id: String,
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub request_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completion_time: Option<OffsetDateTime>,
    pub status: String,
    pub security_proof_type: String,
    pub old_certificate_serial: String,
    pub new_certificate_serial: String,
    pub new_certificate_pem: String,
    pub client_ip: Option<String>,
    pub error_message: String,
    pub processing_duration_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("renewal request {0} already exists")]
    Duplicate(String),
    #[error("renewal request {0} not found")]
    NotFound(String),
}

/// Persistence for renewal audit records, scoped by organization.
pub trait RenewalStore: Send + Sync {
    fn create_renewal_request(
        &self,
        org_id: &str,
        record: &CertificateRenewalRequest,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_renewal_request(
        &self,
        org_id: &str,
        record: &CertificateRenewalRequest,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_renewal_request(
        &self,
        org_id: &str,
        request_id: &str,
    ) -> impl Future<Output = Result<CertificateRenewalRequest, StoreError>> + Send;

    /// Lists records for `device_id`, newest first. A `limit` of zero
    /// returns every record.
    fn list_renewal_requests(
        &self,
        org_id: &str,
        device_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<CertificateRenewalRequest>, StoreError>> + Send;
}

type OrgRecords = HashMap<String, CertificateRenewalRequest>;

#[derive(Debug, Default)]
pub struct InMemoryRenewalStore {
    records: RwLock<HashMap<String, OrgRecords>>,
}

impl InMemoryRenewalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenewalStore for InMemoryRenewalStore {
    async fn create_renewal_request(
        &self,
        org_id: &str,
        record: &CertificateRenewalRequest,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let org = records.entry(org_id.to_string()).or_default();
        if org.contains_key(&record.request_id) {
            return Err(StoreError::Duplicate(record.request_id.clone()));
        }
        org.insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn update_renewal_request(
        &self,
        org_id: &str,
        record: &CertificateRenewalRequest,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let existing = records
            .get_mut(org_id)
            .and_then(|org| org.get_mut(&record.request_id))
            .ok_or_else(|| StoreError::NotFound(record.request_id.clone()))?;
        *existing = record.clone();
        Ok(())
    }

    async fn get_renewal_request(
        &self,
        org_id: &str,
        request_id: &str,
    ) -> Result<CertificateRenewalRequest, StoreError> {
        self.records
            .read()
            .await
            .get(org_id)
            .and_then(|org| org.get(request_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))
    }

    async fn list_renewal_requests(
        &self,
        org_id: &str,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<CertificateRenewalRequest>, StoreError> {
        let records = self.records.read().await;
        let mut matches: Vec<_> = records
            .get(org_id)
            .into_iter()
            .flat_map(HashMap::values)
            .filter(|record| record.device_id == device_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.request_time.cmp(&a.request_time));
        if limit > 0 {
            matches.truncate(limit);
        }
        Ok(matches)
    }
}
