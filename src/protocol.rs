//! JSON bodies exchanged on the renewal endpoint.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const RENEWAL_STATUS_COMPLETED: &str = "completed";

/// Builds the renewal endpoint path for a device.
#[must_use]
pub fn renewal_path(device_id: &str) -> String {
    format!("/api/v1/devices/{device_id}/certificaterenewal")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RenewalRequestBody {
    pub request_id: String,
    pub csr: String,
    pub security_proof_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_certificate_serial: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RenewalResponse {
    pub request_id: String,
    pub status: String,
    pub certificate: String,
    pub serial_number: String,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_uses_camel_case() {
        let body = RenewalRequestBody {
            request_id: "id".to_string(),
            csr: "csr".to_string(),
            security_proof_type: "valid_cert".to_string(),
            old_certificate_serial: None,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["requestId"], "id");
        assert_eq!(json["securityProofType"], "valid_cert");
        assert!(json.get("oldCertificateSerial").is_none());
    }

    #[test]
    fn test_response_timestamps_are_rfc3339() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let response = RenewalResponse {
            request_id: "id".to_string(),
            status: RENEWAL_STATUS_COMPLETED.to_string(),
            certificate: "pem".to_string(),
            serial_number: "01".to_string(),
            not_before: at,
            not_after: at,
            issued_at: at,
        };
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["notAfter"], "2023-11-14T22:13:20Z");
        assert_eq!(json["serialNumber"], "01");
    }

    #[test]
    fn test_renewal_path() {
        assert_eq!(
            renewal_path("dev-1"),
            "/api/v1/devices/dev-1/certificaterenewal"
        );
    }
}
