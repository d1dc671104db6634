use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How a renewal request proves the requester controls the identity.
///
/// Only [`SecurityProofType::ValidCertificate`] is produced today; the other
/// variants are reserved for expired-certificate recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SecurityProofType {
    #[serde(rename = "valid_cert")]
    ValidCertificate,
    #[serde(rename = "bootstrap_cert")]
    BootstrapCertificate,
    #[serde(rename = "tpm_attestation")]
    TpmAttestation,
}

impl SecurityProofType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityProofType::ValidCertificate => "valid_cert",
            SecurityProofType::BootstrapCertificate => "bootstrap_cert",
            SecurityProofType::TpmAttestation => "tpm_attestation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "valid_cert" => Some(SecurityProofType::ValidCertificate),
            "bootstrap_cert" => Some(SecurityProofType::BootstrapCertificate),
            "tpm_attestation" => Some(SecurityProofType::TpmAttestation),
            _ => None,
        }
    }
}

impl std::fmt::Display for SecurityProofType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenewalStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

impl RenewalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RenewalStatus::Pending => "pending",
            RenewalStatus::Submitted => "submitted",
            RenewalStatus::Completed => "completed",
            RenewalStatus::Failed => "failed",
        }
    }
}

/// A renewal request as tracked by the agent.
///
/// Once it fails its first submission the retry queue owns it and is the only
/// writer of `retry_count`, `next_retry_at` and `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalRequest {
    pub request_id: String,
    pub device_id: String,
    pub old_certificate_serial: String,
    pub csr: Vec<u8>,
    pub security_proof_type: SecurityProofType,
    pub created_at: OffsetDateTime,
    pub retry_count: u32,
    pub next_retry_at: Option<OffsetDateTime>,
    pub status: RenewalStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_proof_type_wire_names() {
        let cases = [
            (SecurityProofType::ValidCertificate, "\"valid_cert\""),
            (SecurityProofType::BootstrapCertificate, "\"bootstrap_cert\""),
            (SecurityProofType::TpmAttestation, "\"tpm_attestation\""),
        ];
        for (proof, json) in cases {
            assert_eq!(serde_json::to_string(&proof).unwrap(), json);
            assert_eq!(SecurityProofType::parse(proof.as_str()), Some(proof));
        }
        assert_eq!(SecurityProofType::parse("password"), None);
    }

    #[test]
    fn test_renewal_status_deserialization() {
        let status: RenewalStatus = serde_json::from_str("\"submitted\"").unwrap();
        assert_eq!(status, RenewalStatus::Submitted);
        assert_eq!(RenewalStatus::Failed.as_str(), "failed");
    }
}
