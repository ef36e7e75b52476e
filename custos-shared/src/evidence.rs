//! The durable audit artifact: signed, hash-chained evidence bundles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical;
use crate::identity::{DeploymentMode, SiteIdentity};

/// The six drift check names plus the coordinator pseudo-check. Order
/// bundles use `order:<order_id>` as their check value.
pub const CHECK_NAMES: [&str; 6] = [
    "manifest",
    "patches",
    "backup",
    "services",
    "encryption",
    "clock",
];

pub const COORDINATOR_CHECK: &str = "coordinator";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("timestamp_end precedes timestamp_start")]
    TimestampsReversed,
    #[error("unrecognized check value: {0}")]
    UnknownCheck(String),
    #[error("reseller_id must be populated iff deployment_mode is reseller")]
    ResellerMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Reverted,
    Deferred,
    Alert,
    Rejected,
    Expired,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Reverted => "reverted",
            Outcome::Deferred => "deferred",
            Outcome::Alert => "alert",
            Outcome::Rejected => "rejected",
            Outcome::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    TimedOut,
    Skipped,
}

/// Outcome of one runbook step, folded into the evidence bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub action: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
}

/// One signed compliance event. Immutable once serialized and signed;
/// referenced by content hash thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub bundle_id: String,
    pub site_id: String,
    pub host_id: String,
    pub deployment_mode: DeploymentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reseller_id: Option<String>,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub policy_version: String,
    pub check: String,
    #[serde(default)]
    pub hipaa_controls: Vec<String>,
    pub pre_state: serde_json::Value,
    pub post_state: serde_json::Value,
    #[serde(default)]
    pub action_taken: Vec<StepResult>,
    pub rollback_available: bool,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runbook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_bundle_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp_offset_ms: Option<i64>,
}

impl EvidenceBundle {
    /// Skeleton bundle for one event. Timestamps both start at `now`;
    /// the builder widens them to the earliest/latest event.
    pub fn new(identity: &SiteIdentity, policy_version: &str, check: &str, now: DateTime<Utc>) -> Self {
        EvidenceBundle {
            bundle_id: Uuid::new_v4().to_string(),
            site_id: identity.site_id.clone(),
            host_id: identity.host_id.clone(),
            deployment_mode: identity.deployment_mode,
            reseller_id: identity.reseller_id.clone(),
            timestamp_start: now,
            timestamp_end: now,
            policy_version: policy_version.to_string(),
            check: check.to_string(),
            hipaa_controls: Vec::new(),
            pre_state: serde_json::Value::Null,
            post_state: serde_json::Value::Null,
            action_taken: Vec::new(),
            rollback_available: false,
            outcome: Outcome::Alert,
            order_id: None,
            runbook_id: None,
            error: None,
            previous_bundle_hash: None,
            ntp_offset_ms: None,
        }
    }

    pub fn is_recognized_check(check: &str) -> bool {
        CHECK_NAMES.contains(&check) || check == COORDINATOR_CHECK || check.starts_with("order:")
    }

    pub fn validate(&self) -> Result<(), BundleError> {
        if self.timestamp_end < self.timestamp_start {
            return Err(BundleError::TimestampsReversed);
        }
        if !Self::is_recognized_check(&self.check) {
            return Err(BundleError::UnknownCheck(self.check.clone()));
        }
        let has_reseller = self.reseller_id.is_some();
        let is_reseller = self.deployment_mode == DeploymentMode::Reseller;
        if has_reseller != is_reseller {
            return Err(BundleError::ResellerMismatch);
        }
        Ok(())
    }

    /// Canonical serialization of the whole bundle; this is what gets
    /// detach-signed and content-hashed for the chain.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical::to_canonical_json(self)
    }

    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        Ok(canonical::content_hash(&self.canonical_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn identity() -> SiteIdentity {
        SiteIdentity {
            site_id: "site-001".to_string(),
            host_id: "appliance-a".to_string(),
            deployment_mode: DeploymentMode::Direct,
            reseller_id: None,
        }
    }

    #[test]
    fn test_new_bundle_validates() {
        let b = EvidenceBundle::new(&identity(), "v1", "services", Utc::now());
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_reversed_timestamps_rejected() {
        let mut b = EvidenceBundle::new(&identity(), "v1", "services", Utc::now());
        b.timestamp_end = b.timestamp_start - Duration::seconds(1);
        assert_eq!(b.validate(), Err(BundleError::TimestampsReversed));
    }

    #[test]
    fn test_unknown_check_rejected() {
        let b = EvidenceBundle::new(&identity(), "v1", "firmware", Utc::now());
        assert!(matches!(b.validate(), Err(BundleError::UnknownCheck(_))));
    }

    #[test]
    fn test_order_check_recognized() {
        let b = EvidenceBundle::new(&identity(), "v1", "order:ord-9", Utc::now());
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_reseller_mismatch_rejected() {
        let mut b = EvidenceBundle::new(&identity(), "v1", "clock", Utc::now());
        b.reseller_id = Some("rsl-1".to_string());
        assert_eq!(b.validate(), Err(BundleError::ResellerMismatch));
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let a = EvidenceBundle::new(&identity(), "v1", "clock", Utc::now());
        let mut b = a.clone();
        b.outcome = Outcome::Success;
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn test_outcome_snake_case() {
        assert_eq!(serde_json::to_string(&Outcome::Reverted).unwrap(), "\"reverted\"");
        assert_eq!(serde_json::to_string(&StepStatus::TimedOut).unwrap(), "\"timed_out\"");
    }
}
