//! Drift detection: six independent, read-only compliance checks.
//!
//! All checks run concurrently with their own timeouts; a failing check
//! never prevents the others from producing a result, and a check error
//! is itself reported as drift (fail-closed).

pub mod baseline;

mod backup;
mod clock;
mod encryption;
mod manifest;
mod patches;
mod services;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

pub use baseline::BaselineConfig;
pub use clock::CLOCK_OFFSET_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Manifest,
    Patches,
    Backup,
    Services,
    Encryption,
    Clock,
}

impl CheckName {
    pub const ALL: [CheckName; 6] = [
        CheckName::Manifest,
        CheckName::Patches,
        CheckName::Backup,
        CheckName::Services,
        CheckName::Encryption,
        CheckName::Clock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::Manifest => "manifest",
            CheckName::Patches => "patches",
            CheckName::Backup => "backup",
            CheckName::Services => "services",
            CheckName::Encryption => "encryption",
            CheckName::Clock => "clock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of one check in one cycle. Ephemeral; folded into evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftResult {
    pub check_name: CheckName,
    pub drift_detected: bool,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub remediation_runbook_id: Option<String>,
    pub hipaa_controls: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl DriftResult {
    pub fn clean(check_name: CheckName, severity: Severity, controls: &[&str]) -> Self {
        DriftResult {
            check_name,
            drift_detected: false,
            severity,
            details: json!({}),
            remediation_runbook_id: None,
            hipaa_controls: controls.iter().map(|s| s.to_string()).collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn drifted(
        check_name: CheckName,
        severity: Severity,
        details: serde_json::Value,
        remediation_runbook_id: Option<&str>,
        controls: &[&str],
    ) -> Self {
        DriftResult {
            check_name,
            drift_detected: true,
            severity,
            details,
            remediation_runbook_id: remediation_runbook_id.map(|s| s.to_string()),
            hipaa_controls: controls.iter().map(|s| s.to_string()).collect(),
            timestamp: Utc::now(),
        }
    }

    /// Fail-closed result for a check that raised or timed out.
    pub fn check_error(check_name: CheckName, error: &str) -> Self {
        DriftResult {
            check_name,
            drift_detected: true,
            severity: Severity::Critical,
            details: json!({ "error": error }),
            remediation_runbook_id: None,
            hipaa_controls: vec!["164.312(b)".to_string()],
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DriftCheck: Send + Sync {
    fn name(&self) -> CheckName;
    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult>;
}

pub struct DriftDetector {
    baseline: Arc<BaselineConfig>,
    checks: Vec<Arc<dyn DriftCheck>>,
    check_timeout: Duration,
}

impl DriftDetector {
    pub fn new(baseline: Arc<BaselineConfig>) -> Self {
        let check_timeout = baseline.probe_timeout() * 3;
        DriftDetector {
            baseline,
            checks: vec![
                Arc::new(manifest::ManifestCheck),
                Arc::new(patches::PatchCheck),
                Arc::new(backup::BackupCheck),
                Arc::new(services::ServiceCheck),
                Arc::new(encryption::EncryptionCheck),
                Arc::new(clock::ClockCheck),
            ],
            check_timeout,
        }
    }

    /// Run all six checks concurrently. Each check gets its own timeout
    /// and its own task, so a panic or hang in one cannot take down the
    /// rest.
    pub async fn check_all(&self) -> BTreeMap<CheckName, DriftResult> {
        let handles: Vec<_> = self
            .checks
            .iter()
            .map(|check| {
                let check = Arc::clone(check);
                let baseline = Arc::clone(&self.baseline);
                let timeout = self.check_timeout;
                let name = check.name();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, check.run(&baseline)).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(err)) => {
                            warn!(check = name.as_str(), %err, "drift check failed");
                            DriftResult::check_error(name, &err.to_string())
                        }
                        Err(_) => {
                            warn!(check = name.as_str(), "drift check timed out");
                            DriftResult::check_error(name, "check timed out")
                        }
                    }
                });
                (name, handle)
            })
            .collect();

        let joined = futures::future::join_all(handles.into_iter().map(
            |(name, handle)| async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(err) => {
                        error!(check = name.as_str(), %err, "drift check task panicked");
                        DriftResult::check_error(name, "check panicked")
                    }
                };
                (name, result)
            },
        ))
        .await;
        joined.into_iter().collect::<BTreeMap<_, _>>()
    }
}
