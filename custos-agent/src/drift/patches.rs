//! Patch-status check: no pending critical security update may be older
//! than the configured maximum age.
//!
//! The host's update timer writes a JSON status record; this check only
//! parses it, keeping the detector read-only.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::baseline::BaselineConfig;
use super::{CheckName, DriftCheck, DriftResult, Severity};

const CONTROLS: &[&str] = &["164.308(a)(5)(ii)(B)", "164.312(c)(1)"];
pub const REMEDIATION: &str = "RB-PATCH-001";

#[derive(Debug, Deserialize)]
struct PatchStatus {
    #[allow(dead_code)]
    generated_at: DateTime<Utc>,
    #[serde(default)]
    pending: Vec<PendingPatch>,
}

#[derive(Debug, Deserialize)]
struct PendingPatch {
    name: String,
    severity: String,
    published_at: DateTime<Utc>,
}

pub struct PatchCheck;

#[async_trait]
impl DriftCheck for PatchCheck {
    fn name(&self) -> CheckName {
        CheckName::Patches
    }

    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult> {
        let raw = tokio::fs::read_to_string(&baseline.patch_status_path).await?;
        let status: PatchStatus = serde_json::from_str(&raw)?;

        let horizon = Utc::now() - Duration::days(baseline.max_patch_age_days as i64);
        let overdue: Vec<&PendingPatch> = status
            .pending
            .iter()
            .filter(|p| p.severity.eq_ignore_ascii_case("critical") && p.published_at < horizon)
            .collect();

        if overdue.is_empty() {
            Ok(DriftResult::clean(
                CheckName::Patches,
                Severity::Critical,
                CONTROLS,
            ))
        } else {
            let names: Vec<&str> = overdue.iter().map(|p| p.name.as_str()).collect();
            Ok(DriftResult::drifted(
                CheckName::Patches,
                Severity::Critical,
                json!({
                    "overdue_critical_patches": names,
                    "max_patch_age_days": baseline.max_patch_age_days,
                }),
                Some(REMEDIATION),
                CONTROLS,
            ))
        }
    }
}
