//! Backup-freshness check: the most recent successful backup and the most
//! recent restore test must both be inside their thresholds.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::baseline::BaselineConfig;
use super::{CheckName, DriftCheck, DriftResult, Severity};

const CONTROLS: &[&str] = &["164.308(a)(7)(ii)(A)", "164.308(a)(7)(ii)(B)"];
pub const REMEDIATION: &str = "RB-BACKUP-001";

#[derive(Debug, Deserialize)]
struct BackupStatus {
    last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_restore_test_at: Option<DateTime<Utc>>,
}

pub struct BackupCheck;

#[async_trait]
impl DriftCheck for BackupCheck {
    fn name(&self) -> CheckName {
        CheckName::Backup
    }

    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult> {
        let raw = tokio::fs::read_to_string(&baseline.backup_status_path).await?;
        let status: BackupStatus = serde_json::from_str(&raw)?;
        let now = Utc::now();

        let backup_horizon = now - Duration::hours(baseline.max_backup_age_hours);
        let restore_horizon = now - Duration::days(baseline.max_restore_test_age_days);

        let backup_stale = match status.last_success_at {
            Some(at) => at < backup_horizon,
            None => true,
        };
        let restore_stale = match status.last_restore_test_at {
            Some(at) => at < restore_horizon,
            None => true,
        };

        if !backup_stale && !restore_stale {
            return Ok(DriftResult::clean(
                CheckName::Backup,
                Severity::Critical,
                CONTROLS,
            ));
        }

        Ok(DriftResult::drifted(
            CheckName::Backup,
            Severity::Critical,
            json!({
                "backup_stale": backup_stale,
                "restore_test_stale": restore_stale,
                "last_success_at": status.last_success_at,
                "last_restore_test_at": status.last_restore_test_at,
                "max_backup_age_hours": baseline.max_backup_age_hours,
                "max_restore_test_age_days": baseline.max_restore_test_age_days,
            }),
            Some(REMEDIATION),
            CONTROLS,
        ))
    }
}
