//! Runbook-specific fix verification, run after the step loop against the
//! post-heal snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use custos_shared::canonical;

use crate::drift::baseline::{run_probe, BaselineConfig};

use super::snapshot::HealthSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FixCheck {
    /// Every declared critical service is active after healing.
    ServicesActive,
    /// A backup success newer than the pre-heal snapshot exists.
    BackupFresh,
    /// The live manifest hash matches the baseline again.
    ManifestMatch,
    /// No runbook-specific verification.
    #[default]
    None,
}

#[derive(Debug, Deserialize)]
struct BackupStatus {
    last_success_at: Option<DateTime<Utc>>,
}

/// Returns whether the fix held. Verification errors count as failure:
/// we cannot prove the remediation worked.
pub async fn verify_fix(
    kind: FixCheck,
    baseline: &BaselineConfig,
    pre: &HealthSnapshot,
    post: &HealthSnapshot,
    dry_run: bool,
) -> bool {
    if dry_run {
        return true;
    }
    match kind {
        FixCheck::None => true,
        FixCheck::ServicesActive => post.all_services_active(),
        FixCheck::BackupFresh => match read_last_success(baseline).await {
            Some(at) => at > pre.timestamp,
            None => false,
        },
        FixCheck::ManifestMatch => {
            match run_probe(&baseline.manifest_probe, baseline.probe_timeout()).await {
                Ok(out) => {
                    let hash = canonical::content_hash(out.trim().as_bytes());
                    debug!(%hash, expected = %baseline.expected_manifest_hash, "manifest verify");
                    hash == baseline.expected_manifest_hash
                }
                Err(_) => false,
            }
        }
    }
}

async fn read_last_success(baseline: &BaselineConfig) -> Option<DateTime<Utc>> {
    let raw = tokio::fs::read_to_string(&baseline.backup_status_path)
        .await
        .ok()?;
    let status: BackupStatus = serde_json::from_str(&raw).ok()?;
    status.last_success_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn snapshot(services_active: bool, timestamp: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            timestamp,
            services: BTreeMap::from([("chronyd".to_string(), services_active)]),
            disk_usage_percent: BTreeMap::new(),
            load_avg_1m: 0.0,
        }
    }

    #[tokio::test]
    async fn test_services_active_verifier() {
        let baseline = BaselineConfig::default();
        let now = Utc::now();
        assert!(
            verify_fix(
                FixCheck::ServicesActive,
                &baseline,
                &snapshot(false, now),
                &snapshot(true, now),
                false
            )
            .await
        );
        assert!(
            !verify_fix(
                FixCheck::ServicesActive,
                &baseline,
                &snapshot(false, now),
                &snapshot(false, now),
                false
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_backup_fresh_requires_post_pre_ordering() {
        let dir = TempDir::new().unwrap();
        let status_path = dir.path().join("backup-status.json");
        let baseline = BaselineConfig {
            backup_status_path: status_path.clone(),
            ..BaselineConfig::default()
        };
        let pre_time = Utc::now();

        // backup finished after the pre-snapshot: verified
        let fresh = serde_json::json!({
            "last_success_at": pre_time + ChronoDuration::seconds(30)
        });
        tokio::fs::write(&status_path, fresh.to_string()).await.unwrap();
        let pre = snapshot(true, pre_time);
        let post = snapshot(true, pre_time + ChronoDuration::seconds(60));
        assert!(verify_fix(FixCheck::BackupFresh, &baseline, &pre, &post, false).await);

        // stale record: not verified
        let stale = serde_json::json!({
            "last_success_at": pre_time - ChronoDuration::hours(4)
        });
        tokio::fs::write(&status_path, stale.to_string()).await.unwrap();
        assert!(!verify_fix(FixCheck::BackupFresh, &baseline, &pre, &post, false).await);
    }

    #[tokio::test]
    async fn test_manifest_match_verifier() {
        let now = Utc::now();
        let baseline = BaselineConfig {
            expected_manifest_hash: canonical::content_hash(b"gen-1"),
            manifest_probe: vec!["echo".to_string(), "gen-1".to_string()],
            ..BaselineConfig::default()
        };
        assert!(
            verify_fix(
                FixCheck::ManifestMatch,
                &baseline,
                &snapshot(true, now),
                &snapshot(true, now),
                false
            )
            .await
        );

        let drifted = BaselineConfig {
            manifest_probe: vec!["echo".to_string(), "gen-2".to_string()],
            ..baseline
        };
        assert!(
            !verify_fix(
                FixCheck::ManifestMatch,
                &drifted,
                &snapshot(true, now),
                &snapshot(true, now),
                false
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_verification_error_counts_as_failure() {
        let baseline = BaselineConfig {
            backup_status_path: "/nonexistent/backup-status.json".into(),
            ..BaselineConfig::default()
        };
        let now = Utc::now();
        let snap = snapshot(true, now);
        assert!(!verify_fix(FixCheck::BackupFresh, &baseline, &snap, &snap, false).await);
    }

    #[tokio::test]
    async fn test_dry_run_always_verifies() {
        let baseline = BaselineConfig::default();
        let now = Utc::now();
        let bad = snapshot(false, now);
        assert!(verify_fix(FixCheck::ServicesActive, &baseline, &bad, &bad, true).await);
    }
}
