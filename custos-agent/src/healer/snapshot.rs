//! Pre/post healing health snapshots: critical service states, disk
//! usage, 1-minute load.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::util::command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    /// critical service name -> active
    pub services: BTreeMap<String, bool>,
    /// mount point -> used percent
    pub disk_usage_percent: BTreeMap<String, f32>,
    pub load_avg_1m: f64,
}

impl HealthSnapshot {
    pub fn to_state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn all_services_active(&self) -> bool {
        self.services.values().all(|active| *active)
    }
}

/// Capture the current host health. In dry-run mode the snapshot is
/// deterministic placeholder data and touches neither disks nor the init
/// system.
pub async fn capture(
    critical_services: &[String],
    probe_timeout: Duration,
    dry_run: bool,
) -> HealthSnapshot {
    if dry_run {
        return HealthSnapshot {
            timestamp: Utc::now(),
            services: critical_services.iter().map(|s| (s.clone(), true)).collect(),
            disk_usage_percent: BTreeMap::new(),
            load_avg_1m: 0.0,
        };
    }

    let mut services = BTreeMap::new();
    for service in critical_services {
        let args = vec!["is-active".to_string(), service.clone()];
        let active = match command::run("systemctl", &args, probe_timeout, 256).await {
            Ok(out) => out.success() && out.stdout.trim() == "active",
            Err(_) => false,
        };
        services.insert(service.clone(), active);
    }

    let disks = Disks::new_with_refreshed_list();
    let mut disk_usage_percent = BTreeMap::new();
    for disk in &disks {
        let total = disk.total_space();
        if total == 0 {
            continue;
        }
        let used = total - disk.available_space();
        disk_usage_percent.insert(
            disk.mount_point().to_string_lossy().to_string(),
            (used as f32 / total as f32) * 100.0,
        );
    }

    HealthSnapshot {
        timestamp: Utc::now(),
        services,
        disk_usage_percent,
        load_avg_1m: System::load_average().one,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_snapshot_is_placeholder() {
        let services = vec!["chronyd".to_string(), "sshd".to_string()];
        let snap = capture(&services, Duration::from_secs(1), true).await;
        assert_eq!(snap.services.len(), 2);
        assert!(snap.all_services_active());
        assert!(snap.disk_usage_percent.is_empty());
        assert_eq!(snap.load_avg_1m, 0.0);
    }

    #[tokio::test]
    async fn test_real_snapshot_reports_disks() {
        let snap = capture(&[], Duration::from_secs(5), false).await;
        assert!(snap.services.is_empty());
        // any host running the tests has at least one mounted filesystem
        for pct in snap.disk_usage_percent.values() {
            assert!(*pct >= 0.0 && *pct <= 100.0);
        }
    }

    #[test]
    fn test_to_state_is_json_object() {
        let snap = HealthSnapshot {
            timestamp: Utc::now(),
            services: BTreeMap::from([("chronyd".to_string(), false)]),
            disk_usage_percent: BTreeMap::new(),
            load_avg_1m: 0.25,
        };
        let state = snap.to_state();
        assert_eq!(state["services"]["chronyd"], serde_json::json!(false));
        assert!(!snap.all_services_active());
    }
}
