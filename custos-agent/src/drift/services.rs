//! Service-health check: every declared critical service must be active
//! per the init system.

use async_trait::async_trait;
use serde_json::json;

use crate::util::command;

use super::baseline::BaselineConfig;
use super::{CheckName, DriftCheck, DriftResult, Severity};

const CONTROLS: &[&str] = &["164.312(b)"];
pub const REMEDIATION: &str = "RB-SERVICE-001";

pub struct ServiceCheck;

/// A probe error counts as inactive: we cannot prove the service is up.
async fn is_active(service: &str, baseline: &BaselineConfig) -> bool {
    let args = vec!["is-active".to_string(), service.to_string()];
    match command::run("systemctl", &args, baseline.probe_timeout(), 256).await {
        Ok(out) => out.success() && out.stdout.trim() == "active",
        Err(_) => false,
    }
}

#[async_trait]
impl DriftCheck for ServiceCheck {
    fn name(&self) -> CheckName {
        CheckName::Services
    }

    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult> {
        let mut inactive = Vec::new();
        for service in &baseline.critical_services {
            if !is_active(service, baseline).await {
                inactive.push(service.clone());
            }
        }

        if inactive.is_empty() {
            Ok(DriftResult::clean(
                CheckName::Services,
                Severity::High,
                CONTROLS,
            ))
        } else {
            Ok(DriftResult::drifted(
                CheckName::Services,
                Severity::High,
                json!({
                    "inactive_services": inactive,
                    "declared_services": baseline.critical_services,
                }),
                Some(REMEDIATION),
                CONTROLS,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_declared_services_is_clean() {
        let baseline = BaselineConfig::default();
        let result = ServiceCheck.run(&baseline).await.unwrap();
        assert!(!result.drift_detected);
        assert_eq!(result.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_unknown_service_counts_as_inactive() {
        let baseline = BaselineConfig {
            critical_services: vec!["custos-test-no-such-service".to_string()],
            ..BaselineConfig::default()
        };
        let result = ServiceCheck.run(&baseline).await.unwrap();
        assert!(result.drift_detected);
        assert_eq!(
            result.details["inactive_services"],
            json!(["custos-test-no-such-service"])
        );
        assert_eq!(result.remediation_runbook_id.as_deref(), Some(REMEDIATION));
    }
}
