//! Configuration-manifest check: the live system generation (and firewall
//! ruleset) must hash to what the baseline declares.

use async_trait::async_trait;
use serde_json::json;

use custos_shared::canonical;

use super::baseline::{run_probe, BaselineConfig};
use super::{CheckName, DriftCheck, DriftResult, Severity};

const CONTROLS: &[&str] = &["164.310(d)(1)", "164.312(c)(1)"];
pub const REMEDIATION: &str = "RB-DRIFT-001";

pub struct ManifestCheck;

#[async_trait]
impl DriftCheck for ManifestCheck {
    fn name(&self) -> CheckName {
        CheckName::Manifest
    }

    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult> {
        let timeout = baseline.probe_timeout();

        let out = run_probe(&baseline.manifest_probe, timeout).await?;
        let current_hash = canonical::content_hash(out.trim().as_bytes());
        let manifest_drift = current_hash != baseline.expected_manifest_hash;

        let mut details = json!({
            "expected_manifest_hash": baseline.expected_manifest_hash,
            "current_manifest_hash": current_hash,
        });

        let mut firewall_drift = false;
        if let Some(expected_fw) = &baseline.expected_firewall_hash {
            let fw_out = run_probe(&baseline.firewall_probe, timeout).await?;
            let fw_hash = canonical::content_hash(fw_out.trim().as_bytes());
            firewall_drift = &fw_hash != expected_fw;
            details["expected_firewall_hash"] = json!(expected_fw);
            details["current_firewall_hash"] = json!(fw_hash);
        }

        if manifest_drift || firewall_drift {
            Ok(DriftResult::drifted(
                CheckName::Manifest,
                Severity::Critical,
                details,
                Some(REMEDIATION),
                CONTROLS,
            ))
        } else {
            Ok(DriftResult::clean(
                CheckName::Manifest,
                Severity::Critical,
                CONTROLS,
            ))
        }
    }
}
