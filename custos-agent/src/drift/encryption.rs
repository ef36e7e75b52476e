//! Encryption-status check: required volumes must be mounted as crypt
//! devices and declared TLS material must be unexpired.
//!
//! Enabling encryption is never automated; drift here is surfaced as an
//! alert for human intervention.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::util::command;

use super::baseline::{run_probe, BaselineConfig};
use super::{CheckName, DriftCheck, DriftResult, Severity};

const CONTROLS: &[&str] = &["164.312(a)(2)(iv)", "164.312(e)(2)(ii)"];

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

fn collect_crypt_devices(devices: &[BlockDevice], out: &mut Vec<String>) {
    for device in devices {
        if device.device_type == "crypt" {
            out.push(device.name.clone());
        }
        collect_crypt_devices(&device.children, out);
    }
}

pub struct EncryptionCheck;

#[async_trait]
impl DriftCheck for EncryptionCheck {
    fn name(&self) -> CheckName {
        CheckName::Encryption
    }

    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult> {
        let timeout = baseline.probe_timeout();

        let mut missing_volumes: Vec<String> = Vec::new();
        if !baseline.encrypted_volumes.is_empty() {
            let raw = run_probe(&baseline.lsblk_probe, timeout).await?;
            let parsed: LsblkOutput = serde_json::from_str(&raw)?;
            let mut crypt = Vec::new();
            collect_crypt_devices(&parsed.blockdevices, &mut crypt);
            missing_volumes = baseline
                .encrypted_volumes
                .iter()
                .filter(|v| !crypt.contains(v))
                .cloned()
                .collect();
        }

        let mut expired_certs: Vec<String> = Vec::new();
        for cert in &baseline.tls_cert_paths {
            let args = vec![
                "x509".to_string(),
                "-checkend".to_string(),
                "0".to_string(),
                "-noout".to_string(),
                "-in".to_string(),
                cert.to_string_lossy().to_string(),
            ];
            let out = command::run("openssl", &args, timeout, 256).await?;
            if !out.success() {
                expired_certs.push(cert.to_string_lossy().to_string());
            }
        }

        if missing_volumes.is_empty() && expired_certs.is_empty() {
            return Ok(DriftResult::clean(
                CheckName::Encryption,
                Severity::Critical,
                CONTROLS,
            ));
        }

        // no remediation runbook: encryption changes need a human
        Ok(DriftResult::drifted(
            CheckName::Encryption,
            Severity::Critical,
            json!({
                "unencrypted_volumes": missing_volumes,
                "expired_certificates": expired_certs,
            }),
            None,
            CONTROLS,
        ))
    }
}
