//! Declared baseline the host is reconciled against.
//!
//! Read once at startup and never mutated at runtime. On first start with
//! no baseline file present, the current host state is captured as the
//! initial baseline and persisted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use custos_shared::canonical;

use crate::util::command;
use crate::util::fs::atomic_write;

fn default_max_patch_age_days() -> u32 {
    14
}
fn default_max_backup_age_hours() -> i64 {
    26
}
fn default_max_restore_test_age_days() -> i64 {
    90
}
fn default_max_clock_skew_ms() -> i64 {
    90_000
}
fn default_probe_timeout_seconds() -> u64 {
    20
}
fn default_patch_status_path() -> PathBuf {
    PathBuf::from("/var/lib/custos/patch-status.json")
}
fn default_backup_status_path() -> PathBuf {
    PathBuf::from("/var/lib/custos/backup-status.json")
}
fn default_manifest_probe() -> Vec<String> {
    vec![
        "readlink".to_string(),
        "-f".to_string(),
        "/run/current-system".to_string(),
    ]
}
fn default_firewall_probe() -> Vec<String> {
    vec!["nft".to_string(), "list".to_string(), "ruleset".to_string()]
}
fn default_clock_probe() -> Vec<String> {
    vec!["chronyc".to_string(), "tracking".to_string()]
}
fn default_lsblk_probe() -> Vec<String> {
    vec![
        "lsblk".to_string(),
        "-J".to_string(),
        "-o".to_string(),
        "NAME,TYPE".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Hash of the declarative system generation the host must be on.
    #[serde(default)]
    pub expected_manifest_hash: String,
    /// Hash of the expected firewall ruleset; compared by the manifest check.
    #[serde(default)]
    pub expected_firewall_hash: Option<String>,
    #[serde(default = "default_max_patch_age_days")]
    pub max_patch_age_days: u32,
    #[serde(default = "default_max_backup_age_hours")]
    pub max_backup_age_hours: i64,
    #[serde(default = "default_max_restore_test_age_days")]
    pub max_restore_test_age_days: i64,
    #[serde(default)]
    pub critical_services: Vec<String>,
    #[serde(default)]
    pub encrypted_volumes: Vec<String>,
    #[serde(default)]
    pub tls_cert_paths: Vec<PathBuf>,
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: i64,

    // Probes: declarative argv, never a shell line.
    #[serde(default = "default_patch_status_path")]
    pub patch_status_path: PathBuf,
    #[serde(default = "default_backup_status_path")]
    pub backup_status_path: PathBuf,
    #[serde(default = "default_manifest_probe")]
    pub manifest_probe: Vec<String>,
    #[serde(default = "default_firewall_probe")]
    pub firewall_probe: Vec<String>,
    #[serde(default = "default_clock_probe")]
    pub clock_probe: Vec<String>,
    #[serde(default = "default_lsblk_probe")]
    pub lsblk_probe: Vec<String>,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        BaselineConfig {
            expected_manifest_hash: String::new(),
            expected_firewall_hash: None,
            max_patch_age_days: default_max_patch_age_days(),
            max_backup_age_hours: default_max_backup_age_hours(),
            max_restore_test_age_days: default_max_restore_test_age_days(),
            critical_services: Vec::new(),
            encrypted_volumes: Vec::new(),
            tls_cert_paths: Vec::new(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
            patch_status_path: default_patch_status_path(),
            backup_status_path: default_backup_status_path(),
            manifest_probe: default_manifest_probe(),
            firewall_probe: default_firewall_probe(),
            clock_probe: default_clock_probe(),
            lsblk_probe: default_lsblk_probe(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
        }
    }
}

impl BaselineConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read baseline {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse baseline {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("failed to serialize baseline")?;
        atomic_write(path, contents.as_bytes())
    }

    /// Load the baseline, or capture the current host state as the
    /// initial baseline when the file is absent. Returns the baseline and
    /// whether a first-run capture happened.
    pub async fn load_or_capture(path: &Path, template: BaselineConfig) -> Result<(Self, bool)> {
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }
        info!(path = %path.display(), "no baseline present, capturing current state");
        let baseline = template.capture_current().await;
        baseline.save(path)?;
        Ok((baseline, true))
    }

    /// Fill the expected hashes from the live host. Probe failures leave
    /// the corresponding expectation empty rather than aborting first run.
    async fn capture_current(mut self) -> Self {
        let timeout = self.probe_timeout();
        match run_probe(&self.manifest_probe, timeout).await {
            Ok(out) => self.expected_manifest_hash = canonical::content_hash(out.trim().as_bytes()),
            Err(err) => warn!(%err, "manifest probe failed during baseline capture"),
        }
        match run_probe(&self.firewall_probe, timeout).await {
            Ok(out) => {
                self.expected_firewall_hash = Some(canonical::content_hash(out.trim().as_bytes()))
            }
            Err(err) => warn!(%err, "firewall probe failed during baseline capture"),
        }
        self
    }
}

/// Run a declarative probe argv and return its stdout.
pub async fn run_probe(argv: &[String], timeout: Duration) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .context("probe command must not be empty")?;
    command::run_checked(program, args, timeout).await
}
