//! Agent configuration: site identity, coordinator endpoints, key paths,
//! store locations, intervals. Loaded once at startup; configuration
//! errors are fatal and exit the process non-zero.

pub mod window;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use custos_shared::identity::{DeploymentMode, SiteIdentity};

pub use window::MaintenanceWindow;

fn default_poll_interval() -> u64 {
    60
}
fn default_order_ttl_minimum() -> u64 {
    60
}
fn default_retention_days() -> u32 {
    365
}
fn default_retention_days_minimum() -> u32 {
    7
}
fn default_keep_last_n() -> u32 {
    5
}
fn default_max_clock_skew_ms() -> i64 {
    90_000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_upload_batch_size() -> usize {
    10
}
fn default_retry_attempt_cap() -> u32 {
    50
}
fn default_max_retry_attempts() -> u32 {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_policy_version() -> String {
    "baseline-v1".to_string()
}
fn default_window() -> MaintenanceWindow {
    "02:00-04:00".parse().unwrap()
}
fn default_hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Identity
    pub site_id: String,
    #[serde(default = "default_hostname")]
    pub host_id: String,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub reseller_id: Option<String>,

    // Coordinator
    pub coordinator_url: String,
    pub coordinator_allowed_hosts: Vec<String>,
    #[serde(default)]
    pub bearer_token_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    #[serde(default)]
    pub trusted_ca_path: Option<PathBuf>,

    // Keys
    pub signing_key_path: PathBuf,
    pub trusted_verify_keys_path: PathBuf,

    // Stores
    pub baseline_path: PathBuf,
    pub runbooks_dir: PathBuf,
    pub evidence_root: PathBuf,
    pub queue_db_path: PathBuf,
    pub nonce_db_path: PathBuf,

    // Cadence and policy
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_order_ttl_minimum")]
    pub order_ttl_seconds_minimum: u64,
    #[serde(default = "default_window")]
    pub maintenance_window: MaintenanceWindow,
    #[serde(default = "default_retention_days")]
    pub evidence_retention_days: u32,
    #[serde(default = "default_retention_days_minimum")]
    pub evidence_retention_days_minimum: u32,
    #[serde(default = "default_keep_last_n")]
    pub evidence_keep_last_n: u32,
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: i64,
    #[serde(default = "default_policy_version")]
    pub policy_version: String,

    // Transport tuning
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
    #[serde(default = "default_retry_attempt_cap")]
    pub retry_attempt_cap: u32,

    // Modes
    #[serde(default)]
    pub dry_run_mode: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl AgentConfig {
    /// `/etc/custos/config.yaml` on appliances; the user config dir as a
    /// fallback for operator workstations.
    pub fn default_path() -> PathBuf {
        let system = PathBuf::from("/etc/custos/config.yaml");
        if system.exists() {
            return system;
        }
        dirs::config_dir()
            .map(|dir| dir.join("custos").join("config.yaml"))
            .unwrap_or(system)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AgentConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.site_identity()
            .validate()
            .context("invalid site identity")?;

        if self.coordinator_allowed_hosts.is_empty() {
            bail!("coordinator_allowed_hosts must not be empty");
        }
        let url: reqwest::Url = self
            .coordinator_url
            .parse()
            .with_context(|| format!("invalid coordinator_url {:?}", self.coordinator_url))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            bail!("coordinator_url must be http(s), got {:?}", url.scheme());
        }
        let host = url
            .host_str()
            .context("coordinator_url has no host component")?;
        if !self.host_allowed(host) {
            bail!("coordinator_url host {host:?} is not in coordinator_allowed_hosts");
        }

        let has_bearer = self.bearer_token_path.is_some();
        let has_mtls = self.client_cert_path.is_some() || self.client_key_path.is_some();
        if has_mtls && (self.client_cert_path.is_none() || self.client_key_path.is_none()) {
            bail!("client_cert_path and client_key_path must be configured together");
        }
        if has_bearer == has_mtls {
            bail!("configure exactly one auth mechanism: bearer_token_path or client cert/key");
        }

        if self.order_ttl_seconds_minimum < 60 {
            bail!(
                "order_ttl_seconds_minimum must be >= 60, got {}",
                self.order_ttl_seconds_minimum
            );
        }
        if self.poll_interval_seconds == 0 {
            bail!("poll_interval_seconds must be > 0");
        }
        if self.max_clock_skew_ms <= 0 {
            bail!("max_clock_skew_ms must be positive");
        }
        if self.evidence_keep_last_n == 0 {
            bail!("evidence_keep_last_n must be >= 1");
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warning" | "error") {
            bail!("log_level must be one of debug|info|warning|error");
        }
        Ok(())
    }

    pub fn site_identity(&self) -> SiteIdentity {
        SiteIdentity {
            site_id: self.site_id.clone(),
            host_id: self.host_id.clone(),
            deployment_mode: self.deployment_mode,
            reseller_id: self.reseller_id.clone(),
        }
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        self.coordinator_allowed_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }

    /// tracing filter directive for the configured level.
    pub fn tracing_level(&self) -> &str {
        match self.log_level.as_str() {
            "warning" => "warn",
            other => other,
        }
    }
}

/// Construction helpers shared by unit tests across the crate.
#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// A valid config rooted at `root`, with a bearer token file created
    /// on disk with owner-only permissions.
    pub fn minimal_config(root: &Path) -> AgentConfig {
        let token_path = root.join("token");
        fs::write(&token_path, "test-token\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&token_path, fs::Permissions::from_mode(0o600)).unwrap();
        }
        AgentConfig {
            site_id: "site-001".to_string(),
            host_id: "appliance-a".to_string(),
            deployment_mode: DeploymentMode::Direct,
            reseller_id: None,
            coordinator_url: "https://coordinator.example.com".to_string(),
            coordinator_allowed_hosts: vec!["coordinator.example.com".to_string()],
            bearer_token_path: Some(token_path),
            client_cert_path: None,
            client_key_path: None,
            trusted_ca_path: None,
            signing_key_path: root.join("signing.key"),
            trusted_verify_keys_path: root.join("trusted_keys"),
            baseline_path: root.join("baseline.yaml"),
            runbooks_dir: root.join("runbooks"),
            evidence_root: root.join("evidence"),
            queue_db_path: root.join("queue.db"),
            nonce_db_path: root.join("nonces.db"),
            poll_interval_seconds: 60,
            order_ttl_seconds_minimum: 60,
            maintenance_window: "02:00-04:00".parse().unwrap(),
            evidence_retention_days: 365,
            evidence_retention_days_minimum: 7,
            evidence_keep_last_n: 5,
            max_clock_skew_ms: 90_000,
            policy_version: "baseline-v1".to_string(),
            request_timeout_seconds: 30,
            max_retry_attempts: 4,
            upload_batch_size: 10,
            retry_attempt_cap: 50,
            dry_run_mode: false,
            log_level: "info".to_string(),
        }
    }
}
