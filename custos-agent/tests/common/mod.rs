//! Shared fixture for integration tests: a fully wired agent rooted in a
//! temp directory, with echo-backed probes and an unreachable coordinator.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use custos_agent::config::AgentConfig;
use custos_agent::drift::BaselineConfig;
use custos_shared::canonical;
use custos_shared::identity::DeploymentMode;

pub fn write_owner_only(path: &Path, bytes: &[u8]) {
    fs::write(path, bytes).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
    }
}

/// Deterministic coordinator key used to sign test orders.
pub fn coordinator_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: AgentConfig,
    pub baseline: BaselineConfig,
}

impl Fixture {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_runbook(&self, file_name: &str, yaml: &str) {
        fs::write(self.config.runbooks_dir.join(file_name), yaml).unwrap();
    }
}

/// A baseline the host trivially satisfies: echo-backed probes, fresh
/// status records, nothing declared critical.
pub fn healthy_baseline(root: &Path) -> BaselineConfig {
    let patch_status = root.join("patch-status.json");
    fs::write(
        &patch_status,
        serde_json::json!({ "generated_at": Utc::now(), "pending": [] }).to_string(),
    )
    .unwrap();

    let backup_status = root.join("backup-status.json");
    fs::write(
        &backup_status,
        serde_json::json!({
            "last_success_at": Utc::now(),
            "last_restore_test_at": Utc::now(),
        })
        .to_string(),
    )
    .unwrap();

    BaselineConfig {
        expected_manifest_hash: canonical::content_hash(b"gen-1"),
        expected_firewall_hash: Some(canonical::content_hash(b"ruleset-1")),
        manifest_probe: vec!["echo".to_string(), "gen-1".to_string()],
        firewall_probe: vec!["echo".to_string(), "ruleset-1".to_string()],
        clock_probe: vec![
            "echo".to_string(),
            "System time     : 0.000001000 seconds fast of NTP time".to_string(),
        ],
        patch_status_path: patch_status,
        backup_status_path: backup_status,
        ..BaselineConfig::default()
    }
}

pub fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();

    let signing_key_path = root.join("signing.key");
    write_owner_only(&signing_key_path, &[11u8; 32]);

    let trusted_keys_path = root.join("trusted_keys");
    let pubkey = hex::encode(coordinator_key().verifying_key().as_bytes());
    fs::write(&trusted_keys_path, format!("# coordinator\n{pubkey}\n")).unwrap();

    let token_path = root.join("token");
    write_owner_only(&token_path, b"test-token");

    let runbooks_dir = root.join("runbooks");
    fs::create_dir_all(&runbooks_dir).unwrap();

    let config = AgentConfig {
        site_id: "site-test".to_string(),
        host_id: "appliance-test".to_string(),
        deployment_mode: DeploymentMode::Direct,
        reseller_id: None,
        // nothing listens on port 9; the coordinator is unreachable
        coordinator_url: "http://127.0.0.1:9".to_string(),
        coordinator_allowed_hosts: vec!["127.0.0.1".to_string()],
        bearer_token_path: Some(token_path),
        client_cert_path: None,
        client_key_path: None,
        trusted_ca_path: None,
        signing_key_path,
        trusted_verify_keys_path: trusted_keys_path,
        baseline_path: root.join("baseline.yaml"),
        runbooks_dir,
        evidence_root: root.join("evidence"),
        queue_db_path: root.join("queue.db"),
        nonce_db_path: root.join("nonces.db"),
        poll_interval_seconds: 60,
        order_ttl_seconds_minimum: 60,
        maintenance_window: "00:00-23:59".parse().unwrap(),
        evidence_retention_days: 365,
        evidence_retention_days_minimum: 7,
        evidence_keep_last_n: 5,
        max_clock_skew_ms: 90_000,
        policy_version: "baseline-v1".to_string(),
        request_timeout_seconds: 2,
        max_retry_attempts: 1,
        upload_batch_size: 10,
        retry_attempt_cap: 50,
        dry_run_mode: false,
        log_level: "info".to_string(),
    };
    config.validate().unwrap();

    let baseline = healthy_baseline(&root);
    Fixture {
        dir,
        config,
        baseline,
    }
}
