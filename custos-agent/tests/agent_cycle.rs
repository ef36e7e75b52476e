//! End-to-end cycle behavior against a temp-rooted agent with an
//! unreachable coordinator.

mod common;

use tokio_util::sync::CancellationToken;

use custos_agent::agent::Agent;
use custos_agent::evidence::EvidenceStore;
use custos_shared::canonical::{self, ZERO_HASH};

const DRIFT_RUNBOOK: &str = r#"
id: RB-DRIFT-001
name: Resync configuration manifest
severity: critical
hipaa_controls: ["164.312(c)(1)"]
steps:
  - action: run_command
    params: { program: echo, args: ["resyncing"] }
    timeout_seconds: 30
rollback:
  - action: run_command
    params: { program: echo, args: ["restoring previous generation"] }
    timeout_seconds: 30
"#;

const SERVICE_RUNBOOK: &str = r#"
id: RB-SERVICE-001
name: Restart inactive critical services
severity: high
hipaa_controls: ["164.312(b)"]
steps:
  - action: run_command
    params: { program: echo, args: ["restarting"] }
    timeout_seconds: 30
"#;

#[tokio::test]
async fn test_quiet_cycle_produces_zero_evidence() {
    let fx = common::fixture();
    let agent = Agent::bootstrap(fx.config.clone(), fx.baseline.clone()).unwrap();
    let stats = agent.run_cycle(1, &CancellationToken::new()).await;

    assert!(!stats.coordinator_reachable);
    assert_eq!(stats.checks_drifted, 0);
    assert_eq!(stats.bundles_persisted, 0);
    assert_eq!(agent.queue().pending_count().unwrap(), 0);
    assert!(agent.store().chain_head().is_none());
}

#[tokio::test]
async fn test_manifest_drift_heals_and_emits_chained_evidence() {
    let fx = common::fixture();
    fx.write_runbook("rb-drift.yaml", DRIFT_RUNBOOK);
    let mut baseline = fx.baseline.clone();
    // the declared generation differs from what the probe reports
    baseline.expected_manifest_hash = canonical::content_hash(b"gen-2");

    let agent = Agent::bootstrap(fx.config.clone(), baseline).unwrap();
    let stats = agent.run_cycle(1, &CancellationToken::new()).await;

    assert_eq!(stats.checks_drifted, 1);
    assert_eq!(stats.heals_attempted, 1);
    assert_eq!(stats.bundles_persisted, 1);
    // coordinator is down, so the bundle stays queued
    assert_eq!(agent.queue().pending_count().unwrap(), 1);

    let row = &agent.queue().next_pending(1).unwrap()[0];
    assert_eq!(row.check_name, "manifest");
    assert_eq!(row.outcome, "success");

    // the bundle on disk verifies and chains to genesis
    let bundle = EvidenceStore::load(std::path::Path::new(&row.bundle_path)).unwrap();
    assert_eq!(bundle.previous_bundle_hash.as_deref(), Some(ZERO_HASH));
    assert_eq!(bundle.runbook_id.as_deref(), Some("RB-DRIFT-001"));
    assert!(bundle.rollback_available);
    let report = agent.store().verify_chain().unwrap();
    assert!(report.intact);
    assert_eq!(report.chain_length, 1);
}

#[tokio::test]
async fn test_unresolved_remediation_downgrades_to_alert() {
    let fx = common::fixture();
    // no runbooks on disk at all
    let mut baseline = fx.baseline.clone();
    baseline.expected_manifest_hash = canonical::content_hash(b"gen-2");

    let agent = Agent::bootstrap(fx.config.clone(), baseline).unwrap();
    let stats = agent.run_cycle(1, &CancellationToken::new()).await;

    assert_eq!(stats.heals_attempted, 0);
    assert_eq!(stats.bundles_persisted, 1);
    let row = &agent.queue().next_pending(1).unwrap()[0];
    assert_eq!(row.outcome, "alert");
}

#[tokio::test]
async fn test_clock_drift_alerts_and_defers_other_healing() {
    let fx = common::fixture();
    fx.write_runbook("rb-service.yaml", SERVICE_RUNBOOK);
    let mut baseline = fx.baseline.clone();
    // 120 s of skew against a 90 s budget
    baseline.clock_probe = vec![
        "echo".to_string(),
        "System time     : 120.000000 seconds fast of NTP time".to_string(),
    ];
    baseline.max_clock_skew_ms = 90_000;
    // a service that cannot be active forces a second drift
    baseline.critical_services = vec!["custos-test-no-such-service".to_string()];

    let agent = Agent::bootstrap(fx.config.clone(), baseline).unwrap();
    let stats = agent.run_cycle(1, &CancellationToken::new()).await;

    assert_eq!(stats.checks_drifted, 2);
    assert_eq!(stats.bundles_persisted, 2);

    let rows = agent.queue().next_pending(10).unwrap();
    let clock_row = rows.iter().find(|r| r.check_name == "clock").unwrap();
    assert_eq!(clock_row.outcome, "alert");
    let service_row = rows.iter().find(|r| r.check_name == "services").unwrap();
    assert_eq!(service_row.outcome, "deferred");

    let clock_bundle =
        EvidenceStore::load(std::path::Path::new(&clock_row.bundle_path)).unwrap();
    assert_eq!(clock_bundle.ntp_offset_ms, Some(120_000));

    let service_bundle =
        EvidenceStore::load(std::path::Path::new(&service_row.bundle_path)).unwrap();
    assert!(service_bundle
        .error
        .as_deref()
        .unwrap()
        .contains("clock skew"));
    assert!(service_bundle.action_taken.is_empty());
}

#[tokio::test]
async fn test_dry_run_cycle_heals_without_side_effects() {
    let mut fx = common::fixture();
    fx.config.dry_run_mode = true;
    fx.write_runbook("rb-drift.yaml", DRIFT_RUNBOOK);
    let mut baseline = fx.baseline.clone();
    baseline.expected_manifest_hash = canonical::content_hash(b"gen-2");

    let agent = Agent::bootstrap(fx.config.clone(), baseline).unwrap();
    let stats = agent.run_cycle(1, &CancellationToken::new()).await;

    assert_eq!(stats.heals_attempted, 1);
    let row = &agent.queue().next_pending(1).unwrap()[0];
    assert_eq!(row.outcome, "success");
    let bundle = EvidenceStore::load(std::path::Path::new(&row.bundle_path)).unwrap();
    assert_eq!(bundle.action_taken[0].stdout, "[DRY-RUN]");
}

#[tokio::test]
async fn test_consecutive_cycles_extend_one_chain() {
    let fx = common::fixture();
    fx.write_runbook("rb-drift.yaml", DRIFT_RUNBOOK);
    let mut baseline = fx.baseline.clone();
    baseline.expected_manifest_hash = canonical::content_hash(b"gen-2");

    let agent = Agent::bootstrap(fx.config.clone(), baseline).unwrap();
    let cancel = CancellationToken::new();
    agent.run_cycle(1, &cancel).await;
    agent.run_cycle(2, &cancel).await;
    agent.run_cycle(3, &cancel).await;

    // coordinator down for every cycle: all three bundles queued
    assert_eq!(agent.queue().pending_count().unwrap(), 3);
    let report = agent.store().verify_chain().unwrap();
    assert!(report.intact);
    assert_eq!(report.chain_length, 3);
}
