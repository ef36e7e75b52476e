//! One reconciliation cycle: fetch orders, verify, detect drift, heal,
//! execute orders, emit evidence, flush the queue.
//!
//! The detector, healer, and evidence builder never call each other; this
//! module orchestrates them. A fatal error inside any single step is
//! logged and the next cycle still runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use custos_shared::evidence::EvidenceBundle;
use custos_shared::order::Order;

use crate::config::AgentConfig;
use crate::coordinator::{CoordinatorClient, CoordinatorError};
use crate::drift::{BaselineConfig, CheckName, DriftDetector, DriftResult};
use crate::evidence::{EvidenceBuilder, EvidenceStore, PersistedBundle};
use crate::healer::{HealContext, Healer, RunbookSet};
use crate::queue::OfflineQueue;
use crate::signing::{EvidenceSigner, NonceStore, OrderRejection, OrderVerifier};

/// How many pending orders one cycle will take on.
const ORDER_FETCH_LIMIT: usize = 16;

#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub cycle: u64,
    pub coordinator_reachable: bool,
    pub orders_fetched: usize,
    pub orders_rejected: usize,
    pub orders_executed: usize,
    pub checks_drifted: usize,
    pub heals_attempted: usize,
    pub bundles_persisted: usize,
    pub bundles_uploaded: usize,
    pub duration_seconds: f64,
}

pub struct Agent {
    pub config: AgentConfig,
    coordinator: CoordinatorClient,
    signer: EvidenceSigner,
    verifier: OrderVerifier,
    detector: DriftDetector,
    healer: Healer,
    runbooks: RunbookSet,
    builder: EvidenceBuilder,
    store: EvidenceStore,
    queue: OfflineQueue,
}

impl Agent {
    /// Wire every subsystem together from validated config and a loaded
    /// baseline. Failures here are configuration-class and fatal.
    pub fn bootstrap(config: AgentConfig, baseline: BaselineConfig) -> Result<Self> {
        let signer = EvidenceSigner::load(&config.signing_key_path)
            .context("failed to load evidence signing key")?;
        let nonces =
            NonceStore::open(&config.nonce_db_path).context("failed to open nonce store")?;
        let verifier = OrderVerifier::load(
            &config.trusted_verify_keys_path,
            nonces,
            config.order_ttl_seconds_minimum,
        )
        .context("failed to load trusted verify keys")?;
        let coordinator =
            CoordinatorClient::new(&config).context("failed to build coordinator client")?;
        let queue = OfflineQueue::open(&config.queue_db_path, config.retry_attempt_cap)
            .context("failed to open offline queue")?;
        let store =
            EvidenceStore::open(&config.evidence_root).context("failed to open evidence store")?;

        let (runbooks, refused) = RunbookSet::load_dir(&config.runbooks_dir);
        for (path, err) in &refused {
            warn!(path = %path.display(), %err, "runbook refused at load");
        }
        info!(loaded = runbooks.len(), refused = refused.len(), "runbooks loaded");

        let baseline = Arc::new(baseline);
        let detector = DriftDetector::new(Arc::clone(&baseline));
        let healer = Healer::new(
            Arc::clone(&baseline),
            config.maintenance_window,
            config.dry_run_mode,
        );
        let builder = EvidenceBuilder::new(config.site_identity(), &config.policy_version);

        Ok(Agent {
            config,
            coordinator,
            signer,
            verifier,
            detector,
            healer,
            runbooks,
            builder,
            store,
            queue,
        })
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    /// Persist a bundle locally and enqueue it for upload. Evidence is
    /// never held only in memory: an error here aborts the caller's
    /// current step before the bundle would be claimed as emitted.
    fn emit(&self, bundle: EvidenceBundle) -> Result<PersistedBundle> {
        let persisted = self.store.persist(&self.signer, bundle)?;
        self.queue.enqueue(
            &persisted.bundle.bundle_id,
            &persisted.bundle_path,
            &persisted.signature_path,
            &persisted.bundle.check,
            persisted.bundle.outcome.as_str(),
            persisted.bundle.timestamp_end,
        )?;
        Ok(persisted)
    }

    /// One pass of the control loop.
    pub async fn run_cycle(&self, cycle: u64, cancel: &CancellationToken) -> CycleStats {
        let started = std::time::Instant::now();
        let mut stats = CycleStats {
            cycle,
            ..CycleStats::default()
        };

        // 1. Fetch orders. Unreachable coordinator is routine: we keep
        // working locally and drain the queue another cycle.
        let mut orders: Vec<Order> = Vec::new();
        match self.coordinator.fetch_pending_orders(ORDER_FETCH_LIMIT).await {
            Ok(fetched) => {
                stats.coordinator_reachable = true;
                stats.orders_fetched = fetched.len();
                orders = fetched;
            }
            Err(err) if err.is_auth() => {
                error!(%err, "coordinator rejected our credentials");
                let bundle = self.builder.from_auth_failure(&err.to_string());
                self.emit_counted(bundle, &mut stats);
            }
            Err(CoordinatorError::Transport(reason)) => {
                warn!(%reason, "coordinator unreachable, working from queue");
            }
            Err(err) => {
                warn!(%err, "order fetch failed");
            }
        }

        // 2. Verify each order; rejections produce evidence immediately
        // and never reach the healer.
        let now = Utc::now();
        let mut accepted: Vec<Order> = Vec::new();
        for order in orders {
            match self.verifier.verify(&order, now) {
                Ok(()) => accepted.push(order),
                Err(rejection) => {
                    warn!(order_id = %order.order_id, %rejection, "order refused");
                    stats.orders_rejected += 1;
                    let bundle = self.builder.from_rejected_order(&order, &rejection);
                    self.emit_counted(bundle, &mut stats);
                }
            }
        }

        // 3. Detect drift across all six checks concurrently.
        let drift = self.detector.check_all().await;
        stats.checks_drifted = drift.values().filter(|d| d.drift_detected).count();
        let clock_drifted = drift
            .get(&CheckName::Clock)
            .map(|d| d.drift_detected)
            .unwrap_or(false);

        let ctx = HealContext {
            now: Utc::now(),
            clock_drifted,
            cancel: cancel.clone(),
        };

        // 4. Heal drifted checks, strictly serially. Autonomous
        // remediation runs before operator orders so that orders see the
        // reconciled host.
        for name in CheckName::ALL {
            if cancel.is_cancelled() {
                break;
            }
            let Some(result) = drift.get(&name) else {
                continue;
            };
            if !result.drift_detected {
                continue;
            }
            self.heal_drift(result, &ctx, &mut stats).await;
        }

        // 5. Execute accepted orders, also serially.
        for order in &accepted {
            if cancel.is_cancelled() {
                break;
            }
            self.execute_order(order, &ctx, &mut stats).await;
        }

        // 6. Opportunistic queue flush.
        if stats.coordinator_reachable {
            let (uploaded, failed) = self.flush_queue(self.config.upload_batch_size).await;
            stats.bundles_uploaded = uploaded;
            if failed > 0 {
                warn!(failed, "some evidence uploads failed; bundles remain queued");
            }
        }

        stats.duration_seconds = started.elapsed().as_secs_f64();
        stats
    }

    fn emit_counted(&self, bundle: EvidenceBundle, stats: &mut CycleStats) {
        match self.emit(bundle) {
            Ok(_) => stats.bundles_persisted += 1,
            Err(err) => {
                // Persistence failure is fatal-class for this cycle; the
                // event is lost from evidence but the process keeps going.
                error!(%err, "failed to persist evidence bundle");
            }
        }
    }

    /// Remediate one drifted check. Checks with no resolvable runbook
    /// (clock, encryption, broken references) emit an alert instead.
    async fn heal_drift(&self, drift: &DriftResult, ctx: &HealContext, stats: &mut CycleStats) {
        let Some(runbook_id) = drift.remediation_runbook_id.as_deref() else {
            let bundle = self.builder.from_drift_alert(
                drift,
                Some("drift requires human intervention; no automated remediation"),
            );
            self.emit_counted(bundle, stats);
            return;
        };

        let Some(runbook) = self.runbooks.get(runbook_id) else {
            warn!(check = drift.check_name.as_str(), runbook_id, "remediation runbook not loaded");
            let bundle = self.builder.from_drift_alert(
                drift,
                Some(&format!("remediation runbook {runbook_id:?} is not loaded")),
            );
            self.emit_counted(bundle, stats);
            return;
        };

        stats.heals_attempted += 1;
        info!(check = drift.check_name.as_str(), runbook_id, "healing drift");
        let healing = self.healer.execute(runbook, ctx).await;
        let bundle = self
            .builder
            .from_healing(Some(drift), runbook, &healing, None);
        self.emit_counted(bundle, stats);
    }

    /// Execute one accepted order through the healer.
    async fn execute_order(&self, order: &Order, ctx: &HealContext, stats: &mut CycleStats) {
        let Some(runbook) = self.runbooks.get(&order.runbook_id) else {
            warn!(order_id = %order.order_id, runbook_id = %order.runbook_id, "ordered runbook not loaded");
            stats.orders_rejected += 1;
            let rejection = OrderRejection::UnknownRunbook {
                runbook_id: order.runbook_id.clone(),
            };
            let bundle = self.builder.from_rejected_order(order, &rejection);
            self.emit_counted(bundle, stats);
            return;
        };

        stats.orders_executed += 1;
        info!(order_id = %order.order_id, runbook_id = %order.runbook_id, "executing order");
        let healing = self.healer.execute(runbook, ctx).await;
        let bundle =
            self.builder
                .from_healing(None, runbook, &healing, Some(&order.order_id));
        self.emit_counted(bundle, stats);
    }

    /// Drain the oldest pending bundles, one upload per bundle. Dedup is
    /// the queue's job: a row marked uploaded is never offered again.
    pub async fn flush_queue(&self, limit: usize) -> (usize, usize) {
        let pending = match self.queue.next_pending(limit) {
            Ok(pending) => pending,
            Err(err) => {
                error!(%err, "failed to read pending queue");
                return (0, 0);
            }
        };

        let mut uploaded = 0;
        let mut failed = 0;
        for row in pending {
            let result = self
                .coordinator
                .upload_bundle(
                    std::path::Path::new(&row.bundle_path),
                    std::path::Path::new(&row.signature_path),
                )
                .await;
            match result {
                Ok(()) => {
                    if let Err(err) = self.queue.mark_uploaded(&row.bundle_id, Utc::now()) {
                        error!(bundle_id = %row.bundle_id, %err, "failed to mark bundle uploaded");
                    } else {
                        uploaded += 1;
                    }
                }
                Err(err) => {
                    failed += 1;
                    if let Err(db_err) = self.queue.mark_failure(&row.bundle_id, &err.to_string()) {
                        error!(bundle_id = %row.bundle_id, %db_err, "failed to record upload failure");
                    }
                    // a dead coordinator will fail every row; stop early
                    if matches!(err, CoordinatorError::Transport(_)) {
                        break;
                    }
                }
            }
        }
        (uploaded, failed)
    }
}
