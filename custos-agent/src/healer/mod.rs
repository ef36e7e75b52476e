//! Runbook execution engine: gates, snapshots, step loop, fix
//! verification, and reverse-order rollback.

pub mod action;
pub mod runbook;
pub mod snapshot;
pub mod verify;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use custos_shared::evidence::{StepResult, StepStatus};

use crate::config::MaintenanceWindow;
use crate::drift::BaselineConfig;

pub use runbook::{Runbook, RunbookSet};
pub use snapshot::HealthSnapshot;

/// Extra room beyond the sum of step timeouts before the whole run is
/// declared overdue.
const ENVELOPE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStatus {
    Success,
    Failed,
    RolledBack,
    Partial,
    Deferred,
}

/// Outcome of one healing attempt; folded into an evidence bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingResult {
    pub runbook_id: String,
    pub status: HealingStatus,
    pub steps: Vec<StepResult>,
    pub rollback_performed: bool,
    pub health_check_passed: bool,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub pre_snapshot: Option<HealthSnapshot>,
    pub post_snapshot: Option<HealthSnapshot>,
}

impl HealingResult {
    fn deferred(runbook_id: &str, reason: &str) -> Self {
        HealingResult {
            runbook_id: runbook_id.to_string(),
            status: HealingStatus::Deferred,
            steps: Vec::new(),
            rollback_performed: false,
            health_check_passed: false,
            duration_seconds: 0.0,
            error_message: Some(reason.to_string()),
            timestamp: Utc::now(),
            pre_snapshot: None,
            post_snapshot: None,
        }
    }
}

/// Per-cycle context the healer consults before touching the host.
#[derive(Clone)]
pub struct HealContext {
    pub now: DateTime<Utc>,
    /// The clock-skew check asserted drift this cycle; remediation is
    /// suspended while the host's sense of time is unreliable.
    pub clock_drifted: bool,
    pub cancel: CancellationToken,
}

impl HealContext {
    pub fn new(now: DateTime<Utc>, clock_drifted: bool) -> Self {
        HealContext {
            now,
            clock_drifted,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct Healer {
    baseline: Arc<BaselineConfig>,
    window: MaintenanceWindow,
    dry_run: bool,
}

impl Healer {
    pub fn new(baseline: Arc<BaselineConfig>, window: MaintenanceWindow, dry_run: bool) -> Self {
        Healer {
            baseline,
            window,
            dry_run,
        }
    }

    /// Execute one runbook. Runbooks never run concurrently; the caller
    /// serializes invocations within a cycle.
    pub async fn execute(&self, runbook: &Runbook, ctx: &HealContext) -> HealingResult {
        // Gate 1: disruptive runbooks only inside the maintenance window.
        if runbook.disruptive && !self.window.contains(ctx.now) {
            info!(runbook = %runbook.id, window = %self.window, "deferred: outside maintenance window");
            return HealingResult::deferred(
                &runbook.id,
                &format!("outside maintenance window {}", self.window),
            );
        }

        // Gate 2: no remediation while the host clock is not trustworthy.
        if ctx.clock_drifted {
            info!(runbook = %runbook.id, "deferred: clock skew exceeds baseline");
            return HealingResult::deferred(
                &runbook.id,
                "clock skew exceeds baseline; remediation suspended",
            );
        }

        let started = Instant::now();
        let probe_timeout = self.baseline.probe_timeout();
        let pre = snapshot::capture(&self.baseline.critical_services, probe_timeout, self.dry_run)
            .await;

        let deadline = started + runbook.step_timeout_budget() + ENVELOPE_GRACE;
        let mut steps: Vec<StepResult> = Vec::new();
        let mut failure: Option<String> = None;

        for (index, step) in runbook.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                steps.push(action::skipped_step(index, step, "cancelled at step boundary"));
                failure = Some("healing cancelled before completion".to_string());
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Past the whole-runbook envelope: the current step is
                // recorded as timed out and the run fails.
                let mut timed_out = action::skipped_step(index, step, "runbook envelope exceeded");
                timed_out.status = StepStatus::TimedOut;
                steps.push(timed_out);
                failure = Some("runbook exceeded its timeout envelope".to_string());
                break;
            }

            let result = action::execute_step(index, step, remaining, self.dry_run).await;
            let status = result.status;
            steps.push(result);
            match status {
                StepStatus::Success => continue,
                StepStatus::TimedOut => {
                    failure = Some(format!("step {index} timed out"));
                    break;
                }
                _ => {
                    failure = Some(format!("step {index} failed"));
                    break;
                }
            }
        }

        let post = snapshot::capture(&self.baseline.critical_services, probe_timeout, self.dry_run)
            .await;

        // Fix verification only applies when every step ran clean.
        let mut health_check_passed = false;
        if failure.is_none() {
            health_check_passed =
                verify::verify_fix(runbook.verify, &self.baseline, &pre, &post, self.dry_run).await;
            if !health_check_passed {
                failure = Some("post-heal verification failed".to_string());
            }
        }

        let (status, rollback_performed) = match &failure {
            None => (HealingStatus::Success, false),
            Some(reason) => {
                warn!(runbook = %runbook.id, %reason, "healing failed, evaluating rollback");
                self.rollback(runbook, &mut steps).await
            }
        };

        HealingResult {
            runbook_id: runbook.id.clone(),
            status,
            steps,
            rollback_performed,
            health_check_passed,
            duration_seconds: started.elapsed().as_secs_f64(),
            error_message: failure,
            timestamp: Utc::now(),
            pre_snapshot: Some(pre),
            post_snapshot: Some(post),
        }
    }

    /// Execute rollback steps in reverse order of the `rollback` list,
    /// appending their results to the step record. Terminal status is
    /// `rolled_back` only when every rollback step succeeded.
    async fn rollback(
        &self,
        runbook: &Runbook,
        steps: &mut Vec<StepResult>,
    ) -> (HealingStatus, bool) {
        if !runbook.has_rollback() {
            let any_succeeded = steps.iter().any(|s| s.status == StepStatus::Success);
            let status = if any_succeeded {
                HealingStatus::Partial
            } else {
                HealingStatus::Failed
            };
            return (status, false);
        }

        let mut all_ok = true;
        let base_index = steps.len();
        for (offset, step) in runbook.rollback.iter().rev().enumerate() {
            let result = action::execute_step(
                base_index + offset,
                step,
                step.timeout(),
                self.dry_run,
            )
            .await;
            let ok = result.status == StepStatus::Success;
            steps.push(result);
            if !ok {
                all_ok = false;
                break;
            }
        }

        if all_ok {
            (HealingStatus::RolledBack, true)
        } else {
            warn!(runbook = %runbook.id, "rollback itself failed");
            (HealingStatus::Failed, true)
        }
    }
}
