//! Evidence construction: folding drift, healing, and order outcomes into
//! signed bundles.

pub mod prune;
pub mod store;

use chrono::{Duration, Utc};
use serde_json::json;

use custos_shared::evidence::{EvidenceBundle, Outcome, COORDINATOR_CHECK};
use custos_shared::identity::SiteIdentity;
use custos_shared::order::Order;

use crate::drift::{CheckName, DriftResult, CLOCK_OFFSET_KEY};
use crate::healer::{HealingResult, HealingStatus, Runbook};
use crate::signing::OrderRejection;

pub use store::{EvidenceStore, PersistedBundle};

fn outcome_for(status: HealingStatus) -> Outcome {
    match status {
        HealingStatus::Success => Outcome::Success,
        HealingStatus::RolledBack => Outcome::Reverted,
        HealingStatus::Deferred => Outcome::Deferred,
        HealingStatus::Failed | HealingStatus::Partial => Outcome::Failed,
    }
}

fn clock_offset(drift: &DriftResult) -> Option<i64> {
    if drift.check_name != CheckName::Clock {
        return None;
    }
    drift.details.get(CLOCK_OFFSET_KEY).and_then(|v| v.as_i64())
}

/// Builds bundles carrying this appliance's identity and policy version.
pub struct EvidenceBuilder {
    identity: SiteIdentity,
    policy_version: String,
}

impl EvidenceBuilder {
    pub fn new(identity: SiteIdentity, policy_version: &str) -> Self {
        EvidenceBuilder {
            identity,
            policy_version: policy_version.to_string(),
        }
    }

    /// Bundle for a healing attempt, whether triggered by drift or by an
    /// accepted order.
    pub fn from_healing(
        &self,
        drift: Option<&DriftResult>,
        runbook: &Runbook,
        healing: &HealingResult,
        order_id: Option<&str>,
    ) -> EvidenceBundle {
        let check = match (drift, order_id) {
            (Some(d), _) => d.check_name.as_str().to_string(),
            (None, Some(id)) => format!("order:{id}"),
            (None, None) => COORDINATOR_CHECK.to_string(),
        };

        let healing_start =
            healing.timestamp - Duration::milliseconds((healing.duration_seconds * 1000.0) as i64);
        let start = match drift {
            Some(d) => d.timestamp.min(healing_start),
            None => healing_start,
        };

        let mut bundle = EvidenceBundle::new(&self.identity, &self.policy_version, &check, start);
        bundle.timestamp_end = healing.timestamp.max(start);
        bundle.outcome = outcome_for(healing.status);
        bundle.runbook_id = Some(healing.runbook_id.clone());
        bundle.order_id = order_id.map(|s| s.to_string());
        bundle.rollback_available = runbook.has_rollback();
        bundle.action_taken = healing.steps.clone();
        bundle.error = healing.error_message.clone();

        let mut controls: Vec<String> = runbook.hipaa_controls.clone();
        if let Some(d) = drift {
            for control in &d.hipaa_controls {
                if !controls.contains(control) {
                    controls.push(control.clone());
                }
            }
            bundle.ntp_offset_ms = clock_offset(d);
        }
        bundle.hipaa_controls = controls;

        bundle.pre_state = json!({
            "drift": drift.map(|d| d.details.clone()),
            "health": healing.pre_snapshot.as_ref().map(|s| s.to_state()),
        });
        bundle.post_state = json!({
            "health": healing.post_snapshot.as_ref().map(|s| s.to_state()),
            "health_check_passed": healing.health_check_passed,
        });
        bundle
    }

    /// Alert bundle for drift that must not (or cannot) be remediated:
    /// clock skew, encryption state, or an unresolved remediation
    /// reference.
    pub fn from_drift_alert(&self, drift: &DriftResult, reason: Option<&str>) -> EvidenceBundle {
        let mut bundle = EvidenceBundle::new(
            &self.identity,
            &self.policy_version,
            drift.check_name.as_str(),
            drift.timestamp,
        );
        bundle.timestamp_end = Utc::now().max(drift.timestamp);
        bundle.outcome = Outcome::Alert;
        bundle.hipaa_controls = drift.hipaa_controls.clone();
        bundle.pre_state = json!({ "drift": drift.details });
        bundle.post_state = json!({ "remediated": false });
        bundle.error = reason.map(|s| s.to_string());
        bundle.ntp_offset_ms = clock_offset(drift);
        bundle
    }

    /// Bundle for an order that was refused by the verifier. The order is
    /// never executed; the rejection is the whole story.
    pub fn from_rejected_order(
        &self,
        order: &Order,
        rejection: &OrderRejection,
    ) -> EvidenceBundle {
        let check = format!("order:{}", order.order_id);
        let now = Utc::now();
        let mut bundle = EvidenceBundle::new(&self.identity, &self.policy_version, &check, now);
        bundle.outcome = rejection.outcome();
        bundle.order_id = Some(order.order_id.clone());
        bundle.runbook_id = Some(order.runbook_id.clone());
        bundle.error = Some(rejection.to_string());
        // order metadata only; the signature itself never enters evidence
        bundle.pre_state = json!({
            "order_id": order.order_id,
            "runbook_id": order.runbook_id,
            "issued_at": order.issued_at,
            "ttl_seconds": order.ttl_seconds,
        });
        bundle.post_state = json!({ "executed": false });
        bundle
    }

    /// Alert bundle for a coordinator authentication failure; operator
    /// attention required.
    pub fn from_auth_failure(&self, error: &str) -> EvidenceBundle {
        let now = Utc::now();
        let mut bundle =
            EvidenceBundle::new(&self.identity, &self.policy_version, COORDINATOR_CHECK, now);
        bundle.outcome = Outcome::Alert;
        bundle.error = Some(error.to_string());
        bundle.hipaa_controls = vec!["164.312(d)".to_string()];
        bundle.pre_state = json!({ "coordinator_reachable": true, "authenticated": false });
        bundle.post_state = json!({ "orders_processed": 0 });
        bundle
    }
}
