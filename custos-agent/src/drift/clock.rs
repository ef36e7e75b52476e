//! Clock-skew check against the time-sync daemon.
//!
//! While this check asserts drift, the agent must not perform any
//! disruptive remediation; the healer reads the offset through the cycle
//! context and defers.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use super::baseline::{run_probe, BaselineConfig};
use super::{CheckName, DriftCheck, DriftResult, Severity};

const CONTROLS: &[&str] = &["164.312(b)"];

/// Key under which the measured offset is recorded in drift details and
/// surfaced as `ntp_offset_ms` on evidence bundles.
pub const CLOCK_OFFSET_KEY: &str = "offset_ms";

/// Parse the `System time` line of `chronyc tracking` output, e.g.
/// `System time     : 0.000019 seconds fast of NTP time`.
fn parse_offset_ms(output: &str) -> Result<i64> {
    for line in output.lines() {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        if !label.trim().eq_ignore_ascii_case("system time") {
            continue;
        }
        let mut parts = rest.trim().split_whitespace();
        let seconds: f64 = parts
            .next()
            .ok_or_else(|| anyhow!("empty system time line"))?
            .parse()?;
        let unit = parts.next().unwrap_or_default();
        if unit != "seconds" {
            return Err(anyhow!("unexpected unit {unit:?} in tracking output"));
        }
        let direction = parts.next().unwrap_or_default();
        let signed = match direction {
            "fast" => seconds,
            "slow" => -seconds,
            other => return Err(anyhow!("unexpected direction {other:?}")),
        };
        return Ok((signed * 1000.0).round() as i64);
    }
    Err(anyhow!("no system time line in tracking output"))
}

pub struct ClockCheck;

#[async_trait]
impl DriftCheck for ClockCheck {
    fn name(&self) -> CheckName {
        CheckName::Clock
    }

    async fn run(&self, baseline: &BaselineConfig) -> anyhow::Result<DriftResult> {
        let output = run_probe(&baseline.clock_probe, baseline.probe_timeout()).await?;
        let offset_ms = parse_offset_ms(&output)?;

        let details = json!({
            CLOCK_OFFSET_KEY: offset_ms,
            "max_clock_skew_ms": baseline.max_clock_skew_ms,
        });

        // exactly at the maximum is not drift; one ms above is
        if offset_ms.abs() > baseline.max_clock_skew_ms {
            Ok(DriftResult::drifted(
                CheckName::Clock,
                Severity::Medium,
                details,
                None,
                CONTROLS,
            ))
        } else {
            let mut result = DriftResult::clean(CheckName::Clock, Severity::Medium, CONTROLS);
            result.details = details;
            Ok(result)
        }
    }
}
