//! Execution of a single runbook step.
//!
//! Each action maps to a fixed argv; parameters slot into the argv as
//! discrete arguments and never pass through a shell.

use std::time::Duration;

use tracing::{debug, info};

use custos_shared::evidence::{StepResult, StepStatus};

use crate::util::command;

use super::runbook::{Step, StepParams};

fn argv_for(step: &Step) -> (String, Vec<String>) {
    match &step.params {
        StepParams::RunCommand(p) => (p.program.clone(), p.args.clone()),
        StepParams::RestartService(p) => (
            "systemctl".to_string(),
            vec!["restart".to_string(), p.service.clone()],
        ),
        StepParams::TriggerBackup(p) => (
            "systemctl".to_string(),
            vec!["start".to_string(), p.unit.clone()],
        ),
        StepParams::SyncManifest(p) => {
            let mut args = vec!["switch".to_string()];
            if let Some(flake_ref) = &p.flake_ref {
                args.push("--flake".to_string());
                args.push(flake_ref.clone());
            }
            ("nixos-rebuild".to_string(), args)
        }
    }
}

/// Run one step with its declared timeout, hard-killing on expiry.
/// `max_timeout` further bounds the step when the whole-runbook envelope
/// has less left than the step declares.
pub async fn execute_step(
    index: usize,
    step: &Step,
    max_timeout: Duration,
    dry_run: bool,
) -> StepResult {
    let action = step.action.as_str().to_string();

    if dry_run {
        info!(index, action = %action, "dry-run: step skipped");
        return StepResult {
            index,
            action,
            status: StepStatus::Success,
            exit_code: Some(0),
            stdout: "[DRY-RUN]".to_string(),
            stderr: String::new(),
            duration_ms: 0,
        };
    }

    let (program, args) = argv_for(step);
    let timeout = step.timeout().min(max_timeout);
    debug!(index, %program, ?args, ?timeout, "executing step");

    match command::run(&program, &args, timeout, command::DEFAULT_TAIL_BYTES).await {
        Ok(out) => {
            let status = if out.timed_out {
                StepStatus::TimedOut
            } else if out.success() {
                StepStatus::Success
            } else {
                StepStatus::Failed
            };
            StepResult {
                index,
                action,
                status,
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
                duration_ms: out.duration.as_millis() as u64,
            }
        }
        Err(err) => StepResult {
            index,
            action,
            status: StepStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: err.to_string(),
            duration_ms: 0,
        },
    }
}

/// A step that never ran because the envelope or a cancellation cut it off.
pub fn skipped_step(index: usize, step: &Step, reason: &str) -> StepResult {
    StepResult {
        index,
        action: step.action.as_str().to_string(),
        status: StepStatus::Skipped,
        exit_code: None,
        stdout: String::new(),
        stderr: reason.to_string(),
        duration_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healer::runbook::{
        Action, RestartServiceParams, RunCommandParams, Step, SyncManifestParams,
        TriggerBackupParams,
    };

    fn run_command_step(program: &str, args: &[&str], timeout_seconds: u64) -> Step {
        Step {
            action: Action::RunCommand,
            params: StepParams::RunCommand(RunCommandParams {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            }),
            timeout_seconds,
        }
    }

    #[test]
    fn test_argv_never_goes_through_a_shell() {
        let step = Step {
            action: Action::RestartService,
            params: StepParams::RestartService(RestartServiceParams {
                service: "chronyd; rm -rf /".to_string(),
            }),
            timeout_seconds: 10,
        };
        let (program, args) = argv_for(&step);
        assert_eq!(program, "systemctl");
        // the hostile string stays one argument
        assert_eq!(args, vec!["restart", "chronyd; rm -rf /"]);
    }

    #[test]
    fn test_argv_for_backup_and_sync() {
        let backup = Step {
            action: Action::TriggerBackup,
            params: StepParams::TriggerBackup(TriggerBackupParams {
                unit: "restic-backup.service".to_string(),
            }),
            timeout_seconds: 10,
        };
        assert_eq!(
            argv_for(&backup),
            (
                "systemctl".to_string(),
                vec!["start".to_string(), "restic-backup.service".to_string()]
            )
        );

        let sync = Step {
            action: Action::SyncManifest,
            params: StepParams::SyncManifest(SyncManifestParams {
                flake_ref: Some("github:acme/fleet#appliance".to_string()),
            }),
            timeout_seconds: 10,
        };
        let (program, args) = argv_for(&sync);
        assert_eq!(program, "nixos-rebuild");
        assert_eq!(args[0], "switch");
        assert_eq!(args[1], "--flake");
    }

    #[tokio::test]
    async fn test_successful_step() {
        let step = run_command_step("echo", &["ok"], 5);
        let result = execute_step(0, &step, Duration::from_secs(60), false).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_failed_step() {
        let step = run_command_step("false", &[], 5);
        let result = execute_step(2, &step, Duration::from_secs(60), false).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.index, 2);
    }

    #[tokio::test]
    async fn test_timed_out_step_is_hard_killed() {
        let step = run_command_step("sleep", &["30"], 1);
        // envelope tighter than the declared timeout wins
        let result = execute_step(0, &step, Duration::from_millis(100), false).await;
        assert_eq!(result.status, StepStatus::TimedOut);
        assert!(result.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_failed_step() {
        let step = run_command_step("/nonexistent/custos-step", &[], 5);
        let result = execute_step(0, &step, Duration::from_secs(5), false).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_has_zero_side_effects() {
        // a step that would fail loudly if executed
        let step = run_command_step("false", &[], 5);
        let result = execute_step(0, &step, Duration::from_secs(5), true).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.stdout, "[DRY-RUN]");
        assert_eq!(result.duration_ms, 0);
    }
}
