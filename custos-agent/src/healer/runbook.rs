//! Declarative runbooks and their load-time validation.
//!
//! A runbook that fails validation is refused outright; nothing invalid
//! can reach the execution engine. Step parameters are typed records per
//! action, and unknown keys are refused at load time, not at execution
//! time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::drift::Severity;

use super::verify::FixCheck;

#[derive(Debug, Error)]
pub enum RunbookError {
    #[error("failed to read runbook: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse runbook: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("runbook is missing required field {0:?}")]
    MissingField(&'static str),
    #[error("runbook has no steps")]
    NoSteps,
    #[error("runbook cites no hipaa controls")]
    NoControls,
    #[error("step {step}: action {action:?} is not in the whitelist")]
    UnknownAction { step: usize, action: String },
    #[error("step {step}: invalid parameters: {message}")]
    BadParams { step: usize, message: String },
    #[error("step {step}: timeout_seconds must be a positive integer")]
    BadTimeout { step: usize },
    #[error("duplicate runbook id {0:?}")]
    DuplicateId(String),
}

/// The action whitelist. Nothing outside these four verbs can be
/// expressed, let alone executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    RunCommand,
    RestartService,
    TriggerBackup,
    SyncManifest,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RunCommand => "run_command",
            Action::RestartService => "restart_service",
            Action::TriggerBackup => "trigger_backup",
            Action::SyncManifest => "sync_manifest",
        }
    }

    fn parse(s: &str) -> Option<Action> {
        match s {
            "run_command" => Some(Action::RunCommand),
            "restart_service" => Some(Action::RestartService),
            "trigger_backup" => Some(Action::TriggerBackup),
            "sync_manifest" => Some(Action::SyncManifest),
            _ => None,
        }
    }
}

/// Program plus argv; parameters are never concatenated into a shell line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunCommandParams {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RestartServiceParams {
    pub service: String,
}

fn default_backup_unit() -> String {
    "backup.service".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TriggerBackupParams {
    #[serde(default = "default_backup_unit")]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SyncManifestParams {
    /// Optional flake reference to switch to; the current system flake
    /// when absent.
    #[serde(default)]
    pub flake_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepParams {
    RunCommand(RunCommandParams),
    RestartService(RestartServiceParams),
    TriggerBackup(TriggerBackupParams),
    SyncManifest(SyncManifestParams),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub action: Action,
    pub params: StepParams,
    pub timeout_seconds: u64,
}

impl Step {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

/// A validated runbook. Construction goes through [`Runbook::from_yaml`];
/// instances are immutable thereafter.
#[derive(Debug, Clone)]
pub struct Runbook {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub hipaa_controls: Vec<String>,
    pub disruptive: bool,
    pub verify: FixCheck,
    pub steps: Vec<Step>,
    pub rollback: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    action: String,
    #[serde(default)]
    params: serde_yaml::Value,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRunbook {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    hipaa_controls: Vec<String>,
    #[serde(default)]
    disruptive: bool,
    #[serde(default)]
    verify: Option<FixCheck>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    rollback: Vec<RawStep>,
}

fn validate_step(index: usize, raw: RawStep) -> Result<Step, RunbookError> {
    let action = Action::parse(&raw.action).ok_or_else(|| RunbookError::UnknownAction {
        step: index,
        action: raw.action.clone(),
    })?;

    let bad_params = |e: serde_yaml::Error| RunbookError::BadParams {
        step: index,
        message: e.to_string(),
    };
    // An omitted mapping is only acceptable for actions whose record has
    // no required keys.
    let params_value = if raw.params.is_null() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        raw.params
    };
    let params = match action {
        Action::RunCommand => {
            StepParams::RunCommand(serde_yaml::from_value(params_value).map_err(bad_params)?)
        }
        Action::RestartService => {
            StepParams::RestartService(serde_yaml::from_value(params_value).map_err(bad_params)?)
        }
        Action::TriggerBackup => {
            StepParams::TriggerBackup(serde_yaml::from_value(params_value).map_err(bad_params)?)
        }
        Action::SyncManifest => {
            StepParams::SyncManifest(serde_yaml::from_value(params_value).map_err(bad_params)?)
        }
    };

    let timeout_seconds = match raw.timeout_seconds {
        Some(t) if t > 0 => t,
        _ => return Err(RunbookError::BadTimeout { step: index }),
    };

    Ok(Step {
        action,
        params,
        timeout_seconds,
    })
}

impl Runbook {
    pub fn from_yaml(contents: &str) -> Result<Runbook, RunbookError> {
        let raw: RawRunbook = serde_yaml::from_str(contents)?;

        let id = raw
            .id
            .filter(|s| !s.trim().is_empty())
            .ok_or(RunbookError::MissingField("id"))?;
        let name = raw
            .name
            .filter(|s| !s.trim().is_empty())
            .ok_or(RunbookError::MissingField("name"))?;
        if raw.hipaa_controls.is_empty() {
            return Err(RunbookError::NoControls);
        }
        if raw.steps.is_empty() {
            return Err(RunbookError::NoSteps);
        }

        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| validate_step(i, s))
            .collect::<Result<Vec<_>, _>>()?;
        let rollback = raw
            .rollback
            .into_iter()
            .enumerate()
            .map(|(i, s)| validate_step(i, s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Runbook {
            id,
            name,
            severity: raw.severity.unwrap_or(Severity::Medium),
            hipaa_controls: raw.hipaa_controls,
            disruptive: raw.disruptive,
            verify: raw.verify.unwrap_or(FixCheck::None),
            steps,
            rollback,
        })
    }

    /// Upper bound for one execution: the sum of step timeouts.
    pub fn step_timeout_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.steps.iter().map(|s| s.timeout_seconds).sum())
    }

    pub fn has_rollback(&self) -> bool {
        !self.rollback.is_empty()
    }
}

/// The set of validated runbooks, loaded once at startup.
#[derive(Default)]
pub struct RunbookSet {
    runbooks: BTreeMap<String, Runbook>,
}

impl RunbookSet {
    /// Load every `*.yaml`/`*.yml` in `dir`. Invalid documents are
    /// refused and reported; they can never be executed.
    pub fn load_dir(dir: &Path) -> (RunbookSet, Vec<(PathBuf, RunbookError)>) {
        let mut set = RunbookSet::default();
        let mut failures = Vec::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                failures.push((dir.to_path_buf(), RunbookError::Io(err)));
                return (set, failures);
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let result = fs::read_to_string(&path)
                .map_err(RunbookError::from)
                .and_then(|contents| Runbook::from_yaml(&contents));
            match result {
                Ok(runbook) => {
                    if set.runbooks.contains_key(&runbook.id) {
                        failures.push((path, RunbookError::DuplicateId(runbook.id)));
                        continue;
                    }
                    info!(id = %runbook.id, path = %path.display(), "loaded runbook");
                    set.runbooks.insert(runbook.id.clone(), runbook);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "refused invalid runbook");
                    failures.push((path, err));
                }
            }
        }
        (set, failures)
    }

    pub fn get(&self, id: &str) -> Option<&Runbook> {
        self.runbooks.get(id)
    }

    pub fn len(&self) -> usize {
        self.runbooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runbooks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.runbooks.keys().map(|s| s.as_str())
    }

    #[cfg(test)]
    pub fn insert_for_test(&mut self, runbook: Runbook) {
        self.runbooks.insert(runbook.id.clone(), runbook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = r#"
id: RB-SERVICE-001
name: Restart inactive critical services
severity: high
hipaa_controls: ["164.312(b)"]
verify: services_active
steps:
  - action: restart_service
    params: { service: chronyd }
    timeout_seconds: 60
rollback:
  - action: run_command
    params: { program: logger, args: ["-t", "custos", "service restart rolled back"] }
    timeout_seconds: 10
"#;

    #[test]
    fn test_valid_runbook_loads() {
        let rb = Runbook::from_yaml(VALID).unwrap();
        assert_eq!(rb.id, "RB-SERVICE-001");
        assert_eq!(rb.severity, Severity::High);
        assert_eq!(rb.verify, FixCheck::ServicesActive);
        assert_eq!(rb.steps.len(), 1);
        assert!(rb.has_rollback());
        assert_eq!(rb.step_timeout_budget().as_secs(), 60);
        match &rb.steps[0].params {
            StepParams::RestartService(p) => assert_eq!(p.service, "chronyd"),
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[test]
    fn test_action_outside_whitelist_refused() {
        let doc = VALID.replace("restart_service", "spawn_shell");
        assert!(matches!(
            Runbook::from_yaml(&doc),
            Err(RunbookError::UnknownAction { .. })
        ));
    }

    #[test]
    fn test_missing_timeout_refused() {
        let doc = VALID.replace("    timeout_seconds: 60\n", "");
        assert!(matches!(
            Runbook::from_yaml(&doc),
            Err(RunbookError::BadTimeout { step: 0 })
        ));
    }

    #[test]
    fn test_zero_timeout_refused() {
        let doc = VALID.replace("timeout_seconds: 60", "timeout_seconds: 0");
        assert!(matches!(
            Runbook::from_yaml(&doc),
            Err(RunbookError::BadTimeout { step: 0 })
        ));
    }

    #[test]
    fn test_unknown_param_key_refused() {
        let doc = VALID.replace(
            "params: { service: chronyd }",
            "params: { service: chronyd, shell: /bin/sh }",
        );
        assert!(matches!(
            Runbook::from_yaml(&doc),
            Err(RunbookError::BadParams { step: 0, .. })
        ));
    }

    #[test]
    fn test_missing_id_name_controls_steps_refused() {
        assert!(matches!(
            Runbook::from_yaml(&VALID.replace("id: RB-SERVICE-001\n", "")),
            Err(RunbookError::MissingField("id"))
        ));
        assert!(matches!(
            Runbook::from_yaml(&VALID.replace("name: Restart inactive critical services\n", "")),
            Err(RunbookError::MissingField("name"))
        ));
        assert!(matches!(
            Runbook::from_yaml(&VALID.replace("hipaa_controls: [\"164.312(b)\"]", "hipaa_controls: []")),
            Err(RunbookError::NoControls)
        ));
        let no_steps = r#"
id: RB-X
name: x
hipaa_controls: ["164.312(b)"]
"#;
        assert!(matches!(
            Runbook::from_yaml(no_steps),
            Err(RunbookError::NoSteps)
        ));
    }

    #[test]
    fn test_sync_manifest_params_default() {
        let doc = r#"
id: RB-DRIFT-001
name: Resync configuration manifest
hipaa_controls: ["164.312(c)(1)"]
disruptive: true
steps:
  - action: sync_manifest
    timeout_seconds: 600
"#;
        let rb = Runbook::from_yaml(doc).unwrap();
        assert!(rb.disruptive);
        assert_eq!(
            rb.steps[0].params,
            StepParams::SyncManifest(SyncManifestParams::default())
        );
    }

    #[test]
    fn test_load_dir_refuses_invalid_keeps_valid() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("good.yaml"), VALID).unwrap();
        fs::write(
            dir.path().join("bad.yaml"),
            VALID.replace("restart_service", "rm_rf"),
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (set, failures) = RunbookSet::load_dir(dir.path());
        assert_eq!(set.len(), 1);
        assert!(set.get("RB-SERVICE-001").is_some());
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_load_dir_refuses_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yaml"), VALID).unwrap();
        fs::write(dir.path().join("b.yaml"), VALID).unwrap();
        let (set, failures) = RunbookSet::load_dir(dir.path());
        assert_eq!(set.len(), 1);
        assert!(matches!(failures[0].1, RunbookError::DuplicateId(_)));
    }
}
