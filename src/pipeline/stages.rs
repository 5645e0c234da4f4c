use super::collaborators::{
    ChangeStager, Costed, DeploymentRecord, Diagnoser, Diagnosis, Planner, ProjectSnapshot,
};
use super::error::{CollaboratorError, RunErrorKind};
use super::run::{MigrationRun, StageName};
use crate::changeset::ChangeSet;
use crate::sandbox::{ChangeSetValidator, SandboxError, ValidationRequest, ValidationVerdict};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure,
    Error,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::Failure => "failure",
            StageOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StagePayload {
    None,
    Plan(ChangeSet),
    Verdict(Box<ValidationVerdict>),
    Diagnosis(Diagnosis),
    Deployment(DeploymentRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub outcome: StageOutcome,
    pub payload: StagePayload,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Category of the failure when `outcome` is not success.
    #[serde(default)]
    pub error_kind: Option<RunErrorKind>,
    #[serde(default)]
    pub cost_usd: f64,
}

impl StageResult {
    pub fn success(stage: StageName, payload: StagePayload, cost_usd: f64) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Success,
            payload,
            errors: Vec::new(),
            error_kind: None,
            cost_usd,
        }
    }

    pub fn failure(stage: StageName, kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Failure,
            payload: StagePayload::None,
            errors: vec![message.into()],
            error_kind: Some(kind),
            cost_usd: 0.0,
        }
    }

    pub fn fault(stage: StageName, message: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::Error,
            ..Self::failure(stage, RunErrorKind::UnexpectedFault, message)
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StageOutcome::Success
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `body` and converts a panic into an `error` result so no fault
/// crosses the stage boundary.
fn guarded(stage: StageName, body: impl FnOnce() -> StageResult) -> StageResult {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => StageResult::fault(
            stage,
            format!("{stage} stage panicked: {}", panic_message(payload.as_ref())),
        ),
    }
}

pub fn snapshot_of(run: &MigrationRun) -> ProjectSnapshot {
    ProjectSnapshot {
        path: run.project.path.clone(),
        ecosystem: run.project.ecosystem,
        target_branch: run.target_branch.clone(),
    }
}

fn collaborator_failure(stage: StageName, kind: RunErrorKind, err: CollaboratorError) -> StageResult {
    StageResult::failure(stage, kind, format!("{stage} collaborator failed: {err}"))
}

pub fn execute_plan(run: &MigrationRun, planner: &dyn Planner) -> StageResult {
    let stage = StageName::Plan;
    guarded(stage, || {
        let Costed { value: change_set, cost_usd } = match planner.plan(&snapshot_of(run)) {
            Ok(planned) => planned,
            Err(err) => return collaborator_failure(stage, RunErrorKind::PlanningFailure, err),
        };
        let mut result = if change_set.is_empty() {
            StageResult::failure(
                stage,
                RunErrorKind::PlanningFailure,
                "planner produced an empty change set",
            )
        } else if let Err(err) = change_set.validate() {
            StageResult::failure(
                stage,
                RunErrorKind::PlanningFailure,
                format!("planner produced an invalid change set: {err}"),
            )
        } else {
            StageResult::success(stage, StagePayload::Plan(change_set), cost_usd)
        };
        result.cost_usd = cost_usd;
        result
    })
}

pub fn execute_validate(run: &MigrationRun, validator: &dyn ChangeSetValidator) -> StageResult {
    let stage = StageName::Validate;
    guarded(stage, || {
        let request = ValidationRequest {
            run_id: run.id.clone(),
            attempt: run.retry_count,
            project_path: run.project.path.clone(),
            ecosystem: run.project.ecosystem,
            change_set: run.sandbox_change_set().cloned(),
        };
        match validator.validate(&request) {
            Ok(verdict) if verdict.proceed() => {
                StageResult::success(stage, StagePayload::Verdict(Box::new(verdict)), 0.0)
            }
            Ok(verdict) => {
                let kind = verdict
                    .failed_phase
                    .map(RunErrorKind::from)
                    .unwrap_or(RunErrorKind::SandboxProvisioningFailure);
                let mut errors = vec![match verdict.failed_phase {
                    Some(phase) => format!("validation attempt {} failed at {phase}", verdict.attempt),
                    None => format!("validation attempt {} did not complete", verdict.attempt),
                }];
                errors.extend(verdict.highlights.iter().cloned());
                StageResult {
                    stage,
                    outcome: StageOutcome::Failure,
                    payload: StagePayload::Verdict(Box::new(verdict)),
                    errors,
                    error_kind: Some(kind),
                    cost_usd: 0.0,
                }
            }
            Err(err @ SandboxError::SessionAlreadyLive { .. }) => {
                StageResult::fault(stage, err.to_string())
            }
            Err(err) => StageResult {
                outcome: StageOutcome::Error,
                ..StageResult::failure(
                    stage,
                    RunErrorKind::SandboxProvisioningFailure,
                    err.to_string(),
                )
            },
        }
    })
}

pub fn execute_diagnose(run: &MigrationRun, diagnoser: &dyn Diagnoser) -> StageResult {
    let stage = StageName::Diagnose;
    guarded(stage, || {
        let Some(verdict) = run.latest_verdict() else {
            return StageResult::fault(stage, "no validation verdict to diagnose");
        };
        let Some(change_set) = run.sandbox_change_set() else {
            return StageResult::fault(stage, "no change set to diagnose");
        };
        match diagnoser.diagnose(verdict, change_set) {
            Ok(Costed { value, cost_usd }) => {
                StageResult::success(stage, StagePayload::Diagnosis(value), cost_usd)
            }
            Err(err) => collaborator_failure(stage, RunErrorKind::DiagnosisExhausted, err),
        }
    })
}

pub fn execute_stage_change(run: &MigrationRun, stager: &dyn ChangeStager) -> StageResult {
    let stage = StageName::StageChange;
    guarded(stage, || {
        let Some(verdict) = run.latest_verdict().filter(|verdict| verdict.proceed()) else {
            return StageResult::fault(stage, "no successful validation to stage");
        };
        let Some(change_set) = run.sandbox_change_set() else {
            return StageResult::fault(stage, "no change set to stage");
        };
        match stager.stage(&snapshot_of(run), change_set, verdict) {
            Ok(Costed { value, cost_usd }) => {
                StageResult::success(stage, StagePayload::Deployment(value), cost_usd)
            }
            Err(err) => collaborator_failure(stage, RunErrorKind::StagingFailure, err),
        }
    })
}
