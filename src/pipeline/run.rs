use super::collaborators::{DeploymentRecord, Diagnosis};
use super::error::{RunError, RunErrorKind};
use crate::changeset::ChangeSet;
use crate::sandbox::{Ecosystem, ValidationVerdict};
use crate::shared::{now_rfc3339, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Plan,
    Validate,
    Diagnose,
    StageChange,
    End,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Plan => "plan",
            StageName::Validate => "validate",
            StageName::Diagnose => "diagnose",
            StageName::StageChange => "stage_change",
            StageName::End => "end",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milestone status of a run. Whether a run has finished is decided by its
/// stage reaching [`StageName::End`], not by the status alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Validated,
    ValidationFailed,
    Analyzed,
    Deployed,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Validated => "validated",
            RunStatus::ValidationFailed => "validation_failed",
            RunStatus::Analyzed => "analyzed",
            RunStatus::Deployed => "deployed",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub path: PathBuf,
    pub ecosystem: Ecosystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: RunId,
    pub project: ProjectRef,
    pub target_branch: String,
    pub max_retries: u32,
    pub retry_count: u32,
    pub stage: StageName,
    pub status: RunStatus,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default)]
    pub cost_ledger: BTreeMap<String, f64>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub event_sequence: u64,
    /// The planned change set. Never modified after Plan.
    #[serde(default)]
    pub change_set: Option<ChangeSet>,
    /// Planned change set with diagnosis edits applied; the next sandbox input.
    #[serde(default)]
    pub candidate_change_set: Option<ChangeSet>,
    /// Every validation verdict, oldest first.
    #[serde(default)]
    pub attempts: Vec<ValidationVerdict>,
    #[serde(default)]
    pub diagnoses: Vec<Diagnosis>,
    #[serde(default)]
    pub deployment: Option<DeploymentRecord>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl MigrationRun {
    pub fn new(id: RunId, project: ProjectRef, target_branch: String, max_retries: u32) -> Self {
        let now = now_rfc3339();
        Self {
            id,
            project,
            target_branch,
            max_retries,
            retry_count: 0,
            stage: StageName::Plan,
            status: RunStatus::Pending,
            errors: Vec::new(),
            cost_ledger: BTreeMap::new(),
            total_cost_usd: 0.0,
            event_sequence: 0,
            change_set: None,
            candidate_change_set: None,
            attempts: Vec::new(),
            diagnoses: Vec::new(),
            deployment: None,
            created_at: now.clone(),
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage == StageName::End
    }

    /// Change set the next validation attempt should apply.
    pub fn sandbox_change_set(&self) -> Option<&ChangeSet> {
        self.candidate_change_set
            .as_ref()
            .or(self.change_set.as_ref())
    }

    pub fn latest_verdict(&self) -> Option<&ValidationVerdict> {
        self.attempts.last()
    }

    pub fn add_cost(&mut self, stage: StageName, cost_usd: f64) {
        if cost_usd <= 0.0 || !cost_usd.is_finite() {
            return;
        }
        *self
            .cost_ledger
            .entry(stage.as_str().to_string())
            .or_insert(0.0) += cost_usd;
        self.total_cost_usd += cost_usd;
    }

    pub fn push_error(&mut self, kind: RunErrorKind, stage: StageName, message: impl Into<String>) {
        self.errors.push(RunError {
            kind,
            stage,
            attempt: self.retry_count,
            message: message.into(),
        });
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.event_sequence += 1;
        self.event_sequence
    }

    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> MigrationRun {
        MigrationRun::new(
            RunId::parse("run-test-0001").expect("id"),
            ProjectRef {
                path: PathBuf::from("/tmp/project"),
                ecosystem: Ecosystem::Node,
            },
            "main".to_string(),
            3,
        )
    }

    #[test]
    fn cost_accumulates_per_stage() {
        let mut run = run();
        run.add_cost(StageName::Plan, 0.25);
        run.add_cost(StageName::Diagnose, 0.5);
        run.add_cost(StageName::Diagnose, 0.25);
        run.add_cost(StageName::Validate, f64::NAN);
        assert_eq!(run.cost_ledger.get("diagnose"), Some(&0.75));
        assert_eq!(run.total_cost_usd, 1.0);
    }

    #[test]
    fn sequence_is_monotonic() {
        let mut run = run();
        assert_eq!(run.next_sequence(), 1);
        assert_eq!(run.next_sequence(), 2);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::ValidationFailed).expect("json");
        assert_eq!(json, "\"validation_failed\"");
    }
}
