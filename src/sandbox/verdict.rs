use super::ecosystem::Ecosystem;
use super::evidence::{extract_highlights, tail_truncate, TestSummary, MAX_PHASE_LOG_BYTES};
use super::session::{RetainedEnvironment, SessionState};
use crate::shared::SessionId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPhase {
    Provision,
    Inject,
    ApplyChangeSet,
    Install,
    Start,
    HealthCheck,
    Test,
}

impl SandboxPhase {
    pub const ALL: [SandboxPhase; 7] = [
        SandboxPhase::Provision,
        SandboxPhase::Inject,
        SandboxPhase::ApplyChangeSet,
        SandboxPhase::Install,
        SandboxPhase::Start,
        SandboxPhase::HealthCheck,
        SandboxPhase::Test,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxPhase::Provision => "provision",
            SandboxPhase::Inject => "inject",
            SandboxPhase::ApplyChangeSet => "apply_change_set",
            SandboxPhase::Install => "install",
            SandboxPhase::Start => "start",
            SandboxPhase::HealthCheck => "health_check",
            SandboxPhase::Test => "test",
        }
    }
}

impl std::fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: SandboxPhase,
    pub status: PhaseStatus,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl PhaseReport {
    pub fn not_run(phase: SandboxPhase) -> Self {
        Self {
            phase,
            status: PhaseStatus::NotRun,
            log: String::new(),
            exit_code: None,
            timed_out: false,
            duration_ms: 0,
        }
    }
}

/// Per-phase reports in execution order, one slot per [`SandboxPhase`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLog {
    reports: Vec<PhaseReport>,
}

impl Default for PhaseLog {
    fn default() -> Self {
        Self {
            reports: SandboxPhase::ALL.iter().copied().map(PhaseReport::not_run).collect(),
        }
    }
}

impl PhaseLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, mut report: PhaseReport) {
        report.log = tail_truncate(&report.log, MAX_PHASE_LOG_BYTES);
        if let Some(slot) = self.reports.iter_mut().find(|r| r.phase == report.phase) {
            *slot = report;
        }
    }

    pub fn status(&self, phase: SandboxPhase) -> PhaseStatus {
        self.get(phase)
            .map(|report| report.status)
            .unwrap_or(PhaseStatus::NotRun)
    }

    pub fn get(&self, phase: SandboxPhase) -> Option<&PhaseReport> {
        self.reports.iter().find(|report| report.phase == phase)
    }

    pub fn reports(&self) -> &[PhaseReport] {
        &self.reports
    }

    pub fn earliest_failure(&self) -> Option<&PhaseReport> {
        self.reports
            .iter()
            .find(|report| report.status == PhaseStatus::Failed)
    }
}

/// Success requires install, start and health to pass, and tests to pass or be
/// skipped. Anything else, including phases that never ran, is failure.
pub fn compute_success(phases: &PhaseLog) -> bool {
    phases.status(SandboxPhase::Install) == PhaseStatus::Passed
        && phases.status(SandboxPhase::Start) == PhaseStatus::Passed
        && phases.status(SandboxPhase::HealthCheck) == PhaseStatus::Passed
        && matches!(
            phases.status(SandboxPhase::Test),
            PhaseStatus::Passed | PhaseStatus::Skipped
        )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub session_id: SessionId,
    pub environment_name: String,
    pub attempt: u32,
    pub ecosystem: Ecosystem,
    pub success: bool,
    pub phases: PhaseLog,
    #[serde(default)]
    pub failed_phase: Option<SandboxPhase>,
    /// Log of the earliest failing phase.
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub test_summary: Option<TestSummary>,
    #[serde(default)]
    pub retained: Option<RetainedEnvironment>,
    pub final_state: SessionState,
    pub started_at: String,
    pub finished_at: String,
}

impl ValidationVerdict {
    pub fn assemble(
        session_id: SessionId,
        environment_name: String,
        attempt: u32,
        ecosystem: Ecosystem,
        phases: PhaseLog,
        test_summary: Option<TestSummary>,
    ) -> Self {
        let success = compute_success(&phases);
        let failure = if success {
            None
        } else {
            phases.earliest_failure().cloned()
        };
        let evidence = failure.as_ref().map(|report| report.log.clone());
        let highlights = evidence
            .as_deref()
            .map(extract_highlights)
            .unwrap_or_default();
        Self {
            session_id,
            environment_name,
            attempt,
            ecosystem,
            success,
            failed_phase: failure.map(|report| report.phase),
            phases,
            evidence,
            highlights,
            test_summary,
            retained: None,
            final_state: SessionState::Created,
            started_at: String::new(),
            finished_at: String::new(),
        }
    }

    /// Whether the orchestrator may proceed to staging.
    pub fn proceed(&self) -> bool {
        self.success
    }

    pub fn passed(&self, phase: SandboxPhase) -> bool {
        self.phases.status(phase) == PhaseStatus::Passed
    }

    pub fn tests_skipped(&self) -> bool {
        self.phases.status(SandboxPhase::Test) == PhaseStatus::Skipped
    }
}
