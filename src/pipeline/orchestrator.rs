use super::collaborators::{ChangeStager, Diagnoser, Planner};
use super::error::{OrchestratorError, RunErrorKind};
use super::events::{EventSink, ProgressEvent, WORKFLOW_END_STAGE, WORKFLOW_START_STAGE};
use super::routing::{route, Route};
use super::run::{MigrationRun, RunStatus, StageName};
use super::stages::{
    execute_diagnose, execute_plan, execute_stage_change, execute_validate, StagePayload,
    StageResult,
};
use crate::runtime::{CancelToken, RunStore};
use crate::sandbox::{ChangeSetValidator, PhaseStatus, SandboxPhase};
use crate::shared::{now_rfc3339, RunId, RuntimeLog};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// The external services a run depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub validator: Arc<dyn ChangeSetValidator>,
    pub diagnoser: Arc<dyn Diagnoser>,
    pub stager: Arc<dyn ChangeStager>,
}

/// Drives one run at a time through Plan, Validate, Diagnose and StageChange.
#[derive(Clone)]
pub struct Orchestrator {
    collaborators: Collaborators,
    store: RunStore,
    sink: Arc<dyn EventSink>,
    log: RuntimeLog,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        store: RunStore,
        sink: Arc<dyn EventSink>,
        log: RuntimeLog,
    ) -> Self {
        Self {
            collaborators,
            store,
            sink,
            log,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Runs `run_id` to a terminal state. Cancellation is observed before
    /// every stage; a stage already executing is allowed to finish. Only
    /// store failures surface as errors.
    pub fn run(
        &self,
        run_id: &RunId,
        cancel: &CancelToken,
    ) -> Result<MigrationRun, OrchestratorError> {
        let mut run = self.store.get(run_id)?;
        if run.is_terminal() {
            return Ok(run);
        }

        run.status = RunStatus::Running;
        run.touch();
        self.store.update(&run)?;
        let start_summary = summary([
            ("ecosystem", json!(run.project.ecosystem.as_str())),
            ("max_retries", json!(run.max_retries)),
        ]);
        self.emit(&mut run, WORKFLOW_START_STAGE, "started", start_summary);
        self.log.info(
            "pipeline.run_started",
            &format!(
                "run_id={} ecosystem={} max_retries={}",
                run.id, run.project.ecosystem, run.max_retries
            ),
        );

        while !run.is_terminal() {
            if cancel.is_cancelled() {
                self.cancel(&mut run)?;
                break;
            }
            let stage = run.stage;
            let result = self.execute(stage, &run);
            let route = route(&result, run.retry_count, run.max_retries);
            let stage_summary = self.merge(&mut run, &result, &route);
            self.store.update(&run)?;
            self.log.info(
                "pipeline.transition",
                &format!(
                    "run_id={} stage={} outcome={} next={} status={} retry_count={}",
                    run.id,
                    stage,
                    result.outcome.as_str(),
                    route.next,
                    run.status,
                    run.retry_count
                ),
            );
            self.emit(&mut run, stage.as_str(), result.outcome.as_str(), stage_summary);
        }

        self.finish(&mut run);
        Ok(run)
    }

    fn execute(&self, stage: StageName, run: &MigrationRun) -> StageResult {
        match stage {
            StageName::Plan => execute_plan(run, self.collaborators.planner.as_ref()),
            StageName::Validate => execute_validate(run, self.collaborators.validator.as_ref()),
            StageName::Diagnose => execute_diagnose(run, self.collaborators.diagnoser.as_ref()),
            StageName::StageChange => {
                execute_stage_change(run, self.collaborators.stager.as_ref())
            }
            StageName::End => StageResult::fault(stage, "end is not an executable stage"),
        }
    }

    /// Applies a stage result and its route to the run. Returns the event
    /// summary for the stage.
    fn merge(
        &self,
        run: &mut MigrationRun,
        result: &StageResult,
        route: &Route,
    ) -> Map<String, Value> {
        run.add_cost(result.stage, result.cost_usd);
        if !result.is_success() {
            let kind = result.error_kind.unwrap_or(RunErrorKind::UnexpectedFault);
            for message in &result.errors {
                run.push_error(kind, result.stage, message.clone());
            }
        }

        let mut fields = Map::new();
        match &result.payload {
            StagePayload::Plan(change_set) => {
                fields.insert("dependency_count".to_string(), json!(change_set.len()));
                fields.insert("overall_risk".to_string(), json!(change_set.overall_risk));
                run.change_set = Some(change_set.clone());
            }
            StagePayload::Verdict(verdict) => {
                fields.insert("attempt".to_string(), json!(verdict.attempt));
                fields.insert("success".to_string(), json!(verdict.success));
                for phase in [
                    SandboxPhase::Install,
                    SandboxPhase::Start,
                    SandboxPhase::HealthCheck,
                    SandboxPhase::Test,
                ] {
                    fields.insert(
                        phase.as_str().to_string(),
                        json!(verdict.phases.status(phase)),
                    );
                }
                fields.insert(
                    "tests_skipped".to_string(),
                    json!(verdict.phases.status(SandboxPhase::Test) == PhaseStatus::Skipped),
                );
                if let Some(phase) = verdict.failed_phase {
                    fields.insert("failed_phase".to_string(), json!(phase));
                }
                if let Some(retained) = &verdict.retained {
                    fields.insert("retained_address".to_string(), json!(retained.address));
                }
                run.attempts.push(verdict.as_ref().clone());
            }
            StagePayload::Diagnosis(diagnosis) => {
                fields.insert("error_category".to_string(), json!(diagnosis.category));
                fields.insert(
                    "suggestion_count".to_string(),
                    json!(diagnosis.suggestions.len()),
                );
                fields.insert("confidence".to_string(), json!(diagnosis.confidence));
                if route.increment_retry {
                    let base = run.sandbox_change_set().cloned().unwrap_or_default();
                    run.candidate_change_set = Some(base.with_edits(&diagnosis.edits()));
                }
                run.diagnoses.push(diagnosis.clone());
            }
            StagePayload::Deployment(record) => {
                fields.insert("branch".to_string(), json!(record.branch));
                fields.insert("change_request".to_string(), json!(record.change_request));
                run.deployment = Some(record.clone());
            }
            StagePayload::None => {}
        }
        if let Some(kind) = result.error_kind {
            fields.insert("error_kind".to_string(), json!(kind));
        }
        fields.insert("cost_usd".to_string(), json!(result.cost_usd));

        if route.increment_retry {
            run.retry_count += 1;
        }
        if let Some((kind, message)) = &route.terminal_error {
            run.push_error(*kind, result.stage, message.clone());
        }
        run.stage = route.next;
        run.status = route.status;
        run.touch();
        fields
    }

    fn cancel(&self, run: &mut MigrationRun) -> Result<(), OrchestratorError> {
        let stage = run.stage;
        run.push_error(
            RunErrorKind::Cancelled,
            stage,
            format!("cancelled before {stage}"),
        );
        run.stage = StageName::End;
        run.status = RunStatus::Cancelled;
        run.touch();
        self.store.update(run)?;
        self.log.warn(
            "pipeline.cancelled",
            &format!("run_id={} before_stage={stage}", run.id),
        );
        self.emit(
            run,
            stage.as_str(),
            "cancelled",
            summary([("cancelled_before", json!(stage.as_str()))]),
        );
        Ok(())
    }

    fn finish(&self, run: &mut MigrationRun) {
        run.finished_at = Some(now_rfc3339());
        let mut fields = summary([
            ("status", json!(run.status)),
            ("retry_count", json!(run.retry_count)),
            ("attempts", json!(run.attempts.len())),
            ("total_cost_usd", json!(run.total_cost_usd)),
        ]);
        if let Some(error) = run.errors.last() {
            fields.insert("error_kind".to_string(), json!(error.kind));
        }
        let status = run.status.as_str();
        self.emit(run, WORKFLOW_END_STAGE, status, fields);
        // persisted after the end event so the stored sequence includes it
        if let Err(err) = self.store.update(run) {
            self.log.error(
                "pipeline.persist_failed",
                &format!("run_id={} error={err}", run.id),
            );
        }
        self.log.info(
            "pipeline.run_finished",
            &format!(
                "run_id={} status={} retry_count={} attempts={} total_cost_usd={:.4}",
                run.id,
                run.status,
                run.retry_count,
                run.attempts.len(),
                run.total_cost_usd
            ),
        );
    }

    /// Fire-and-forget: a failing sink is logged and otherwise ignored.
    fn emit(&self, run: &mut MigrationRun, stage: &str, outcome: &str, fields: Map<String, Value>) {
        let event = ProgressEvent {
            run_id: run.id.clone(),
            sequence: run.next_sequence(),
            stage: stage.to_string(),
            outcome: outcome.to_string(),
            status: run.status,
            retry_count: run.retry_count,
            timestamp: now_rfc3339(),
            summary: fields,
        };
        if let Err(err) = self.sink.emit(&event) {
            self.log.warn(
                "pipeline.event_dropped",
                &format!(
                    "run_id={} sequence={} stage={} error={err}",
                    event.run_id, event.sequence, event.stage
                ),
            );
        }
    }
}

fn summary<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
