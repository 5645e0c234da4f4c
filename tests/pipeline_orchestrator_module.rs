mod support;

use depshift::pipeline::{
    execute_validate, route, ChannelEventSink, MemoryEventSink, MigrationRun, NullEventSink,
    ProjectRef, RunErrorKind, RunStatus, StageName, StageOutcome, WORKFLOW_END_STAGE,
    WORKFLOW_START_STAGE,
};
use depshift::runtime::CancelToken;
use depshift::sandbox::{Ecosystem, SandboxPhase};
use std::sync::Arc;
use support::*;
use tempfile::tempdir;

fn last_error_kind(run: &MigrationRun) -> Option<RunErrorKind> {
    run.errors.last().map(|error| error.kind)
}

#[test]
fn passing_validation_is_staged_and_deployed() {
    let validator = ScriptedValidator::always_passing();
    let stager = RecordingStager::succeeding();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            validator.clone(),
            NoFixDiagnoser::new(),
            stager.clone(),
        ),
        sink.clone(),
    );
    let id = seed_run(&orchestrator, "run-happy", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::Deployed);
    assert!(run.is_terminal());
    assert_eq!(run.retry_count, 0);
    assert!(run.errors.is_empty());
    assert!(run.finished_at.is_some());
    let deployment = run.deployment.as_ref().expect("deployment");
    assert_eq!(deployment.branch, "depshift/main");
    assert_eq!(stager.staged(), vec![upgrade("express", "4.17.1", "4.19.2")]);
    assert_eq!(validator.requests().len(), 1);
    assert_eq!(orchestrator.store().get(&id).expect("stored"), run);

    let events = sink.events_for(&id);
    let stages: Vec<&str> = events.iter().map(|e| e.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            WORKFLOW_START_STAGE,
            "plan",
            "validate",
            "stage_change",
            WORKFLOW_END_STAGE
        ]
    );
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    assert_eq!(run.event_sequence, 5);
    assert_eq!(events[0].outcome, "started");
    assert_eq!(events[0].summary["ecosystem"], run.project.ecosystem.as_str());
    assert_eq!(events[0].summary["max_retries"], 3);
    assert_eq!(events[1].summary["dependency_count"], 1);
    assert_eq!(events[2].summary["tests_skipped"], true);
    assert_eq!(
        events[3].summary["change_request"],
        "https://git.example.test/shop/pull/7"
    );
    assert_eq!(events[4].outcome, "deployed");
}

#[test]
fn start_failure_routes_to_diagnose_with_budget_left() {
    let project = tempdir().expect("project");
    let staging = tempdir().expect("staging");
    node_project(project.path(), EXPRESS_APP_NO_TESTS);
    let backend = ScriptedBackend::new(Script {
        alive: false,
        app_log: "Error: Cannot find module 'left-pad'".to_string(),
        ..Script::default()
    });
    let engine = engine_with(&backend, sandbox_settings(), staging.path());
    let mut run = MigrationRun::new(
        run_id("run-scenario-b"),
        ProjectRef {
            path: project.path().to_path_buf(),
            ecosystem: Ecosystem::Node,
        },
        "main".to_string(),
        3,
    );
    run.change_set = Some(upgrade("express", "4.17.1", "4.19.2"));

    let result = execute_validate(&run, &engine);
    assert_eq!(result.outcome, StageOutcome::Failure);
    assert_eq!(result.error_kind, Some(RunErrorKind::StartupFailure));
    assert!(result
        .errors
        .iter()
        .any(|line| line.contains("Cannot find module 'left-pad'")));

    let next = route(&result, run.retry_count, run.max_retries);
    assert_eq!(next.next, StageName::Diagnose);
    assert_eq!(next.status, RunStatus::ValidationFailed);
    assert!(!next.increment_retry);
}

#[test]
fn diagnosis_without_fixes_ends_the_run_without_retrying() {
    let diagnoser = NoFixDiagnoser::new();
    let validator = ScriptedValidator::always_failing(SandboxPhase::Start);
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            validator.clone(),
            diagnoser.clone(),
            RecordingStager::succeeding(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-scenario-c", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.stage, StageName::End);
    assert_eq!(run.status, RunStatus::Analyzed);
    assert_eq!(run.retry_count, 0);
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::DiagnosisExhausted));
    assert_eq!(diagnoser.calls(), 1);
    assert_eq!(validator.requests().len(), 1);
    assert!(run.candidate_change_set.is_none());
}

#[test]
fn exhausted_retries_stop_before_a_further_diagnosis() {
    let diagnoser = AlwaysFixDiagnoser::new(0.5);
    let validator = ScriptedValidator::always_failing(SandboxPhase::Start);
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            validator.clone(),
            diagnoser.clone(),
            RecordingStager::succeeding(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-scenario-d", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::ValidationFailed);
    assert!(run.is_terminal());
    assert_eq!(run.retry_count, 3);
    assert_eq!(diagnoser.calls(), 3);
    assert_eq!(validator.requests().len(), 4);
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::DiagnosisExhausted));

    // every attempt keeps its own evidence
    let attempts: Vec<u32> = run.attempts.iter().map(|v| v.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);
    for verdict in &run.attempts {
        let evidence = verdict.evidence.as_deref().expect("evidence");
        assert!(evidence.starts_with(&format!("attempt {}", verdict.attempt)));
        assert_eq!(verdict.failed_phase, Some(SandboxPhase::Start));
    }
    let failed_attempts: std::collections::BTreeSet<u32> = run
        .errors
        .iter()
        .filter(|error| error.kind == RunErrorKind::StartupFailure)
        .map(|error| error.attempt)
        .collect();
    assert_eq!(failed_attempts.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(run.diagnoses.len(), 3);
}

#[test]
fn retry_bound_holds_for_every_budget() {
    for max_retries in 0..=8 {
        let diagnoser = AlwaysFixDiagnoser::new(0.0);
        let validator = ScriptedValidator::always_failing(SandboxPhase::Install);
        let orchestrator = orchestrator(
            collaborators(
                default_planner(),
                validator.clone(),
                diagnoser.clone(),
                RecordingStager::succeeding(),
            ),
            Arc::new(NullEventSink),
        );
        let id = seed_run(&orchestrator, &format!("run-sweep-{max_retries}"), max_retries);

        let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

        assert!(run.is_terminal(), "max_retries={max_retries}");
        assert!(run.retry_count <= run.max_retries);
        assert_eq!(run.retry_count, max_retries);
        assert_eq!(validator.requests().len() as u32, max_retries + 1);
        assert_eq!(diagnoser.calls() as u32, max_retries);
        assert_eq!(run.status, RunStatus::ValidationFailed);
    }
}

#[test]
fn diagnosis_edits_flow_into_the_next_attempt_only() {
    let validator = ScriptedValidator::new(vec![Some(SandboxPhase::Start)], None);
    let stager = RecordingStager::succeeding();
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            validator.clone(),
            AlwaysFixDiagnoser::new(0.0),
            stager.clone(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-recovers", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::Deployed);
    assert_eq!(run.retry_count, 1);
    let plan = run.change_set.as_ref().expect("plan");
    assert!(plan.get("left-pad").is_none());
    let candidate = run.candidate_change_set.as_ref().expect("candidate");
    assert_eq!(
        candidate
            .get("left-pad")
            .and_then(|change| change.target_version.as_deref()),
        Some("1.3.1")
    );

    let requests = validator.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].attempt, 0);
    assert_eq!(requests[0].change_set.as_ref(), Some(plan));
    assert_eq!(requests[1].attempt, 1);
    assert_eq!(requests[1].change_set.as_ref(), Some(candidate));
    assert_eq!(stager.staged(), vec![candidate.clone()]);
}

#[test]
fn collaborator_panic_ends_the_run_as_error() {
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            Arc::new(PanickingValidator),
            AlwaysFixDiagnoser::new(0.0),
            RecordingStager::succeeding(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-panics", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.is_terminal());
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::UnexpectedFault));
    assert!(run
        .errors
        .iter()
        .any(|error| error.message.contains("container runtime exploded")));
}

#[test]
fn planner_failure_never_reaches_the_sandbox() {
    let validator = ScriptedValidator::always_passing();
    let orchestrator = orchestrator(
        collaborators(
            Arc::new(FailingPlanner),
            validator.clone(),
            NoFixDiagnoser::new(),
            RecordingStager::succeeding(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-no-plan", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::PlanningFailure));
    assert!(validator.requests().is_empty());
}

#[test]
fn staging_failure_ends_the_run_as_error() {
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            ScriptedValidator::always_passing(),
            NoFixDiagnoser::new(),
            RecordingStager::failing(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-push-rejected", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::StagingFailure));
    assert!(run.deployment.is_none());
    assert_eq!(run.attempts.len(), 1);
}

#[test]
fn failing_event_sinks_do_not_affect_the_run() {
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            ScriptedValidator::always_passing(),
            NoFixDiagnoser::new(),
            RecordingStager::succeeding(),
        ),
        Arc::new(FailingSink),
    );
    let id = seed_run(&orchestrator, "run-deaf-sink", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");
    assert_eq!(run.status, RunStatus::Deployed);
    assert_eq!(run.event_sequence, 5);
}

#[test]
fn full_channel_sink_drops_events_without_blocking() {
    let (sink, receiver) = ChannelEventSink::bounded(2);
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            ScriptedValidator::always_passing(),
            NoFixDiagnoser::new(),
            RecordingStager::succeeding(),
        ),
        Arc::new(sink),
    );
    let id = seed_run(&orchestrator, "run-full-buffer", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.status, RunStatus::Deployed);
    let delivered: Vec<u64> = receiver.try_iter().map(|event| event.sequence).collect();
    assert_eq!(delivered, vec![1, 2]);
}

#[test]
fn costs_accumulate_per_stage() {
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            ScriptedValidator::always_failing(SandboxPhase::Test),
            AlwaysFixDiagnoser::new(0.5),
            RecordingStager::succeeding(),
        ),
        Arc::new(NullEventSink),
    );
    let id = seed_run(&orchestrator, "run-costs", 3);

    let run = orchestrator.run(&id, &CancelToken::new()).expect("run");

    assert_eq!(run.cost_ledger.get("diagnose"), Some(&1.5));
    assert_eq!(run.cost_ledger.get("plan"), Some(&0.02));
    assert!((run.total_cost_usd - 1.52).abs() < 1e-9);
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::DiagnosisExhausted));
}

#[test]
fn cancellation_before_the_first_stage_skips_all_work() {
    let validator = ScriptedValidator::always_passing();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            validator.clone(),
            NoFixDiagnoser::new(),
            RecordingStager::succeeding(),
        ),
        sink.clone(),
    );
    let id = seed_run(&orchestrator, "run-cancelled", 3);
    let cancel = CancelToken::new();
    cancel.cancel();

    let run = orchestrator.run(&id, &cancel).expect("run");

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.is_terminal());
    assert_eq!(last_error_kind(&run), Some(RunErrorKind::Cancelled));
    assert!(run.change_set.is_none());
    assert!(validator.requests().is_empty());
    let outcomes: Vec<String> = sink.events().into_iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec!["started", "cancelled", "cancelled"]);
}

#[test]
fn finished_runs_are_returned_unchanged() {
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(
        collaborators(
            default_planner(),
            ScriptedValidator::always_passing(),
            NoFixDiagnoser::new(),
            RecordingStager::succeeding(),
        ),
        sink.clone(),
    );
    let id = seed_run(&orchestrator, "run-once", 3);
    let first = orchestrator.run(&id, &CancelToken::new()).expect("first");
    let events = sink.events().len();

    let second = orchestrator.run(&id, &CancelToken::new()).expect("second");

    assert_eq!(first, second);
    assert_eq!(sink.events().len(), events);
}
