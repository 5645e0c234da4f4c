use super::backend::{EnvironmentSpec, ExecOutput, SandboxBackend};
use super::docker::DockerCli;
use super::ecosystem::{Ecosystem, ProjectLayout};
use super::evidence::{parse_test_summary, TestSummary, MAX_PHASE_LOG_BYTES};
use super::inject::{stage_project, StagedProject};
use super::ports::PortAllocator;
use super::session::{SandboxSession, SessionGuard, SessionState};
use super::verdict::{PhaseLog, PhaseReport, PhaseStatus, SandboxPhase, ValidationVerdict};
use super::SandboxError;
use crate::changeset::{ChangeAction, ChangeSet};
use crate::config::SandboxSettings;
use crate::shared::ids::session_id_for;
use crate::shared::{environment_name, now_rfc3339, RunId, RuntimeLog};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub const APP_LOG_PATH: &str = "/tmp/depshift-app.log";
pub const APP_PID_PATH: &str = "/tmp/depshift-app.pid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub run_id: RunId,
    pub attempt: u32,
    pub project_path: PathBuf,
    pub ecosystem: Ecosystem,
    pub change_set: Option<ChangeSet>,
}

/// Seam between the pipeline's Validate stage and whatever proves a change
/// set. The sandbox engine is the production implementation.
pub trait ChangeSetValidator: Send + Sync {
    fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, SandboxError>;
}

struct Deadline {
    end: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            end: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    fn bound(&self, cap: Duration) -> Duration {
        cap.min(self.remaining())
    }

    fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

struct LiveRunClaim<'a> {
    live: &'a Mutex<BTreeSet<RunId>>,
    run_id: RunId,
}

impl Drop for LiveRunClaim<'_> {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

struct PhaseClock {
    phase: SandboxPhase,
    started: Instant,
}

impl PhaseClock {
    fn start(phase: SandboxPhase) -> Self {
        Self {
            phase,
            started: Instant::now(),
        }
    }

    fn report(&self, status: PhaseStatus, log: impl Into<String>) -> PhaseReport {
        PhaseReport {
            phase: self.phase,
            status,
            log: log.into(),
            exit_code: None,
            timed_out: false,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn passed(&self, log: impl Into<String>) -> PhaseReport {
        self.report(PhaseStatus::Passed, log)
    }

    fn failed(&self, log: impl Into<String>) -> PhaseReport {
        self.report(PhaseStatus::Failed, log)
    }

    fn timed_out(&self, log: impl Into<String>) -> PhaseReport {
        PhaseReport {
            timed_out: true,
            ..self.failed(log)
        }
    }

    /// A backend error; a command that ran out of time marks the phase
    /// timed out.
    fn from_backend_error(&self, err: &SandboxError) -> PhaseReport {
        match err {
            SandboxError::Timeout { .. } => self.timed_out(err.to_string()),
            _ => self.failed(err.to_string()),
        }
    }

    fn from_exec(&self, output: &ExecOutput, timeout: Duration) -> PhaseReport {
        let mut log = output.combined();
        if output.timed_out {
            log.push_str(&format!("\n[timed out after {}s]", timeout.as_secs()));
        }
        let status = if output.success() {
            PhaseStatus::Passed
        } else {
            PhaseStatus::Failed
        };
        PhaseReport {
            exit_code: Some(output.exit_code),
            timed_out: output.timed_out,
            ..self.report(status, log)
        }
    }
}

/// Everything one validation attempt accumulates while its phases run.
struct Attempt<'a> {
    request: &'a ValidationRequest,
    deadline: Deadline,
    guard: SessionGuard,
    phases: PhaseLog,
    staged: Option<StagedProject>,
    manifest: Option<String>,
    test_summary: Option<TestSummary>,
}

pub struct SandboxEngine {
    settings: SandboxSettings,
    backend: Arc<dyn SandboxBackend>,
    ports: Arc<PortAllocator>,
    staging_root: PathBuf,
    live_runs: Mutex<BTreeSet<RunId>>,
    log: RuntimeLog,
}

impl SandboxEngine {
    pub fn new(
        settings: SandboxSettings,
        backend: Arc<dyn SandboxBackend>,
        ports: Arc<PortAllocator>,
        staging_root: PathBuf,
        log: RuntimeLog,
    ) -> Self {
        Self {
            settings,
            backend,
            ports,
            staging_root,
            live_runs: Mutex::new(BTreeSet::new()),
            log,
        }
    }

    pub fn with_docker(settings: SandboxSettings, staging_root: PathBuf, log: RuntimeLog) -> Self {
        let backend = Arc::new(DockerCli::from_settings(&settings));
        let ports = PortAllocator::new(settings.host_port_range);
        Self::new(settings, backend, ports, staging_root, log)
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn live_session_count(&self) -> usize {
        self.live_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn claim(&self, run_id: &RunId) -> Result<LiveRunClaim<'_>, SandboxError> {
        let mut live = self
            .live_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !live.insert(run_id.clone()) {
            return Err(SandboxError::SessionAlreadyLive {
                run_id: run_id.to_string(),
            });
        }
        Ok(LiveRunClaim {
            live: &self.live_runs,
            run_id: run_id.clone(),
        })
    }

    /// Runs one validation attempt in a fresh environment and always tears it
    /// down (or retains it) before returning. Only a concurrent attempt for
    /// the same run is an error; every phase failure is part of the verdict.
    pub fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, SandboxError> {
        let _claim = self.claim(&request.run_id)?;
        let started_at = now_rfc3339();
        let name = environment_name(&self.settings.name_prefix, &request.run_id, request.attempt);
        let session = SandboxSession::new(
            session_id_for(&name),
            request.run_id.clone(),
            request.attempt,
            name.clone(),
        );
        self.log.info(
            "sandbox.validate_started",
            &format!(
                "run_id={} attempt={} environment={} ecosystem={}",
                request.run_id, request.attempt, name, request.ecosystem
            ),
        );

        let mut attempt = Attempt {
            request,
            deadline: Deadline::after(self.settings.validate_timeout()),
            guard: SessionGuard::new(
                Arc::clone(&self.backend),
                session,
                self.settings.retain_environments,
                self.log.clone(),
            ),
            phases: PhaseLog::new(),
            staged: None,
            manifest: None,
            test_summary: None,
        };

        if let Err(reason) = self.run_phases(&mut attempt) {
            attempt.guard.fail(reason);
        }
        let retained = attempt.guard.teardown();
        drop(attempt.staged.take());

        let session = attempt.guard.session().clone();
        let mut verdict = ValidationVerdict::assemble(
            session.id.clone(),
            session.environment_name.clone(),
            request.attempt,
            request.ecosystem,
            attempt.phases,
            attempt.test_summary,
        );
        verdict.retained = retained;
        verdict.final_state = session.state;
        verdict.started_at = started_at;
        verdict.finished_at = now_rfc3339();

        let failed_phase = verdict
            .failed_phase
            .map(|phase| phase.as_str())
            .unwrap_or("none");
        self.log.info(
            "sandbox.validate_finished",
            &format!(
                "run_id={} attempt={} success={} failed_phase={} final_state={}",
                request.run_id,
                request.attempt,
                verdict.success,
                failed_phase,
                verdict.final_state.name()
            ),
        );
        Ok(verdict)
    }

    fn record(&self, attempt: &mut Attempt<'_>, report: PhaseReport) -> Result<(), String> {
        let phase = report.phase;
        let status = report.status;
        let summary = report.log.lines().last().unwrap_or_default().to_string();
        self.log.info(
            "sandbox.phase",
            &format!(
                "run_id={} attempt={} phase={} status={:?} duration_ms={}",
                attempt.request.run_id, attempt.request.attempt, phase, status, report.duration_ms
            ),
        );
        attempt.phases.record(report);
        if status == PhaseStatus::Failed {
            return Err(format!("{phase} failed: {summary}"));
        }
        Ok(())
    }

    fn advance(attempt: &mut Attempt<'_>, next: SessionState) -> Result<(), String> {
        attempt.guard.transition(next).map_err(|err| err.to_string())
    }

    fn check_deadline(&self, attempt: &mut Attempt<'_>, phase: SandboxPhase) -> Result<(), String> {
        if !attempt.deadline.expired() {
            return Ok(());
        }
        let report = PhaseClock::start(phase).timed_out(format!(
            "validation deadline of {}s exceeded before {phase}",
            attempt.deadline.budget.as_secs()
        ));
        self.record(attempt, report)
    }

    /// Checked between backend calls inside a phase.
    fn overran(attempt: &Attempt<'_>, clock: &PhaseClock, step: &str) -> Option<PhaseReport> {
        attempt.deadline.expired().then(|| {
            clock.timed_out(format!(
                "validation deadline of {}s exceeded during {}: {step}",
                attempt.deadline.budget.as_secs(),
                clock.phase
            ))
        })
    }

    fn run_phases(&self, attempt: &mut Attempt<'_>) -> Result<(), String> {
        self.check_deadline(attempt, SandboxPhase::Provision)?;
        let report = self.provision(attempt);
        self.record(attempt, report)?;
        Self::advance(attempt, SessionState::Provisioned)?;

        self.check_deadline(attempt, SandboxPhase::Inject)?;
        let report = self.inject(attempt);
        self.record(attempt, report)?;
        Self::advance(attempt, SessionState::FilesInjected)?;

        self.check_deadline(attempt, SandboxPhase::ApplyChangeSet)?;
        let report = self.apply_change_set(attempt);
        let applied = report.status == PhaseStatus::Passed;
        self.record(attempt, report)?;
        if applied {
            Self::advance(attempt, SessionState::ChangeSetApplied)?;
        }

        self.check_deadline(attempt, SandboxPhase::Install)?;
        let report = self.install(attempt);
        self.record(attempt, report)?;
        Self::advance(attempt, SessionState::DependenciesInstalled)?;

        let layout = ProjectLayout::new(
            attempt
                .staged
                .as_ref()
                .map(|staged| staged.files().to_vec())
                .unwrap_or_default(),
            attempt.manifest.clone(),
        );

        self.check_deadline(attempt, SandboxPhase::Start)?;
        let report = self.start(attempt, &layout);
        self.record(attempt, report)?;
        Self::advance(attempt, SessionState::Started)?;

        self.check_deadline(attempt, SandboxPhase::HealthCheck)?;
        let report = self.health_check(attempt);
        self.record(attempt, report)?;
        Self::advance(attempt, SessionState::HealthChecked)?;

        self.check_deadline(attempt, SandboxPhase::Test)?;
        let report = self.test(attempt, &layout);
        self.record(attempt, report)?;
        Self::advance(attempt, SessionState::Tested)
    }

    fn provision(&self, attempt: &mut Attempt<'_>) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::Provision);
        let name = attempt.guard.environment_name().to_string();
        let lease = match self.ports.acquire() {
            Ok(lease) => lease,
            Err(err) => return clock.failed(err.to_string()),
        };

        let mut log = Vec::new();
        match self.backend.remove_environment(&name) {
            Ok(true) => {
                self.log.warn(
                    "sandbox.stale_environment_removed",
                    &format!("run_id={} environment={name}", attempt.request.run_id),
                );
                log.push(format!("removed stale environment {name}"));
            }
            Ok(false) => {}
            Err(err) => return clock.failed(format!("stale environment check failed: {err}")),
        }
        if let Some(report) = Self::overran(attempt, &clock, "stale environment check") {
            return report;
        }

        let ecosystem = attempt.request.ecosystem;
        let spec = EnvironmentSpec {
            name: name.clone(),
            image: ecosystem.image(&self.settings.images).to_string(),
            host_port: lease.port(),
            container_port: ecosystem.app_port(),
            network: self.settings.network,
        };
        let timeout = attempt.deadline.bound(self.settings.command_timeout());
        match self.backend.provision(&spec, timeout) {
            Ok(container_id) => {
                log.push(format!(
                    "provisioned {name} ({container_id}) from {} network={} port=127.0.0.1:{}->{}",
                    spec.image, spec.network, spec.host_port, spec.container_port
                ));
                attempt.guard.attach(container_id, lease);
                clock.passed(log.join("\n"))
            }
            Err(err) => {
                log.push(err.to_string());
                PhaseReport {
                    log: log.join("\n"),
                    ..clock.from_backend_error(&err)
                }
            }
        }
    }

    fn inject(&self, attempt: &mut Attempt<'_>) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::Inject);
        let staged = match stage_project(&attempt.request.project_path, &self.staging_root) {
            Ok(staged) => staged,
            Err(err) => return clock.failed(err.to_string()),
        };
        if let Some(report) = Self::overran(attempt, &clock, "staging project files") {
            return report;
        }
        let timeout = attempt.deadline.bound(self.settings.command_timeout());
        if let Err(err) =
            self.backend
                .copy_into(attempt.guard.environment_name(), staged.path(), timeout)
        {
            return clock.from_backend_error(&err);
        }
        let manifest_file = attempt.request.ecosystem.manifest_file();
        attempt.manifest = fs::read_to_string(staged.path().join(manifest_file)).ok();
        let mut log = format!("copied {} files", staged.files().len());
        if !staged.skipped().is_empty() {
            log.push_str(&format!("; skipped {}", staged.skipped().join(", ")));
        }
        attempt.staged = Some(staged);
        clock.passed(log)
    }

    fn apply_change_set(&self, attempt: &mut Attempt<'_>) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::ApplyChangeSet);
        let Some(change_set) = attempt
            .request
            .change_set
            .as_ref()
            .filter(|change_set| !change_set.is_empty())
        else {
            return clock.report(PhaseStatus::Skipped, "no change set");
        };
        let ecosystem = attempt.request.ecosystem;
        let manifest_file = ecosystem.manifest_file();
        let name = attempt.guard.environment_name().to_string();

        let current = match self.backend.read_file(&name, manifest_file) {
            Ok(Some(current)) => current,
            Ok(None) => return clock.failed(format!("{manifest_file} not found in environment")),
            Err(err) => return clock.failed(err.to_string()),
        };
        let rewritten = match ecosystem.rewrite_manifest(&current, change_set) {
            Ok(rewritten) => rewritten,
            Err(err) => return clock.failed(err.to_string()),
        };
        if let Some(report) = Self::overran(attempt, &clock, "reading the manifest") {
            return report;
        }
        if let Err(err) = self.backend.write_file(&name, manifest_file, &rewritten) {
            return clock.failed(err.to_string());
        }
        attempt.manifest = Some(rewritten);
        clock.passed(format!(
            "rewrote {manifest_file}: upgrade={} remove={} keep={}",
            change_set.count_by_action(ChangeAction::Upgrade),
            change_set.count_by_action(ChangeAction::Remove),
            change_set.count_by_action(ChangeAction::Keep)
        ))
    }

    fn exec_phase(
        &self,
        attempt: &Attempt<'_>,
        clock: &PhaseClock,
        script: &str,
        cap: Duration,
    ) -> (PhaseReport, Option<ExecOutput>) {
        let timeout = attempt.deadline.bound(cap);
        match self
            .backend
            .exec(attempt.guard.environment_name(), script, timeout)
        {
            Ok(output) => (clock.from_exec(&output, timeout), Some(output)),
            Err(err) => (clock.failed(err.to_string()), None),
        }
    }

    fn install(&self, attempt: &mut Attempt<'_>) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::Install);
        let script = attempt.request.ecosystem.install_command();
        self.exec_phase(attempt, &clock, script, self.settings.install_timeout())
            .0
    }

    fn app_log_tail(&self, attempt: &Attempt<'_>) -> String {
        let script = format!("tail -c {MAX_PHASE_LOG_BYTES} {APP_LOG_PATH} 2>/dev/null");
        self.backend
            .exec(
                attempt.guard.environment_name(),
                &script,
                attempt.deadline.bound(self.settings.command_timeout()),
            )
            .map(|output| output.stdout)
            .unwrap_or_default()
    }

    fn start(&self, attempt: &mut Attempt<'_>, layout: &ProjectLayout) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::Start);
        let command = attempt.request.ecosystem.start_command(layout);
        let script = format!("{command} > {APP_LOG_PATH} 2>&1 & echo $! > {APP_PID_PATH}");
        if let Err(err) = self
            .backend
            .exec_detached(attempt.guard.environment_name(), &script)
        {
            return clock.failed(format!("failed to launch `{command}`: {err}"));
        }

        let settle = attempt.deadline.bound(self.settings.settle_interval());
        if !settle.is_zero() {
            thread::sleep(settle);
        }

        let check = format!("kill -0 \"$(cat {APP_PID_PATH})\" 2>/dev/null");
        let alive = self
            .backend
            .exec(
                attempt.guard.environment_name(),
                &check,
                attempt.deadline.bound(self.settings.command_timeout()),
            )
            .map(|output| output.success())
            .unwrap_or(false);
        let tail = self.app_log_tail(attempt);
        if alive {
            clock.passed(format!("started `{command}`\n{tail}"))
        } else {
            clock.failed(format!(
                "`{command}` is not running after {}s\n{tail}",
                settle.as_secs()
            ))
        }
    }

    fn health_check(&self, attempt: &mut Attempt<'_>) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::HealthCheck);
        let binary = attempt.request.ecosystem.runtime_binary();
        let (report, _) = self.exec_phase(
            attempt,
            &clock,
            &liveness_script(binary),
            self.settings.command_timeout(),
        );
        if report.status == PhaseStatus::Passed {
            return clock.passed(format!("process matching `{binary}` is running"));
        }
        let tail = self.app_log_tail(attempt);
        PhaseReport {
            log: format!("no process matching `{binary}` found\n{tail}"),
            ..report
        }
    }

    fn test(&self, attempt: &mut Attempt<'_>, layout: &ProjectLayout) -> PhaseReport {
        let clock = PhaseClock::start(SandboxPhase::Test);
        let Some(command) = attempt.request.ecosystem.test_command(layout) else {
            return clock.report(PhaseStatus::Skipped, "no tests declared");
        };
        let (report, output) =
            self.exec_phase(attempt, &clock, &command, self.settings.test_timeout());
        let Some(output) = output else {
            return report;
        };
        let summary = parse_test_summary(&output.combined(), output.exit_code);
        let status = if !output.timed_out && summary.passed_overall() {
            PhaseStatus::Passed
        } else {
            PhaseStatus::Failed
        };
        attempt.test_summary = Some(summary);
        PhaseReport { status, ..report }
    }
}

/// Shell snippet that succeeds when any process command line contains
/// `binary`. The first letter is bracketed so the check never matches itself.
pub fn liveness_script(binary: &str) -> String {
    let mut chars = binary.chars();
    let pattern = match chars.next() {
        Some(first) => format!("[{first}]{}", chars.as_str()),
        None => String::new(),
    };
    format!(
        "for p in /proc/[0-9]*; do tr '\\0' ' ' < \"$p/cmdline\" 2>/dev/null; echo; done | grep -q '{pattern}'"
    )
}

impl ChangeSetValidator for SandboxEngine {
    fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, SandboxError> {
        SandboxEngine::validate(self, request)
    }
}
