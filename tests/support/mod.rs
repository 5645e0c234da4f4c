#![allow(dead_code)]

use depshift::changeset::{ChangeAction, ChangeSet, DependencyChange, DependencyEdit};
use depshift::config::{PortRange, SandboxSettings};
use depshift::pipeline::{
    ChangeStager, CollaboratorError, Collaborators, Costed, DeploymentRecord, Diagnoser,
    Diagnosis, EventSink, EventSinkError, FixSuggestion, MigrationRun, Orchestrator, Planner,
    ProgressEvent, ProjectRef, ProjectSnapshot,
};
use depshift::runtime::RunStore;
use depshift::sandbox::{
    ChangeSetValidator, Ecosystem, EnvironmentSpec, ExecOutput, PhaseLog, PhaseReport,
    PhaseStatus, PortAllocator, SandboxBackend, SandboxEngine, SandboxError, SandboxPhase,
    SessionState, ValidationRequest, ValidationVerdict,
};
use depshift::shared::{RunId, RuntimeLog, SessionId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub fn run_id(raw: &str) -> RunId {
    RunId::parse(raw).expect("valid run id")
}

pub fn write_file(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, body).expect("write file");
}

pub const EXPRESS_APP_NO_TESTS: &str = r#"{
  "name": "shop",
  "version": "1.0.0",
  "main": "server.js",
  "scripts": {
    "start": "node server.js",
    "test": "echo \"Error: no test specified\" && exit 1"
  },
  "dependencies": {
    "express": "4.17.1",
    "left-pad": "1.3.0"
  }
}
"#;

pub const EXPRESS_APP_WITH_TESTS: &str = r#"{
  "name": "shop",
  "version": "1.0.0",
  "scripts": {
    "start": "node server.js",
    "test": "jest"
  },
  "dependencies": {
    "express": "4.17.1"
  },
  "devDependencies": {
    "jest": "29.0.0"
  }
}
"#;

pub fn node_project(root: &Path, package_json: &str) {
    write_file(root, "package.json", package_json);
    write_file(root, "server.js", "require('express')().listen(3000);\n");
}

pub fn upgrade(name: &str, from: &str, to: &str) -> ChangeSet {
    ChangeSet::new().with_dependency(name, DependencyChange::upgrade(from, to))
}

// ---- sandbox backend ----

/// What the scripted backend answers for each kind of command.
#[derive(Debug, Clone)]
pub struct Script {
    pub provision_error: Option<String>,
    pub install: ExecOutput,
    pub alive: bool,
    pub healthy: bool,
    pub tests: ExecOutput,
    pub app_log: String,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            provision_error: None,
            install: ExecOutput::ok("added 57 packages in 2s"),
            alive: true,
            healthy: true,
            tests: ExecOutput::ok("Tests:       4 passed, 4 total"),
            app_log: "listening on 3000".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct BackendState {
    environments: BTreeMap<String, BTreeMap<String, String>>,
    stale: BTreeSet<String>,
    removed: Vec<String>,
    provisioned: Vec<EnvironmentSpec>,
    scripts: Vec<String>,
}

/// In-memory container runtime. Files copied in are kept per environment so
/// manifest rewrites can be inspected.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    state: Mutex<BackendState>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            state: Mutex::new(BackendState::default()),
        })
    }

    pub fn with_stale_environment(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.state
            .lock()
            .expect("state")
            .stale
            .insert(name.to_string());
        self
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().expect("state").removed.clone()
    }

    pub fn provisioned(&self) -> Vec<EnvironmentSpec> {
        self.state.lock().expect("state").provisioned.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state.lock().expect("state").scripts.clone()
    }

    pub fn live_environments(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("state")
            .environments
            .keys()
            .cloned()
            .collect()
    }

    pub fn file(&self, environment: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .expect("state")
            .environments
            .get(environment)
            .and_then(|files| files.get(path).cloned())
    }

    pub fn files(&self, environment: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("state")
            .environments
            .get(environment)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    for entry in fs::read_dir(dir).expect("read staged dir") {
        let path = entry.expect("entry").path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("relative")
                .to_string_lossy()
                .replace('\\', "/");
            out.insert(relative, fs::read_to_string(&path).unwrap_or_default());
        }
    }
}

impl SandboxBackend for ScriptedBackend {
    fn remove_environment(&self, name: &str) -> Result<bool, SandboxError> {
        let mut state = self.state.lock().expect("state");
        let existed = state.environments.remove(name).is_some() | state.stale.remove(name);
        state.removed.push(name.to_string());
        Ok(existed)
    }

    fn provision(
        &self,
        spec: &EnvironmentSpec,
        _timeout: Duration,
    ) -> Result<String, SandboxError> {
        if let Some(err) = self.script.lock().expect("script").provision_error.clone() {
            return Err(SandboxError::Backend(err));
        }
        let mut state = self.state.lock().expect("state");
        state.environments.insert(spec.name.clone(), BTreeMap::new());
        state.provisioned.push(spec.clone());
        Ok(format!("cid-{}", spec.name))
    }

    fn copy_into(
        &self,
        name: &str,
        source: &Path,
        _timeout: Duration,
    ) -> Result<(), SandboxError> {
        let mut files = BTreeMap::new();
        collect_files(source, source, &mut files);
        let mut state = self.state.lock().expect("state");
        let environment = state
            .environments
            .get_mut(name)
            .ok_or_else(|| SandboxError::Backend(format!("no environment {name}")))?;
        environment.extend(files);
        Ok(())
    }

    fn read_file(&self, name: &str, path: &str) -> Result<Option<String>, SandboxError> {
        Ok(self.file(name, path))
    }

    fn write_file(&self, name: &str, path: &str, contents: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().expect("state");
        let environment = state
            .environments
            .get_mut(name)
            .ok_or_else(|| SandboxError::Backend(format!("no environment {name}")))?;
        environment.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn exec(
        &self,
        _name: &str,
        script: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        self.state
            .lock()
            .expect("state")
            .scripts
            .push(script.to_string());
        let answers = self.script.lock().expect("script").clone();
        let output = if script.contains("npm install") || script.contains("pip install") {
            answers.install
        } else if script.contains("kill -0") {
            if answers.alive {
                ExecOutput::ok("")
            } else {
                ExecOutput::failed(1, "")
            }
        } else if script.contains("tail -c") {
            ExecOutput::ok(answers.app_log)
        } else if script.contains("/proc/") {
            if answers.healthy {
                ExecOutput::ok("")
            } else {
                ExecOutput::failed(1, "")
            }
        } else if script.contains("npm test") || script.contains("python -m") {
            answers.tests
        } else {
            ExecOutput::ok("")
        };
        Ok(output)
    }

    fn exec_detached(&self, _name: &str, script: &str) -> Result<(), SandboxError> {
        self.state
            .lock()
            .expect("state")
            .scripts
            .push(script.to_string());
        Ok(())
    }
}

pub fn sandbox_settings() -> SandboxSettings {
    SandboxSettings {
        settle_seconds: 0,
        validate_timeout_seconds: 60,
        host_port_range: PortRange {
            start: 47100,
            end: 47110,
        },
        ..SandboxSettings::default()
    }
}

pub fn engine_with(
    backend: &Arc<ScriptedBackend>,
    settings: SandboxSettings,
    staging_root: &Path,
) -> SandboxEngine {
    let ports = PortAllocator::without_host_check(settings.host_port_range);
    let backend: Arc<dyn SandboxBackend> = backend.clone();
    SandboxEngine::new(
        settings,
        backend,
        ports,
        staging_root.to_path_buf(),
        RuntimeLog::disabled(),
    )
}

pub fn request(
    run: &str,
    attempt: u32,
    project: &Path,
    ecosystem: Ecosystem,
    change_set: Option<ChangeSet>,
) -> ValidationRequest {
    ValidationRequest {
        run_id: run_id(run),
        attempt,
        project_path: project.to_path_buf(),
        ecosystem,
        change_set,
    }
}

// ---- pipeline collaborators ----

pub fn verdict(attempt: u32, failed_at: Option<SandboxPhase>) -> ValidationVerdict {
    let mut phases = PhaseLog::new();
    for phase in SandboxPhase::ALL {
        let status = match failed_at {
            Some(failed) if phase == failed => PhaseStatus::Failed,
            Some(failed) if phase > failed => break,
            _ if phase == SandboxPhase::Test => PhaseStatus::Skipped,
            _ => PhaseStatus::Passed,
        };
        let log = if status == PhaseStatus::Failed {
            format!(
                "attempt {attempt}\nError: Cannot find module 'left-pad'\n    at Module._resolveFilename"
            )
        } else {
            format!("{phase} ok")
        };
        phases.record(PhaseReport {
            phase,
            status,
            log,
            exit_code: None,
            timed_out: false,
            duration_ms: 1,
        });
    }
    let name = format!("depshift-run-a{attempt}");
    let mut verdict = ValidationVerdict::assemble(
        SessionId::parse(&name).expect("session id"),
        name,
        attempt,
        Ecosystem::Node,
        phases,
        None,
    );
    verdict.final_state = SessionState::TornDown;
    verdict
}

pub struct StaticPlanner {
    pub change_set: ChangeSet,
    pub cost_usd: f64,
}

impl Planner for StaticPlanner {
    fn plan(&self, _project: &ProjectSnapshot) -> Result<Costed<ChangeSet>, CollaboratorError> {
        Ok(Costed::with_cost(self.change_set.clone(), self.cost_usd))
    }
}

pub struct FailingPlanner;

impl Planner for FailingPlanner {
    fn plan(&self, _project: &ProjectSnapshot) -> Result<Costed<ChangeSet>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("planner offline".to_string()))
    }
}

/// Answers each validation from a queue of outcomes, then repeats `fallback`.
/// `None` is a passing verdict, `Some(phase)` fails at that phase.
pub struct ScriptedValidator {
    outcomes: Mutex<VecDeque<Option<SandboxPhase>>>,
    fallback: Option<SandboxPhase>,
    requests: Mutex<Vec<ValidationRequest>>,
}

impl ScriptedValidator {
    pub fn new(outcomes: Vec<Option<SandboxPhase>>, fallback: Option<SandboxPhase>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn always_passing() -> Arc<Self> {
        Self::new(Vec::new(), None)
    }

    pub fn always_failing(phase: SandboxPhase) -> Arc<Self> {
        Self::new(Vec::new(), Some(phase))
    }

    pub fn requests(&self) -> Vec<ValidationRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl ChangeSetValidator for ScriptedValidator {
    fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, SandboxError> {
        self.requests.lock().expect("requests").push(request.clone());
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes")
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(verdict(request.attempt, outcome))
    }
}

pub struct PanickingValidator;

impl ChangeSetValidator for PanickingValidator {
    fn validate(&self, _request: &ValidationRequest) -> Result<ValidationVerdict, SandboxError> {
        panic!("container runtime exploded");
    }
}

/// Blocks every validation until `release` is called.
pub struct GatedValidator {
    gate: Arc<(Mutex<bool>, Condvar)>,
    entered: AtomicUsize,
}

impl GatedValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new((Mutex::new(false), Condvar::new())),
            entered: AtomicUsize::new(0),
        })
    }

    pub fn release(&self) {
        let (open, signal) = &*self.gate;
        *open.lock().expect("gate") = true;
        signal.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn wait_until_entered(&self, count: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while self.entered() < count {
            assert!(
                std::time::Instant::now() < deadline,
                "validator was never entered"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl ChangeSetValidator for GatedValidator {
    fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, SandboxError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let (open, signal) = &*self.gate;
        let mut guard = open.lock().expect("gate");
        while !*guard {
            guard = signal.wait(guard).expect("gate wait");
        }
        Ok(verdict(request.attempt, None))
    }
}

pub fn pin_suggestion(priority: u32, name: &str, version: &str) -> FixSuggestion {
    FixSuggestion {
        priority,
        description: format!("pin {name} to {version}"),
        edit: Some(DependencyEdit {
            name: name.to_string(),
            action: ChangeAction::Upgrade,
            target_version: Some(version.to_string()),
        }),
    }
}

/// Always claims to have a fix; each call pins `left-pad` to a new version.
pub struct AlwaysFixDiagnoser {
    pub cost_usd: f64,
    calls: AtomicUsize,
}

impl AlwaysFixDiagnoser {
    pub fn new(cost_usd: f64) -> Arc<Self> {
        Arc::new(Self {
            cost_usd,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Diagnoser for AlwaysFixDiagnoser {
    fn diagnose(
        &self,
        _verdict: &ValidationVerdict,
        _change_set: &ChangeSet,
    ) -> Result<Costed<Diagnosis>, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Costed::with_cost(
            Diagnosis {
                category: "dependency_conflict".to_string(),
                root_cause: "left-pad removed from the dependency tree".to_string(),
                suggestions: vec![pin_suggestion(1, "left-pad", &format!("1.3.{call}"))],
                confidence: 0.9,
            },
            self.cost_usd,
        ))
    }
}

pub struct NoFixDiagnoser {
    calls: AtomicUsize,
}

impl NoFixDiagnoser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Diagnoser for NoFixDiagnoser {
    fn diagnose(
        &self,
        _verdict: &ValidationVerdict,
        _change_set: &ChangeSet,
    ) -> Result<Costed<Diagnosis>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Costed::free(Diagnosis {
            category: "unknown".to_string(),
            root_cause: String::new(),
            suggestions: Vec::new(),
            confidence: 0.1,
        }))
    }
}

pub struct RecordingStager {
    fail: bool,
    calls: Mutex<Vec<ChangeSet>>,
}

impl RecordingStager {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn staged(&self) -> Vec<ChangeSet> {
        self.calls.lock().expect("calls").clone()
    }
}

impl ChangeStager for RecordingStager {
    fn stage(
        &self,
        project: &ProjectSnapshot,
        change_set: &ChangeSet,
        _verdict: &ValidationVerdict,
    ) -> Result<Costed<DeploymentRecord>, CollaboratorError> {
        self.calls.lock().expect("calls").push(change_set.clone());
        if self.fail {
            return Err(CollaboratorError::Failed("push rejected".to_string()));
        }
        Ok(Costed::free(DeploymentRecord {
            branch: format!("depshift/{}", project.target_branch),
            change_request: "https://git.example.test/shop/pull/7".to_string(),
        }))
    }
}

pub struct FailingSink;

impl EventSink for FailingSink {
    fn emit(&self, _event: &ProgressEvent) -> Result<(), EventSinkError> {
        Err(EventSinkError::Other("observer went away".to_string()))
    }
}

pub fn collaborators(
    planner: Arc<dyn Planner>,
    validator: Arc<dyn ChangeSetValidator>,
    diagnoser: Arc<dyn Diagnoser>,
    stager: Arc<dyn ChangeStager>,
) -> Collaborators {
    Collaborators {
        planner,
        validator,
        diagnoser,
        stager,
    }
}

pub fn default_planner() -> Arc<StaticPlanner> {
    Arc::new(StaticPlanner {
        change_set: upgrade("express", "4.17.1", "4.19.2"),
        cost_usd: 0.02,
    })
}

pub fn orchestrator(collaborators: Collaborators, sink: Arc<dyn EventSink>) -> Orchestrator {
    Orchestrator::new(collaborators, RunStore::in_memory(), sink, RuntimeLog::disabled())
}

pub fn seed_run(orchestrator: &Orchestrator, id: &str, max_retries: u32) -> RunId {
    let run = MigrationRun::new(
        run_id(id),
        ProjectRef {
            path: PathBuf::from("/srv/projects/shop"),
            ecosystem: Ecosystem::Node,
        },
        "main".to_string(),
        max_retries,
    );
    let id = run.id.clone();
    orchestrator.store().insert(run).expect("insert run");
    id
}
