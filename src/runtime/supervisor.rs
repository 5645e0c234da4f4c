use super::{bootstrap_state_root, CancelToken, RunStore, StatePaths, SupervisorError};
use crate::config::{Settings, MAX_RETRIES_CEILING};
use crate::pipeline::{
    ChangeStager, Collaborators, Diagnoser, EventSink, MigrationRun, Orchestrator, Planner,
    ProjectRef, RunErrorKind, RunStatus, StageName,
};
use crate::sandbox::{ChangeSetValidator, Ecosystem, SandboxEngine};
use crate::shared::{generate_run_id, now_rfc3339, now_secs, RunId, RuntimeLog};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

pub const DEFAULT_TARGET_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub project_path: PathBuf,
    pub ecosystem: Ecosystem,
    /// Falls back to the configured default.
    pub max_retries: Option<u32>,
    pub target_branch: Option<String>,
}

impl RunRequest {
    pub fn new(project_path: impl Into<PathBuf>, ecosystem: Ecosystem) -> Self {
        Self {
            project_path: project_path.into(),
            ecosystem,
            max_retries: None,
            target_branch: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStats {
    pub pool_size: usize,
    pub in_flight: usize,
    pub running: usize,
    pub terminal: usize,
    pub total: usize,
}

struct Job {
    run_id: RunId,
    cancel: CancelToken,
}

struct Shared {
    orchestrator: Orchestrator,
    store: RunStore,
    in_flight: AtomicUsize,
    cancels: Mutex<BTreeMap<RunId, CancelToken>>,
    log: RuntimeLog,
}

impl Shared {
    fn release(&self, run_id: &RunId) {
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts runs and executes each on one of a fixed number of worker
/// threads. A run is only accepted when a worker is free for it.
pub struct RunSupervisor {
    shared: Arc<Shared>,
    pool_size: usize,
    default_max_retries: u32,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RunSupervisor {
    pub fn new(
        orchestrator: Orchestrator,
        pool_size: usize,
        default_max_retries: u32,
        log: RuntimeLog,
    ) -> Self {
        let pool_size = pool_size.max(1);
        let shared = Arc::new(Shared {
            store: orchestrator.store().clone(),
            orchestrator,
            in_flight: AtomicUsize::new(0),
            cancels: Mutex::new(BTreeMap::new()),
            log,
        });
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..pool_size)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                thread::spawn(move || worker_loop(index, &shared, &receiver))
            })
            .collect();
        shared.log.info(
            "supervisor.started",
            format!("pool_size={pool_size} default_max_retries={default_max_retries}"),
        );
        Self {
            shared,
            pool_size,
            default_max_retries,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Wires the Docker-backed sandbox engine, the state root and the runtime
    /// log from `settings`.
    pub fn from_settings(
        settings: &Settings,
        planner: Arc<dyn Planner>,
        diagnoser: Arc<dyn Diagnoser>,
        stager: Arc<dyn ChangeStager>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, SupervisorError> {
        let paths = StatePaths::new(&settings.state_root);
        bootstrap_state_root(&paths)?;
        let log = RuntimeLog::at(paths.runtime_log_path());
        let validator: Arc<dyn ChangeSetValidator> = Arc::new(SandboxEngine::with_docker(
            settings.sandbox.clone(),
            paths.staging_dir(),
            log.clone(),
        ));
        let store = if settings.persist_runs {
            RunStore::mirrored(paths.runs_dir()).with_log(log.clone())
        } else {
            RunStore::in_memory()
        };
        let orchestrator = Orchestrator::new(
            Collaborators {
                planner,
                validator,
                diagnoser,
                stager,
            },
            store,
            sink,
            log.clone(),
        );
        Ok(Self::new(
            orchestrator,
            settings.max_concurrent_runs,
            settings.default_max_retries,
            log,
        ))
    }

    pub fn store(&self) -> &RunStore {
        &self.shared.store
    }

    pub fn start_run(&self, request: RunRequest) -> Result<RunId, SupervisorError> {
        validate_project(&request)?;
        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        if max_retries > MAX_RETRIES_CEILING {
            return Err(SupervisorError::RetriesOutOfRange {
                value: max_retries,
                max: MAX_RETRIES_CEILING,
            });
        }
        let run_id = generate_run_id(now_secs()).map_err(SupervisorError::RunId)?;

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SupervisorError::ShuttingDown)?;
        let pool_size = self.pool_size;
        self.shared
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < pool_size).then_some(current + 1)
            })
            .map_err(|_| SupervisorError::Saturated { pool_size })?;

        let run = MigrationRun::new(
            run_id.clone(),
            ProjectRef {
                path: request.project_path.clone(),
                ecosystem: request.ecosystem,
            },
            request
                .target_branch
                .unwrap_or_else(|| DEFAULT_TARGET_BRANCH.to_string()),
            max_retries,
        );
        if let Err(err) = self.shared.store.insert(run) {
            self.shared.release(&run_id);
            return Err(err.into());
        }

        let cancel = CancelToken::new();
        self.shared
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), cancel.clone());
        if sender
            .send(Job {
                run_id: run_id.clone(),
                cancel,
            })
            .is_err()
        {
            self.shared.release(&run_id);
            return Err(SupervisorError::ShuttingDown);
        }

        self.shared.log.info(
            "supervisor.run_accepted",
            format!(
                "run_id={run_id} ecosystem={} max_retries={max_retries} project={}",
                request.ecosystem,
                request.project_path.display()
            ),
        );
        Ok(run_id)
    }

    /// Read-only snapshot of a run.
    pub fn get_run_status(&self, run_id: &RunId) -> Result<MigrationRun, SupervisorError> {
        self.shared
            .store
            .get(run_id)
            .map_err(|_| SupervisorError::UnknownRun {
                run_id: run_id.to_string(),
            })
    }

    /// Requests cancellation at the next stage boundary. Returns `false` when
    /// the run has already finished.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<bool, SupervisorError> {
        if !self.shared.store.contains(run_id) {
            return Err(SupervisorError::UnknownRun {
                run_id: run_id.to_string(),
            });
        }
        let cancels = self
            .shared
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match cancels.get(run_id) {
            Some(token) => {
                token.cancel();
                self.shared
                    .log
                    .info("supervisor.cancel_requested", format!("run_id={run_id}"));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete_run(&self, run_id: &RunId) -> Result<MigrationRun, SupervisorError> {
        let run = self.shared.store.delete(run_id)?;
        self.shared
            .log
            .info("supervisor.run_deleted", format!("run_id={run_id}"));
        Ok(run)
    }

    pub fn list_runs(&self, limit: usize, offset: usize) -> Vec<MigrationRun> {
        self.shared.store.list(limit, offset)
    }

    pub fn stats(&self) -> SupervisorStats {
        let (running, terminal) = self.shared.store.counts();
        SupervisorStats {
            pool_size: self.pool_size,
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            running,
            terminal,
            total: running + terminal,
        }
    }

    /// Stops accepting runs, cancels the ones in flight and joins the workers.
    /// Runs stop at their next stage boundary.
    pub fn shutdown(&self) {
        let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        drop(sender);
        for token in self
            .shared
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            token.cancel();
        }
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            let _ = handle.join();
        }
        self.shared.log.info("supervisor.stopped", "workers joined");
    }
}

impl Drop for RunSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_project(request: &RunRequest) -> Result<(), SupervisorError> {
    let invalid = |reason: String| SupervisorError::InvalidProject {
        path: request.project_path.clone(),
        reason,
    };
    if !request.project_path.is_dir() {
        return Err(invalid("project path is not a directory".to_string()));
    }
    let manifest = request.ecosystem.manifest_file();
    if !request.project_path.join(manifest).is_file() {
        return Err(invalid(format!(
            "missing {manifest} for ecosystem {}",
            request.ecosystem
        )));
    }
    Ok(())
}

fn worker_loop(index: usize, shared: &Shared, receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = job else {
            break;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            shared.orchestrator.run(&job.run_id, &job.cancel)
        }));
        match outcome {
            Ok(Ok(run)) => shared.log.info(
                "supervisor.run_finished",
                format!("worker={index} run_id={} status={}", run.id, run.status),
            ),
            Ok(Err(err)) => {
                shared.log.error(
                    "supervisor.run_failed",
                    format!("worker={index} run_id={} error={err}", job.run_id),
                );
                abandon_run(shared, &job.run_id, &err.to_string());
            }
            Err(_) => {
                shared.log.error(
                    "supervisor.worker_panicked",
                    format!("worker={index} run_id={}", job.run_id),
                );
                abandon_run(shared, &job.run_id, "orchestrator panicked");
            }
        }
        shared.release(&job.run_id);
    }
}

/// Seals a run the orchestrator could not finish so it never stays in flight.
fn abandon_run(shared: &Shared, run_id: &RunId, reason: &str) {
    let Ok(mut run) = shared.store.get(run_id) else {
        return;
    };
    if run.finished_at.is_some() {
        return;
    }
    let stage = run.stage;
    run.push_error(RunErrorKind::UnexpectedFault, stage, reason);
    run.stage = StageName::End;
    run.status = RunStatus::Error;
    run.touch();
    run.finished_at = Some(now_rfc3339());
    if let Err(err) = shared.store.update(&run) {
        shared.log.error(
            "supervisor.persist_failed",
            format!("run_id={run_id} error={err}"),
        );
    }
}
