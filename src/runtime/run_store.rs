use super::RunStoreError;
use crate::pipeline::MigrationRun;
use crate::shared::{atomic_write_json, RunId, RuntimeLog};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of runs owned by the supervisor and shared with the orchestrator.
///
/// A run is sealed once `finished_at` is set: it can then be read or deleted
/// but never updated again. With a mirror directory every write is also
/// persisted as `<dir>/<run_id>.json`. The in-memory record is authoritative;
/// a failed mirror write is logged as `run_store.mirror_failed` and never
/// rejects the update.
#[derive(Debug, Clone, Default)]
pub struct RunStore {
    runs: Arc<RwLock<BTreeMap<RunId, MigrationRun>>>,
    mirror_dir: Option<PathBuf>,
    log: RuntimeLog,
}

fn is_sealed(run: &MigrationRun) -> bool {
    run.finished_at.is_some()
}

impl RunStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn mirrored(dir: impl Into<PathBuf>) -> Self {
        Self {
            mirror_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: RuntimeLog) -> Self {
        self.log = log;
        self
    }

    pub fn mirror_dir(&self) -> Option<&Path> {
        self.mirror_dir.as_deref()
    }

    pub fn insert(&self, run: MigrationRun) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::Duplicate {
                run_id: run.id.to_string(),
            });
        }
        self.mirror(&run);
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    pub fn get(&self, run_id: &RunId) -> Result<MigrationRun, RunStoreError> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunStoreError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    /// Replaces the stored snapshot of `run`.
    pub fn update(&self, run: &MigrationRun) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = runs.get_mut(&run.id) else {
            return Err(RunStoreError::NotFound {
                run_id: run.id.to_string(),
            });
        };
        if is_sealed(stored) {
            return Err(RunStoreError::Sealed {
                run_id: run.id.to_string(),
            });
        }
        *stored = run.clone();
        self.mirror(run);
        Ok(())
    }

    /// Removes a finished run and its mirrored snapshot.
    pub fn delete(&self, run_id: &RunId) -> Result<MigrationRun, RunStoreError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        match runs.get(run_id) {
            None => {
                return Err(RunStoreError::NotFound {
                    run_id: run_id.to_string(),
                })
            }
            Some(run) if !(run.is_terminal() && is_sealed(run)) => {
                return Err(RunStoreError::NotTerminal {
                    run_id: run_id.to_string(),
                })
            }
            Some(_) => {}
        }
        let removed = runs.remove(run_id).ok_or_else(|| RunStoreError::NotFound {
            run_id: run_id.to_string(),
        })?;
        if let Some(dir) = &self.mirror_dir {
            let path = snapshot_path(dir, run_id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => self.log.warn(
                    "run_store.mirror_failed",
                    format!("run_id={run_id} path={} error={err}", path.display()),
                ),
            }
        }
        Ok(removed)
    }

    /// Newest first, by creation time then id.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<MigrationRun> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let mut ordered: Vec<&MigrationRun> = runs.values().collect();
        ordered.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        ordered
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts of (in progress, finished) runs.
    pub fn counts(&self) -> (usize, usize) {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let finished = runs.values().filter(|run| is_sealed(run)).count();
        (runs.len() - finished, finished)
    }

    fn mirror(&self, run: &MigrationRun) {
        let Some(dir) = &self.mirror_dir else {
            return;
        };
        let path = snapshot_path(dir, &run.id);
        if let Err(err) = atomic_write_json(&path, run) {
            self.log.warn(
                "run_store.mirror_failed",
                format!("run_id={} path={} error={err}", run.id, path.display()),
            );
        }
    }
}

fn snapshot_path(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}
