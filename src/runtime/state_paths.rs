use super::SupervisorError;
use crate::shared::RunId;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![self.logs_dir(), self.runs_dir(), self.staging_dir()]
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.logs_dir().join("runtime.log")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_snapshot_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    /// Scratch space for project copies handed to sandbox sessions.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), SupervisorError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| SupervisorError::CreateDir {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}
