use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    #[error("run `{run_id}` not found")]
    NotFound { run_id: String },
    #[error("run `{run_id}` already exists")]
    Duplicate { run_id: String },
    #[error("run `{run_id}` is finished and can no longer be modified")]
    Sealed { run_id: String },
    #[error("run `{run_id}` is still in progress")]
    NotTerminal { run_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker pool is saturated ({pool_size} runs in flight)")]
    Saturated { pool_size: usize },
    #[error("invalid project {path}: {reason}")]
    InvalidProject { path: PathBuf, reason: String },
    #[error("max_retries {value} exceeds the ceiling of {max}")]
    RetriesOutOfRange { value: u32, max: u32 },
    #[error("unknown run `{run_id}`")]
    UnknownRun { run_id: String },
    #[error("failed to allocate run id: {0}")]
    RunId(String),
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] RunStoreError),
}
