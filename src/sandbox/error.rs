use crate::changeset::ManifestError;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("container runtime binary `{binary}` is not installed")]
    MissingBinary { binary: String },
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("unsupported ecosystem `{0}` (expected node or python)")]
    UnsupportedEcosystem(String),
    #[error("invalid project at {path}: {reason}")]
    InvalidProject { path: String, reason: String },
    #[error("no free host port in {start}..{end}")]
    PortsExhausted { start: u16, end: u16 },
    #[error("run `{run_id}` already has a live sandbox session")]
    SessionAlreadyLive { run_id: String },
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("sandbox backend error: {0}")]
    Backend(String),
}

pub(crate) fn io_error(path: &std::path::Path, source: std::io::Error) -> SandboxError {
    SandboxError::Io {
        path: path.display().to_string(),
        source,
    }
}
