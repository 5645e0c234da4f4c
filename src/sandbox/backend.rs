use super::SandboxError;
use crate::config::NetworkPolicy;
use std::path::Path;
use std::time::Duration;

pub const WORKDIR: &str = "/app";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub network: NetworkPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: output.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Stdout followed by stderr, the shape captured as phase logs.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Container runtime operations the engine needs. Every method addresses an
/// environment by name; paths are absolute inside the environment.
pub trait SandboxBackend: Send + Sync {
    /// Removes the named environment and anything attached to it. Returns
    /// whether something existed.
    fn remove_environment(&self, name: &str) -> Result<bool, SandboxError>;

    /// Creates and starts the environment, returning the runtime's id for it.
    /// May pull an image, so it is bounded by `timeout`.
    fn provision(&self, spec: &EnvironmentSpec, timeout: Duration)
        -> Result<String, SandboxError>;

    /// Copies the contents of `source` into the working directory.
    fn copy_into(&self, name: &str, source: &Path, timeout: Duration)
        -> Result<(), SandboxError>;

    fn read_file(&self, name: &str, path: &str) -> Result<Option<String>, SandboxError>;

    fn write_file(&self, name: &str, path: &str, contents: &str) -> Result<(), SandboxError>;

    /// Runs a shell script in the working directory and waits for it.
    fn exec(&self, name: &str, script: &str, timeout: Duration)
        -> Result<ExecOutput, SandboxError>;

    /// Starts a shell script in the background and returns immediately.
    fn exec_detached(&self, name: &str, script: &str) -> Result<(), SandboxError>;
}
