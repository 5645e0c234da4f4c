use super::run::StageName;
use crate::runtime::RunStoreError;
use crate::sandbox::SandboxPhase;
use serde::{Deserialize, Serialize};

/// Failure taxonomy recorded on a run. Every stage failure is normalised into
/// one of these at the stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    PlanningFailure,
    SandboxProvisioningFailure,
    InstallFailure,
    StartupFailure,
    HealthCheckFailure,
    TestFailure,
    DiagnosisExhausted,
    StagingFailure,
    UnexpectedFault,
    Cancelled,
}

impl RunErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanningFailure => "planning_failure",
            Self::SandboxProvisioningFailure => "sandbox_provisioning_failure",
            Self::InstallFailure => "install_failure",
            Self::StartupFailure => "startup_failure",
            Self::HealthCheckFailure => "health_check_failure",
            Self::TestFailure => "test_failure",
            Self::DiagnosisExhausted => "diagnosis_exhausted",
            Self::StagingFailure => "staging_failure",
            Self::UnexpectedFault => "unexpected_fault",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SandboxPhase> for RunErrorKind {
    fn from(phase: SandboxPhase) -> Self {
        match phase {
            SandboxPhase::Provision | SandboxPhase::Inject | SandboxPhase::ApplyChangeSet => {
                Self::SandboxProvisioningFailure
            }
            SandboxPhase::Install => Self::InstallFailure,
            SandboxPhase::Start => Self::StartupFailure,
            SandboxPhase::HealthCheck => Self::HealthCheckFailure,
            SandboxPhase::Test => Self::TestFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub stage: StageName,
    /// Validation attempt the error belongs to (retry count at the time).
    pub attempt: u32,
    pub message: String,
}

/// Errors a collaborator reports instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventSinkError {
    #[error("event buffer is full; event {sequence} dropped")]
    Full { sequence: u64 },
    #[error("event receiver disconnected")]
    Disconnected,
    #[error("event sink failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] RunStoreError),
}
