//! Disposable execution environments that prove or disprove a change set.
//!
//! One [`SandboxEngine::validate`] call owns exactly one environment from
//! provision to teardown. Phases run in a fixed order and the first failure
//! stops the attempt; teardown happens on every exit path through
//! [`SessionGuard`].

pub mod backend;
pub mod docker;
pub mod ecosystem;
pub mod engine;
mod error;
pub mod evidence;
pub mod inject;
pub mod ports;
pub mod process;
pub mod session;
pub mod verdict;

pub use backend::{EnvironmentSpec, ExecOutput, SandboxBackend, WORKDIR};
pub use docker::DockerCli;
pub use ecosystem::{Ecosystem, ProjectLayout};
pub use engine::{
    liveness_script, ChangeSetValidator, SandboxEngine, ValidationRequest, APP_LOG_PATH,
    APP_PID_PATH,
};
pub use error::SandboxError;
pub use evidence::{parse_test_summary, TestFramework, TestSummary};
pub use inject::{stage_project, StagedProject, DENYLISTED_DIRS};
pub use ports::{PortAllocator, PortLease};
pub use session::{RetainedEnvironment, SandboxSession, SessionGuard, SessionState};
pub use verdict::{PhaseLog, PhaseReport, PhaseStatus, SandboxPhase, ValidationVerdict};
