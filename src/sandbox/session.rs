use super::backend::SandboxBackend;
use super::ports::PortLease;
use super::SandboxError;
use crate::shared::{RunId, RuntimeLog, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Provisioned,
    FilesInjected,
    ChangeSetApplied,
    DependenciesInstalled,
    Started,
    HealthChecked,
    Tested,
    Failed { reason: String },
    TornDown,
    Retained,
}

impl SessionState {
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use SessionState::*;
        if matches!(next, Failed { .. }) {
            return !self.is_terminal() && !matches!(self, Failed { .. });
        }
        matches!(
            (self, next),
            (Created, Provisioned)
                | (Provisioned, FilesInjected)
                | (FilesInjected, ChangeSetApplied)
                | (FilesInjected, DependenciesInstalled)
                | (ChangeSetApplied, DependenciesInstalled)
                | (DependenciesInstalled, Started)
                | (Started, HealthChecked)
                | (HealthChecked, Tested)
                | (Tested, TornDown)
                | (Tested, Retained)
                | (Failed { .. }, TornDown)
                | (Failed { .. }, Retained)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::TornDown | SessionState::Retained)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Provisioned => "provisioned",
            SessionState::FilesInjected => "files_injected",
            SessionState::ChangeSetApplied => "change_set_applied",
            SessionState::DependenciesInstalled => "dependencies_installed",
            SessionState::Started => "started",
            SessionState::HealthChecked => "health_checked",
            SessionState::Tested => "tested",
            SessionState::Failed { .. } => "failed",
            SessionState::TornDown => "torn_down",
            SessionState::Retained => "retained",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed { reason } => write!(f, "failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Where a retained environment can be reached for manual inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedEnvironment {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: SessionId,
    pub run_id: RunId,
    pub attempt: u32,
    pub environment_name: String,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub host_port: Option<u16>,
    pub state: SessionState,
    #[serde(default)]
    pub history: Vec<SessionState>,
}

impl SandboxSession {
    pub fn new(id: SessionId, run_id: RunId, attempt: u32, environment_name: String) -> Self {
        Self {
            id,
            run_id,
            attempt,
            environment_name,
            container_id: None,
            host_port: None,
            state: SessionState::Created,
            history: vec![SessionState::Created],
        }
    }
}

/// Owns a live session and guarantees it reaches `TornDown` or `Retained`,
/// whether the caller finishes normally, returns early, or unwinds.
pub struct SessionGuard {
    backend: Arc<dyn SandboxBackend>,
    session: SandboxSession,
    lease: Option<PortLease>,
    retain: bool,
    retained: Option<RetainedEnvironment>,
    log: RuntimeLog,
}

impl SessionGuard {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        session: SandboxSession,
        retain: bool,
        log: RuntimeLog,
    ) -> Self {
        Self {
            backend,
            session,
            lease: None,
            retain,
            retained: None,
            log,
        }
    }

    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    pub fn state(&self) -> &SessionState {
        &self.session.state
    }

    pub fn environment_name(&self) -> &str {
        &self.session.environment_name
    }

    /// Records the provisioned environment; the lease is held until teardown.
    pub fn attach(&mut self, container_id: String, lease: PortLease) {
        self.session.host_port = Some(lease.port());
        self.session.container_id = Some(container_id);
        self.lease = Some(lease);
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SandboxError> {
        if !self.session.state.can_transition_to(&next) {
            return Err(SandboxError::InvalidTransition {
                from: self.session.state.to_string(),
                to: next.to_string(),
            });
        }
        self.session.history.push(next.clone());
        self.session.state = next;
        Ok(())
    }

    /// Marks the session failed. A no-op once failed or finished.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let next = SessionState::Failed {
            reason: reason.into(),
        };
        if self.session.state.can_transition_to(&next) {
            self.session.history.push(next.clone());
            self.session.state = next;
        }
    }

    /// Removes or retains the environment. Safe to call any number of times;
    /// later calls return the first call's outcome.
    pub fn teardown(&mut self) -> Option<RetainedEnvironment> {
        if self.session.state.is_terminal() {
            return self.retained.clone();
        }
        if !matches!(
            self.session.state,
            SessionState::Tested | SessionState::Failed { .. }
        ) {
            self.fail(format!(
                "session abandoned in state {}",
                self.session.state.name()
            ));
        }

        let provisioned = self.session.container_id.is_some();
        if self.retain && provisioned {
            let port = self.lease.take().map(PortLease::retain);
            let address = port
                .map(|port| format!("http://127.0.0.1:{port}"))
                .unwrap_or_default();
            let retained = RetainedEnvironment {
                name: self.session.environment_name.clone(),
                address,
            };
            self.log.info(
                "sandbox.retained",
                &format!(
                    "run_id={} session={} address={}",
                    self.session.run_id, self.session.id, retained.address
                ),
            );
            self.retained = Some(retained);
            self.finish(SessionState::Retained);
            return self.retained.clone();
        }

        // also covers half-created environments left by a failed provision
        match self.backend.remove_environment(&self.session.environment_name) {
            Ok(_) => self.log.info(
                "sandbox.torn_down",
                &format!(
                    "run_id={} session={}",
                    self.session.run_id, self.session.id
                ),
            ),
            Err(err) => self.log.warn(
                "sandbox.teardown_failed",
                &format!(
                    "run_id={} session={} error={}",
                    self.session.run_id, self.session.id, err
                ),
            ),
        }
        self.lease = None;
        self.finish(SessionState::TornDown);
        None
    }

    fn finish(&mut self, terminal: SessionState) {
        self.session.history.push(terminal.clone());
        self.session.state = terminal;
    }

    pub fn into_session(mut self) -> SandboxSession {
        self.teardown();
        self.session.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.teardown();
    }
}
