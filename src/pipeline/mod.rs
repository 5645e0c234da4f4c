//! The migration workflow: Plan, Validate, Diagnose and StageChange.
//!
//! Stage executors turn every collaborator outcome, including panics, into a
//! [`StageResult`]. [`route`] alone decides what runs next, and the
//! [`Orchestrator`] is the only writer of a [`MigrationRun`].

pub mod collaborators;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod routing;
pub mod run;
pub mod stages;

pub use collaborators::{
    ChangeStager, Costed, DeploymentRecord, Diagnoser, Diagnosis, FixSuggestion, Planner,
    ProjectSnapshot,
};
pub use error::{CollaboratorError, EventSinkError, OrchestratorError, RunError, RunErrorKind};
pub use events::{
    ChannelEventSink, EventSink, MemoryEventSink, NullEventSink, ProgressEvent,
    WORKFLOW_END_STAGE, WORKFLOW_START_STAGE,
};
pub use orchestrator::{Collaborators, Orchestrator};
pub use routing::{route, Route};
pub use run::{MigrationRun, ProjectRef, RunStatus, StageName};
pub use stages::{
    execute_diagnose, execute_plan, execute_stage_change, execute_validate, StageOutcome,
    StagePayload, StageResult,
};
