pub mod cancel;
pub mod error;
pub mod run_store;
pub mod state_paths;
pub mod supervisor;

pub use cancel::CancelToken;
pub use error::{RunStoreError, SupervisorError};
pub use run_store::RunStore;
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use supervisor::{
    RunRequest, RunSupervisor, SupervisorStats, DEFAULT_TARGET_BRANCH,
};
