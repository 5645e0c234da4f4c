pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;

pub use fs_atomic::{atomic_write_file, atomic_write_json};
pub use ids::{environment_name, generate_run_id, RunId, SessionId};
pub use logging::RuntimeLog;
pub use time::{now_rfc3339, now_secs};
