use crate::shared::time::now_rfc3339;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Append-only JSON-lines log shared by the supervisor, orchestrator and
/// sandbox engine. Writes are best-effort and never surface errors.
#[derive(Debug, Clone, Default)]
pub struct RuntimeLog {
    path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl RuntimeLog {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, event: &str, message: impl AsRef<str>) {
        self.append("info", event, message.as_ref());
    }

    pub fn warn(&self, event: &str, message: impl AsRef<str>) {
        self.append("warn", event, message.as_ref());
    }

    pub fn error(&self, event: &str, message: impl AsRef<str>) {
        self.append("error", event, message.as_ref());
    }

    pub fn append(&self, level: &str, event: &str, message: &str) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let payload = serde_json::json!({
            "timestamp": now_rfc3339(),
            "level": level,
            "event": event,
            "message": message,
        });
        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempdir().expect("tempdir");
        let log = RuntimeLog::at(dir.path().join("logs/runtime.log"));
        log.info("run.started", "run_id=run-1");
        log.warn("sink.dropped", "run_id=run-1 sequence=2");

        let raw = fs::read_to_string(dir.path().join("logs/runtime.log")).expect("read log");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(second["level"], "warn");
        assert_eq!(second["event"], "sink.dropped");
    }

    #[test]
    fn disabled_log_is_a_no_op() {
        let log = RuntimeLog::disabled();
        log.error("anything", "ignored");
        assert!(log.path().is_none());
    }
}
