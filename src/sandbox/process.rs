use super::error::io_error;
use super::SandboxError;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs `binary args..` to completion, killing it once `timeout` elapses.
/// Stdout and stderr are drained on helper threads so a chatty child never
/// blocks on a full pipe.
pub fn run_bounded(
    binary: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ProcessOutput, SandboxError> {
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SandboxError::MissingBinary {
                binary: binary.to_string(),
            })
        }
        Err(err) => return Err(io_error(Path::new(binary), err)),
    };

    let stdout = child.stdout.take().ok_or_else(|| {
        io_error(Path::new(binary), std::io::Error::other("missing stdout pipe"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        io_error(Path::new(binary), std::io::Error::other("missing stderr pipe"))
    })?;

    let stdout_reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = BufReader::new(stdout).read_to_string(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut buf);
        buf
    });

    let start = Instant::now();
    let (exit_code, timed_out) = loop {
        match child.try_wait() {
            Ok(Some(status)) => break (status.code(), false),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let status = child.wait().map_err(|e| io_error(Path::new(binary), e))?;
                    break (status.code(), true);
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(io_error(Path::new(binary), err)),
        }
    };

    Ok(ProcessOutput {
        exit_code,
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_reported() {
        let err = run_bounded(
            "depshift-definitely-not-installed",
            &[],
            Duration::from_secs(1),
        )
        .expect_err("missing binary");
        assert!(matches!(err, SandboxError::MissingBinary { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_and_enforces_timeout() {
        let ok = run_bounded(
            "sh",
            &["-c".to_string(), "echo hi; echo err >&2; exit 3".to_string()],
            Duration::from_secs(5),
        )
        .expect("run sh");
        assert_eq!(ok.exit_code, Some(3));
        assert_eq!(ok.stdout.trim(), "hi");
        assert_eq!(ok.stderr.trim(), "err");

        let slow = run_bounded(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        )
        .expect("run sleep");
        assert!(slow.timed_out);
        assert!(!slow.success());
    }
}
