use super::backend::{EnvironmentSpec, ExecOutput, SandboxBackend, WORKDIR};
use super::error::io_error;
use super::process::{run_bounded, ProcessOutput};
use super::SandboxError;
use crate::config::{NetworkPolicy, SandboxSettings};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const SESSION_LABEL: &str = "depshift.session";

/// [`SandboxBackend`] driving the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(settings.docker_binary.clone(), settings.command_timeout())
    }

    fn network_name(environment: &str) -> String {
        format!("{environment}-net")
    }

    fn run(&self, args: Vec<String>, timeout: Duration) -> Result<ProcessOutput, SandboxError> {
        run_bounded(&self.binary, &args, timeout)
    }

    fn run_checked(&self, args: Vec<String>) -> Result<String, SandboxError> {
        self.run_checked_within(args, self.command_timeout)
    }

    fn run_checked_within(
        &self,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        let output = self.run(args, timeout)?;
        if output.timed_out {
            return Err(SandboxError::Timeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if !output.success() {
            return Err(SandboxError::CommandFailed {
                command,
                exit_code: output.exit_code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn in_workdir(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{WORKDIR}/{path}")
    }
}

impl SandboxBackend for DockerCli {
    fn remove_environment(&self, name: &str) -> Result<bool, SandboxError> {
        let inspect = self.run(
            args(&["container", "inspect", "--format", "{{.Id}}", name]),
            self.command_timeout,
        )?;
        let existed = inspect.success();
        if existed {
            self.run_checked(args(&["rm", "-f", name]))?;
        }
        // network may or may not exist depending on the policy it was created with
        let _ = self.run(
            args(&["network", "rm", &Self::network_name(name)]),
            self.command_timeout,
        )?;
        Ok(existed)
    }

    fn provision(
        &self,
        spec: &EnvironmentSpec,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        // --init reaps exited app processes so pid checks see them disappear
        let mut run_args = args(&["run", "-d", "--init", "--name", &spec.name, "-w", WORKDIR]);
        run_args.push("--label".to_string());
        run_args.push(format!("{SESSION_LABEL}={}", spec.name));
        match spec.network {
            NetworkPolicy::Isolated => {
                let network = Self::network_name(&spec.name);
                self.run_checked_within(args(&["network", "create", &network]), timeout)?;
                run_args.push("--network".to_string());
                run_args.push(network);
            }
            NetworkPolicy::Bridge => {
                run_args.push("--network".to_string());
                run_args.push("bridge".to_string());
            }
            NetworkPolicy::None => {
                run_args.push("--network".to_string());
                run_args.push("none".to_string());
            }
        }
        if spec.network != NetworkPolicy::None {
            run_args.push("-p".to_string());
            run_args.push(format!(
                "127.0.0.1:{}:{}",
                spec.host_port, spec.container_port
            ));
        }
        run_args.push(spec.image.clone());
        run_args.extend(args(&["tail", "-f", "/dev/null"]));

        let stdout = self.run_checked_within(run_args, timeout)?;
        Ok(stdout.trim().chars().take(12).collect())
    }

    fn copy_into(&self, name: &str, source: &Path, timeout: Duration) -> Result<(), SandboxError> {
        let source = format!("{}/.", source.display());
        self.run_checked_within(args(&["cp", &source, &format!("{name}:{WORKDIR}")]), timeout)?;
        Ok(())
    }

    fn read_file(&self, name: &str, path: &str) -> Result<Option<String>, SandboxError> {
        let output = self.run(
            args(&["exec", name, "cat", &in_workdir(path)]),
            self.command_timeout,
        )?;
        Ok(output.success().then_some(output.stdout))
    }

    fn write_file(&self, name: &str, path: &str, contents: &str) -> Result<(), SandboxError> {
        let mut staged = tempfile::NamedTempFile::new()
            .map_err(|e| io_error(Path::new("<tempfile>"), e))?;
        let source = staged.path().display().to_string();
        staged
            .write_all(contents.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(|e| io_error(Path::new(&source), e))?;
        self.run_checked(args(&["cp", &source, &format!("{name}:{}", in_workdir(path))]))?;
        Ok(())
    }

    fn exec(
        &self,
        name: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let output = self.run(args(&["exec", "-w", WORKDIR, name, "sh", "-c", script]), timeout)?;
        Ok(ExecOutput {
            exit_code: output.exit_code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
        })
    }

    fn exec_detached(&self, name: &str, script: &str) -> Result<(), SandboxError> {
        self.run_checked(args(&["exec", "-d", "-w", WORKDIR, name, "sh", "-c", script]))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_inside_workdir() {
        assert_eq!(in_workdir("package.json"), "/app/package.json");
        assert_eq!(in_workdir("/tmp/app.log"), "/tmp/app.log");
    }

    #[test]
    fn missing_docker_binary_surfaces_as_missing_binary() {
        let docker = DockerCli::new("depshift-no-such-docker", Duration::from_secs(1));
        let err = docker
            .remove_environment("depshift-x-a0")
            .expect_err("binary missing");
        assert!(matches!(err, SandboxError::MissingBinary { .. }));
    }
}
