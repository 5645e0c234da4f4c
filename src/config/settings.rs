use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_RETRIES_CEILING: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// Dedicated per-session network: no reachability to other sandboxes,
    /// registry egress still allowed for installs.
    #[default]
    Isolated,
    /// The container runtime's shared default bridge.
    Bridge,
    /// No network at all; installs must be satisfiable offline.
    None,
}

impl NetworkPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Bridge => "bridge",
            Self::None => "none",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(Self::Isolated),
            "bridge" => Ok(Self::Bridge),
            "none" => Ok(Self::None),
            _ => Err("network must be one of: isolated, bridge, none".to_string()),
        }
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 41000,
            end: 41200,
        }
    }
}

impl PortRange {
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EcosystemImages {
    #[serde(default = "default_node_image")]
    pub node: String,
    #[serde(default = "default_python_image")]
    pub python: String,
}

impl Default for EcosystemImages {
    fn default() -> Self {
        Self {
            node: default_node_image(),
            python: default_python_image(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SandboxSettings {
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default)]
    pub retain_environments: bool,
    #[serde(default)]
    pub network: NetworkPolicy,
    #[serde(default = "default_validate_timeout_seconds")]
    pub validate_timeout_seconds: u64,
    #[serde(default = "default_install_timeout_seconds")]
    pub install_timeout_seconds: u64,
    #[serde(default = "default_test_timeout_seconds")]
    pub test_timeout_seconds: u64,
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_settle_seconds")]
    pub settle_seconds: u64,
    #[serde(default)]
    pub host_port_range: PortRange,
    #[serde(default)]
    pub images: EcosystemImages,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            retain_environments: false,
            network: NetworkPolicy::default(),
            validate_timeout_seconds: default_validate_timeout_seconds(),
            install_timeout_seconds: default_install_timeout_seconds(),
            test_timeout_seconds: default_test_timeout_seconds(),
            command_timeout_seconds: default_command_timeout_seconds(),
            settle_seconds: default_settle_seconds(),
            host_port_range: PortRange::default(),
            images: EcosystemImages::default(),
            name_prefix: default_name_prefix(),
        }
    }
}

impl SandboxSettings {
    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_seconds)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_seconds)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_true")]
    pub persist_runs: bool,
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            max_concurrent_runs: default_max_concurrent_runs(),
            default_max_retries: default_max_retries(),
            event_buffer: default_event_buffer(),
            persist_runs: true,
            sandbox: SandboxSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`state_root` must be non-empty".to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Settings(
                "`max_concurrent_runs` must be at least 1".to_string(),
            ));
        }
        if self.default_max_retries > MAX_RETRIES_CEILING {
            return Err(ConfigError::Settings(format!(
                "`default_max_retries` must be <= {MAX_RETRIES_CEILING}"
            )));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Settings(
                "`event_buffer` must be at least 1".to_string(),
            ));
        }

        let sandbox = &self.sandbox;
        if sandbox.docker_binary.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`sandbox.docker_binary` must be non-empty".to_string(),
            ));
        }
        if sandbox.validate_timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "`sandbox.validate_timeout_seconds` must be greater than zero".to_string(),
            ));
        }
        if sandbox.host_port_range.is_empty() {
            return Err(ConfigError::Settings(
                "`sandbox.host_port_range` must contain at least one port".to_string(),
            ));
        }
        if sandbox.host_port_range.len() < self.max_concurrent_runs {
            return Err(ConfigError::Settings(format!(
                "`sandbox.host_port_range` holds {} ports but `max_concurrent_runs` is {}",
                sandbox.host_port_range.len(),
                self.max_concurrent_runs
            )));
        }
        crate::shared::ids::validate_identifier_value("sandbox.name_prefix", &sandbox.name_prefix)
            .map_err(ConfigError::Settings)?;
        Ok(())
    }
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".depshift")
}

fn default_max_concurrent_runs() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_validate_timeout_seconds() -> u64 {
    900
}

fn default_install_timeout_seconds() -> u64 {
    600
}

fn default_test_timeout_seconds() -> u64 {
    600
}

fn default_command_timeout_seconds() -> u64 {
    60
}

fn default_settle_seconds() -> u64 {
    5
}

fn default_node_image() -> String {
    "node:18-alpine".to_string()
}

fn default_python_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_name_prefix() -> String {
    "depshift".to_string()
}
