use super::{ConfigError, NetworkPolicy, Settings};
use std::path::{Path, PathBuf};

pub const ENV_RETAIN_SANDBOXES: &str = "DEPSHIFT_RETAIN_SANDBOXES";
pub const ENV_DOCKER_BIN: &str = "DEPSHIFT_DOCKER_BIN";
pub const ENV_STATE_ROOT: &str = "DEPSHIFT_STATE_ROOT";
pub const ENV_SANDBOX_NETWORK: &str = "DEPSHIFT_SANDBOX_NETWORK";

/// Loads settings from YAML, layers environment overrides on top and validates.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let mut settings = Settings::from_path(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;
    settings.validate()?;
    Ok(settings)
}

/// Applies `DEPSHIFT_*` overrides read through `lookup`, so tests can inject
/// values without touching the process environment.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(ENV_RETAIN_SANDBOXES) {
        settings.sandbox.retain_environments = parse_bool(ENV_RETAIN_SANDBOXES, &raw)?;
    }
    if let Some(raw) = lookup(ENV_DOCKER_BIN).filter(|v| !v.trim().is_empty()) {
        settings.sandbox.docker_binary = raw.trim().to_string();
    }
    if let Some(raw) = lookup(ENV_STATE_ROOT).filter(|v| !v.trim().is_empty()) {
        settings.state_root = PathBuf::from(raw.trim());
    }
    if let Some(raw) = lookup(ENV_SANDBOX_NETWORK) {
        settings.sandbox.network =
            NetworkPolicy::parse(&raw).map_err(|_| ConfigError::EnvOverride {
                name: ENV_SANDBOX_NETWORK.to_string(),
                value: raw.clone(),
            })?;
    }
    Ok(())
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            name: name.to_string(),
            value: raw.to_string(),
        }),
    }
}
