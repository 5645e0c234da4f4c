pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::{
    apply_env_overrides, load_settings, ENV_DOCKER_BIN, ENV_RETAIN_SANDBOXES,
    ENV_SANDBOX_NETWORK, ENV_STATE_ROOT,
};
pub use settings::{
    EcosystemImages, NetworkPolicy, PortRange, SandboxSettings, Settings, MAX_RETRIES_CEILING,
};
