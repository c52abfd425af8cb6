use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::{Profile, Shell};

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Everything needed to build an engine, whichever source it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub shell: Shell,
    pub profiles: Vec<Profile>,
    pub docker_host: String,
    /// Directory holding `key.pem`, `cert.pem` and `ca.pem` for TLS connections.
    pub docker_config: Option<PathBuf>,
    pub docker_tls_verify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: Shell::default(),
            profiles: Vec::new(),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            docker_config: None,
            docker_tls_verify: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    shell: String,
    docker_host: String,
    docker_config: Option<PathBuf>,
    docker_tls_verify: bool,
    #[serde(default)]
    profiles: Vec<Profile>,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Loads configuration from `dockbox.{toml,json,yaml}` in the working
    /// directory when present, then `DOCKBOX_*` environment variables.
    pub fn new() -> Result<Self> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::File::with_name("dockbox").required(false)),
        )
    }

    /// Loads configuration from an explicit profiles file, format picked by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_builder(
            config::Config::builder().add_source(config::File::from(path.as_ref())),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let raw: RawConfig = builder
            // Start with defaults
            .set_default("shell", "sh")?
            .set_default("docker_host", DEFAULT_DOCKER_HOST)?
            .set_default("docker_tls_verify", false)?
            // Merge environment variables (DOCKBOX_*), nested keys split on "__"
            .add_source(
                config::Environment::with_prefix("DOCKBOX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        let config = EngineConfig {
            shell: raw.shell.parse()?,
            profiles: raw.profiles,
            docker_host: raw.docker_host,
            docker_config: raw.docker_config,
            docker_tls_verify: raw.docker_tls_verify,
        };
        tracing::debug!(
            "Loaded {} profiles, shell {}, host {}",
            config.profiles.len(),
            config.shell,
            config.docker_host
        );

        Ok(config)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.profile_name == name)
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn shell(mut self, shell: Shell) -> Self {
        self.config.shell = shell;
        self
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.config.profiles.push(profile);
        self
    }

    pub fn profiles(mut self, profiles: impl IntoIterator<Item = Profile>) -> Self {
        self.config.profiles.extend(profiles);
        self
    }

    pub fn docker_host(mut self, host: impl Into<String>) -> Self {
        self.config.docker_host = host.into();
        self
    }

    pub fn docker_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.docker_config = Some(path.into());
        self
    }

    pub fn docker_tls_verify(mut self, verify: bool) -> Self {
        self.config.docker_tls_verify = verify;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
