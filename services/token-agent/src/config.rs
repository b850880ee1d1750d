//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The audience may be overridden with TOKEN_AUDIENCE so one config file can
//! serve several deployments.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_refresher::RefreshConfig;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    pub credential: CredentialConfig,
}

/// HTTP listener and token scope
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Scope requested from the credential source. Required, either here or
    /// through TOKEN_AUDIENCE.
    #[serde(default)]
    pub audience: String,
}

/// Projected token file the agent keeps fresh
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub token_file: PathBuf,
    /// Validity assumed for each read of the token file
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
}

impl CredentialConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }
}

fn default_lifetime_secs() -> u64 {
    3600
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(audience) = std::env::var("TOKEN_AUDIENCE") {
            config.agent.audience = audience;
        }

        if config.agent.audience.trim().is_empty() {
            return Err(common::Error::Config(
                "audience must be set in [agent] or TOKEN_AUDIENCE".into(),
            ));
        }

        if config.credential.lifetime_secs == 0 {
            return Err(common::Error::Config(
                "lifetime_secs must be greater than 0".into(),
            ));
        }

        config.refresh.validate()?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-agent.toml")
    }
}
