use parking_lot::RwLock;
use relay_core::{RelayError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::schema::RelayConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

/// Where the config path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Passed by the caller, e.g. `relay -c <path>`.
    Explicit,
    /// Named by `RELAY_CONFIG`.
    Environment,
    /// `~/.relay/relay.toml`.
    Home,
}

impl ConfigOrigin {
    /// Only the home location may be missing; a path someone named must exist.
    fn may_be_absent(self) -> bool {
        matches!(self, ConfigOrigin::Home)
    }
}

/// Holds the active configuration and the file it came from.
pub struct ConfigLoader {
    path: PathBuf,
    origin: ConfigOrigin,
    active: RwLock<RelayConfig>,
}

fn home_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".relay").join("relay.toml")
}

fn parse(raw: &str, source: &str) -> Result<RelayConfig> {
    toml::from_str(raw).map_err(|e| RelayError::Config(format!("failed to parse {source}: {e}")))
}

/// Overrides and validation shared by `load` and `reload`.
fn finish(config: RelayConfig) -> Result<RelayConfig> {
    let config = ConfigLoader::apply_env_overrides(config);
    let warnings = config.validate().map_err(RelayError::Config)?;
    for warning in warnings {
        warn!(field = %warning.field, "{warning}");
    }
    Ok(config)
}

impl ConfigLoader {
    /// Pick the config path and report where it came from.
    pub fn locate(explicit: Option<&Path>) -> (PathBuf, ConfigOrigin) {
        if let Some(path) = explicit {
            return (path.to_path_buf(), ConfigOrigin::Explicit);
        }
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => (PathBuf::from(path), ConfigOrigin::Environment),
            None => (home_config_path(), ConfigOrigin::Home),
        }
    }

    /// explicit path > RELAY_CONFIG > ~/.relay/relay.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        Self::locate(explicit).0
    }

    /// Load the config. A missing home config yields the defaults, while a
    /// missing explicit or `RELAY_CONFIG` path is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, origin) = Self::locate(explicit);
        let parsed = if path.is_file() {
            info!(path = %path.display(), ?origin, "loading configuration");
            Self::read(&path)?
        } else if origin.may_be_absent() {
            debug!(path = %path.display(), "no config file, using defaults");
            RelayConfig::default()
        } else {
            return Err(RelayError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        };

        Ok(Self {
            active: RwLock::new(finish(parsed)?),
            path,
            origin,
        })
    }

    /// Parse TOML into a config. Env overrides and validation are not applied.
    pub fn from_toml(raw: &str) -> Result<RelayConfig> {
        parse(raw, "config")
    }

    fn read(path: &Path) -> Result<RelayConfig> {
        let raw = std::fs::read_to_string(path)?;
        parse(&raw, &path.display().to_string())
    }

    /// A copy of the active config.
    pub fn get(&self) -> RelayConfig {
        self.active.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin(&self) -> ConfigOrigin {
        self.origin
    }

    /// Apply `RELAY_AGENT_ID`, `RELAY_AGENT_MODEL`, `RELAY_LOG_LEVEL` and
    /// `RELAY_RESOURCE_CONCURRENCY` on top of `config`.
    pub fn apply_env_overrides(mut config: RelayConfig) -> RelayConfig {
        let var = |name: &str| std::env::var(name).ok();
        if let Some(id) = var("RELAY_AGENT_ID") {
            config.agent.id = id;
        }
        if let Some(model) = var("RELAY_AGENT_MODEL") {
            config.agent.model = model;
        }
        if let Some(level) = var("RELAY_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(raw) = var("RELAY_RESOURCE_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(n) => config.pipeline.resource_init_concurrency = n,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid RELAY_RESOURCE_CONCURRENCY"),
            }
        }
        config
    }

    /// Re-read the file. The active config is only replaced when the new one
    /// parses and validates. Returns whether anything changed.
    pub fn reload(&self) -> Result<bool> {
        if !self.path.is_file() {
            return Err(RelayError::Config(format!(
                "config file not found: {}",
                self.path.display()
            )));
        }
        let fresh = finish(Self::read(&self.path)?)?;
        let mut active = self.active.write();
        if *active == fresh {
            debug!(path = %self.path.display(), "configuration unchanged");
            return Ok(false);
        }
        *active = fresh;
        info!(path = %self.path.display(), "configuration reloaded");
        Ok(true)
    }
}
