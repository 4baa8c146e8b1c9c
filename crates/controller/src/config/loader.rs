use std::path::{Path, PathBuf};

use foreman_common::config::SystemConfig;

use super::validation;

/// Complete controller configuration loaded from the config directory.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Parsed system.toml.
    pub system: SystemConfig,
    /// Base config directory path (used for future config reload).
    #[allow(dead_code)]
    pub config_dir: PathBuf,
}

/// Load configuration from the given config directory.
///
/// Fails loudly with clear error messages if anything is misconfigured;
/// the controller refuses to start on validation failure. A missing
/// system.toml yields the built-in defaults so a bare checkout still runs.
pub fn load_config(config_dir: &Path) -> Result<ControllerConfig, ConfigError> {
    tracing::info!(config_dir = %config_dir.display(), "Loading configuration");

    let system_path = config_dir.join("system.toml");
    let mut system = if system_path.exists() {
        load_system_config(&system_path)?
    } else {
        tracing::warn!(
            path = %system_path.display(),
            "system.toml not found, using built-in defaults"
        );
        SystemConfig::default()
    };

    apply_env_overrides(&mut system);

    let config = ControllerConfig {
        system,
        config_dir: config_dir.to_path_buf(),
    };

    validation::validate(&config)?;

    tracing::info!(
        master_id = %config.system.master.master_id,
        failover = config.system.master.enable_failover,
        "Configuration loaded successfully"
    );

    Ok(config)
}

fn load_system_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Deploy-time identity comes from the environment, not the checked-in file.
fn apply_env_overrides(system: &mut SystemConfig) {
    if let Ok(id) = std::env::var("MASTER_ID") {
        if !id.is_empty() {
            system.master.master_id = id;
        }
    }
    if let Ok(v) = std::env::var("MASTER_HEARTBEAT_INTERVAL") {
        if let Ok(secs) = v.parse() {
            system.master.heartbeat_interval_secs = secs;
        }
    }
    if let Ok(v) = std::env::var("MASTER_TIMEOUT") {
        if let Ok(secs) = v.parse() {
            system.master.timeout_secs = secs;
        }
    }
    if let Ok(v) = std::env::var("ENABLE_MASTER_FAILOVER") {
        match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => system.master.enable_failover = true,
            "0" | "false" | "no" => system.master.enable_failover = false,
            other => tracing::warn!(value = other, "Ignoring unparseable ENABLE_MASTER_FAILOVER"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
