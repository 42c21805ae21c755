//! Engine configuration.
//!
//! Loaded from `~/.rowe/config.yaml` when present, with environment variable
//! overrides for the settings that matter in deployment. Everything has a
//! working default so `rowe server` starts with no config file at all.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoweConfig {
    /// Host the HTTP server binds to.
    pub host: String,
    /// Port the HTTP server listens on.
    pub port: u16,
    /// SQLite database file.
    pub db_path: String,
    /// Base directory for per-task working directories.
    pub work_dir: String,
    /// Base URI task outputs stage out to. Empty leaves outputs in place.
    pub stage_out_base: String,
    /// Default executor when neither a hint nor DockerRequirement selects one.
    pub default_executor: String,
    /// Scheduler tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Lease duration granted to a worker at checkout, in seconds.
    pub worker_lease_secs: i64,
    /// Heartbeat age after which a worker is marked STALE, in seconds.
    pub heartbeat_grace_secs: i64,
    /// Default retry budget for tasks that do not declare one.
    pub default_max_retries: i64,
    /// Max concurrently running tasks per in-process executor.
    pub executor_slots: usize,
    pub container: ContainerConfig,
    pub bvbrc: BvbrcConfig,
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerConfig {
    /// Container binary, e.g. "docker" or "podman".
    pub binary: String,
    /// Pass GPU access to containers (`--gpus all`).
    pub gpus: bool,
}

/// Remote bioinformatics service settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BvbrcConfig {
    /// JSON-RPC endpoint URL. Empty disables the remote-service executor.
    pub endpoint: String,
    /// Bearer token for the Authorization header.
    pub token: String,
    /// Workspace path under which job outputs are written.
    pub workspace_path: String,
    /// App schema cache TTL in seconds.
    pub schema_ttl_secs: i64,
}

impl Default for RoweConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            host: "127.0.0.1".to_string(),
            port: 8472,
            db_path: home.join(".rowe").join("rowe.db").to_string_lossy().to_string(),
            work_dir: home.join(".rowe").join("work").to_string_lossy().to_string(),
            stage_out_base: String::new(),
            default_executor: "local".to_string(),
            tick_interval_ms: 500,
            worker_lease_secs: 120,
            heartbeat_grace_secs: 90,
            default_max_retries: 2,
            executor_slots: 4,
            container: ContainerConfig::default(),
            bvbrc: BvbrcConfig::default(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            gpus: false,
        }
    }
}

impl RoweConfig {
    /// Load configuration: file (if present), then env overrides.
    pub fn load() -> Result<Self, ServerError> {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rowe")
            .join("config.yaml");

        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ServerError::Internal(format!("Failed to read {}: {}", path.display(), e)))?;
            serde_yaml::from_str(&text)
                .map_err(|e| ServerError::Internal(format!("Invalid config {}: {}", path.display(), e)))?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for deploy-time settings.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROWE_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("ROWE_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("ROWE_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("ROWE_WORK_DIR") {
            self.work_dir = v;
        }
        if let Ok(v) = std::env::var("ROWE_DEFAULT_EXECUTOR") {
            self.default_executor = v;
        }
        if let Ok(v) = std::env::var("BVBRC_ENDPOINT") {
            self.bvbrc.endpoint = v;
        }
        if let Ok(v) = std::env::var("BVBRC_TOKEN") {
            self.bvbrc.token = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = RoweConfig::default();
        assert_eq!(config.default_executor, "local");
        assert!(config.tick_interval_ms > 0);
        assert!(config.db_path.ends_with("rowe.db"));
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = RoweConfig::default();
        let text = serde_yaml::to_string(&config).unwrap();
        let back: RoweConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.port, config.port);
        assert_eq!(back.container.binary, "docker");
    }
}
