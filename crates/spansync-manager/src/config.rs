use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spansync_base::constants::{
    HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MISSED_HEARTBEAT_THRESHOLD,
};
use spansync_base::settings::{SettingValue, SettingsMap};
use spansync_metadata::external::TopologySvc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Connection string of the local cluster's admin endpoint.
    pub connection_str: String,
    /// Uuid of the local cluster, echoed from its management API.
    pub cluster_uuid: String,
    pub probe_timeout_secs: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub missed_heartbeat_threshold: u16,
    pub gc_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connection_str: String::from("127.0.0.1:8091"),
            cluster_uuid: String::new(),
            probe_timeout_secs: 10,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 4000,
            missed_heartbeat_threshold: 5,
            gc_interval_secs: 300,
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ManagerConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ManagerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    /// A `TopologySvc` answering from this configuration.
    pub fn topology_svc(&self) -> Arc<dyn TopologySvc> {
        Arc::new(ConfigTopologySvc {
            connection_str: self.connection_str.clone(),
            cluster_uuid: self.cluster_uuid.clone(),
        })
    }

    /// The supervisor settings map this configuration asks for.
    pub fn supervisor_settings(&self) -> SettingsMap {
        let mut settings = SettingsMap::new();
        settings.insert(
            HEARTBEAT_INTERVAL.to_string(),
            SettingValue::Duration(Duration::from_millis(self.heartbeat_interval_ms)),
        );
        settings.insert(
            HEARTBEAT_TIMEOUT.to_string(),
            SettingValue::Duration(Duration::from_millis(self.heartbeat_timeout_ms)),
        );
        settings.insert(
            MISSED_HEARTBEAT_THRESHOLD.to_string(),
            SettingValue::Unsigned(self.missed_heartbeat_threshold as u64),
        );
        settings
    }
}

/// `TopologySvc` backed by the loaded configuration.
///
/// The consumers treat an empty connection string or cluster uuid as broken
/// wiring and abort, so a production config must fill both.
pub struct ConfigTopologySvc {
    connection_str: String,
    cluster_uuid: String,
}

impl TopologySvc for ConfigTopologySvc {
    fn my_connection_str(&self) -> String {
        self.connection_str.clone()
    }

    fn my_cluster_uuid(&self) -> String {
        self.cluster_uuid.clone()
    }
}
