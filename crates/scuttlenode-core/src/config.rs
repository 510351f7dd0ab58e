//! Node configuration
//!
//! Stored as `config.json` in the data directory. Every field has a default,
//! so a missing file or a partial file is fine.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::boxstream::NetworkKey;
use crate::error::{NodeError, NodeResult};
use crate::graph::DEFAULT_MAX_HOPS;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Name of the database file inside the data directory.
pub const DATABASE_FILE_NAME: &str = "node.redb";

/// Tuning of the replication manager and replicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Wait after `NoMore` for feeds at hops <= 1
    pub backoff_near_ms: u64,
    /// Wait after `NoMore` for other feeds
    pub backoff_far_ms: u64,
    /// Wait after `Failed`
    pub backoff_failed_ms: u64,
    /// Sleep between scans of the wanted feeds
    pub scan_interval_ms: u64,
    /// How long an offered task waits for a worker
    pub accept_timeout_ms: u64,
    /// Parallel CHS workers per peer
    pub workers: usize,
    /// `limit` of each `createHistoryStream` request
    pub chs_limit: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            backoff_near_ms: 30_000,
            backoff_far_ms: 5 * 60_000,
            backoff_failed_ms: 10 * 60_000,
            scan_interval_ms: 1_000,
            accept_timeout_ms: 10,
            workers: 10,
            chs_limit: 1_000,
        }
    }
}

impl ReplicationConfig {
    pub fn backoff_near(&self) -> Duration {
        Duration::from_millis(self.backoff_near_ms)
    }

    pub fn backoff_far(&self) -> Duration {
        Duration::from_millis(self.backoff_far_ms)
    }

    pub fn backoff_failed(&self) -> Duration {
        Duration::from_millis(self.backoff_failed_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_address: SocketAddr,
    /// Hex encoded 32-byte network key
    pub network_key: String,
    /// Social graph horizon
    pub hops: u32,
    pub enable_ebt: bool,
    pub wanted_feeds_cache_ttl_ms: u64,
    /// How long an inbound peer may take to open an EBT session before it
    /// is replicated with `createHistoryStream` instead
    pub ebt_wait_for_session_ms: u64,
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8008)),
            network_key: NetworkKey::MAIN.to_hex(),
            hops: DEFAULT_MAX_HOPS,
            enable_ebt: true,
            wanted_feeds_cache_ttl_ms: 5_000,
            ebt_wait_for_session_ms: 5_000,
            replication: ReplicationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read `config.json` from `data_dir`, falling back to defaults when the
    /// file does not exist.
    pub fn load(data_dir: impl AsRef<Path>) -> NodeResult<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: NodeConfig = serde_json::from_str(&text)
            .map_err(|e| NodeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write `config.json` into `data_dir`.
    pub fn save(&self, data_dir: impl AsRef<Path>) -> NodeResult<()> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), text)?;
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        self.network_key()?;
        if self.replication.workers == 0 {
            return Err(NodeError::Config("replication.workers must be at least 1".to_string()));
        }
        if self.replication.chs_limit == 0 {
            return Err(NodeError::Config("replication.chs_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn network_key(&self) -> NodeResult<NetworkKey> {
        NetworkKey::from_hex(&self.network_key)
            .map_err(|e| NodeError::Config(format!("network_key: {}", e)))
    }

    pub fn wanted_feeds_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.wanted_feeds_cache_ttl_ms)
    }

    pub fn ebt_wait_for_session(&self) -> Duration {
        Duration::from_millis(self.ebt_wait_for_session_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_address.port(), 8008);
        assert_eq!(config.hops, 3);
        assert_eq!(config.network_key().unwrap(), NetworkKey::MAIN);
        assert_eq!(config.replication.backoff_near(), Duration::from_secs(30));
        assert_eq!(config.replication.backoff_far(), Duration::from_secs(300));
        assert_eq!(config.replication.backoff_failed(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        assert_eq!(NodeConfig::load(temp.path()).unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            r#"{"hops": 1, "replication": {"workers": 2}}"#,
        )
        .unwrap();
        let config = NodeConfig::load(temp.path()).unwrap();
        assert_eq!(config.hops, 1);
        assert_eq!(config.replication.workers, 2);
        assert_eq!(config.replication.chs_limit, 1000);
        assert!(config.enable_ebt);
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let config = NodeConfig {
            enable_ebt: false,
            ..NodeConfig::default()
        };
        config.save(temp.path()).unwrap();
        assert_eq!(NodeConfig::load(temp.path()).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let bad_key = NodeConfig {
            network_key: "abc".to_string(),
            ..NodeConfig::default()
        };
        assert!(matches!(bad_key.validate(), Err(NodeError::Config(_))));

        let mut no_workers = NodeConfig::default();
        no_workers.replication.workers = 0;
        assert!(matches!(no_workers.validate(), Err(NodeError::Config(_))));
    }
}
