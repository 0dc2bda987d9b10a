//! Node configuration. Static for the lifetime of a server.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PalisadeError, PalisadeResult};

pub const DEFAULT_SNAP_COUNT: u64 = 10_000;
pub const DEFAULT_MAX_SNAPSHOTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human name of this member; must appear in `initial_cluster`.
    pub name: String,
    pub data_dir: PathBuf,
    /// Initial membership spec: `name=url,name=url,…`.
    pub initial_cluster: String,
    /// Token mixed into member ids so distinct clusters with identical
    /// configs cannot cross-talk.
    pub initial_cluster_token: String,
    /// Bootstrap a brand-new cluster rather than joining an existing one.
    pub new_cluster: bool,
    /// On restart, reconfigure as a standalone single-member cluster,
    /// discarding uncommitted entries. Quorum-loss recovery.
    pub force_new_cluster: bool,
    /// Discovery endpoint; bootstrap-by-discovery is handled by an outer
    /// layer, the field is carried for it.
    pub discovery_url: Option<String>,
    pub discovery_proxy: Option<String>,
    /// Election timeout in ticks.
    pub election_ticks: usize,
    /// Tick interval in milliseconds.
    pub tick_ms: u64,
    /// Committed entries between snapshots; 0 means the default.
    pub snap_count: u64,
    /// Snapshot records retained on disk.
    pub max_snapshots: usize,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "default".to_string(),
            data_dir: PathBuf::from("default.palisade"),
            initial_cluster: "default=http://localhost:2380".to_string(),
            initial_cluster_token: "palisade-cluster".to_string(),
            new_cluster: false,
            force_new_cluster: false,
            discovery_url: None,
            discovery_proxy: None,
            election_ticks: 10,
            tick_ms: 100,
            snap_count: DEFAULT_SNAP_COUNT,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            peer_urls: vec!["http://localhost:2380".to_string()],
            client_urls: vec!["http://localhost:2379".to_string()],
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> PalisadeResult<()> {
        if self.name.is_empty() {
            return Err(PalisadeError::Config {
                message: "member name must not be empty".to_string(),
            });
        }
        if self.tick_ms == 0 {
            return Err(PalisadeError::Config {
                message: "tick interval must be positive".to_string(),
            });
        }
        if self.election_ticks < 2 {
            return Err(PalisadeError::Config {
                message: "election ticks must be at least 2".to_string(),
            });
        }
        if self.initial_cluster.is_empty() {
            return Err(PalisadeError::Config {
                message: "initial cluster must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn member_dir(&self) -> PathBuf {
        self.data_dir.join("member")
    }

    pub fn db_path(&self) -> PathBuf {
        self.member_dir().join("raft.db")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn effective_snap_count(&self) -> u64 {
        if self.snap_count == 0 {
            DEFAULT_SNAP_COUNT
        } else {
            self.snap_count
        }
    }

    pub fn should_discover(&self) -> bool {
        self.discovery_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut cfg = NodeConfig::default();
        cfg.name = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::default();
        cfg.tick_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::default();
        cfg.election_ticks = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_snap_count_zero_falls_back_to_default() {
        let mut cfg = NodeConfig::default();
        cfg.snap_count = 0;
        assert_eq!(cfg.effective_snap_count(), DEFAULT_SNAP_COUNT);
    }
}
