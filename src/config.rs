//! Ambient configuration, loaded from TOML the way `web3_proxy`'s own
//! `AppConfig` is loaded (`app.rs::Web3ProxyApp::spawn`), with defaults
//! liberal enough that `ClusterCommConfig::default()` alone is usable in
//! tests.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ClusterCommError, ClusterCommResult};
use crate::record::ShardId;

fn default_self_server_id() -> String {
    "CRDN-UNSET".to_string()
}

fn default_request_timeout_secs() -> f64 {
    60.0
}

fn default_connect_timeout_secs() -> f64 {
    5.0
}

fn default_max_concurrent_requests() -> usize {
    64
}

fn default_sweep_interval_secs() -> f64 {
    1.0
}

fn default_hlc_header_name() -> String {
    "x-arango-hlc".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterCommConfig {
    pub self_server_id: String,
    pub request_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    pub max_concurrent_requests: usize,
    pub sweep_interval_secs: f64,
    pub hlc_header_name: String,
    /// Shards for which `X-Arango-Nolock` should be injected.
    pub nolock_shards: HashSet<String>,
}

impl Default for ClusterCommConfig {
    fn default() -> Self {
        Self {
            self_server_id: default_self_server_id(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_concurrent_requests: default_max_concurrent_requests(),
            sweep_interval_secs: default_sweep_interval_secs(),
            hlc_header_name: default_hlc_header_name(),
            nolock_shards: HashSet::new(),
        }
    }
}

impl ClusterCommConfig {
    pub fn from_toml_str(raw: &str) -> ClusterCommResult<Self> {
        toml::from_str(raw).map_err(ClusterCommError::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs.max(0.0))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs.max(0.0))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_secs.max(0.01))
    }

    pub fn nolock_shard_set(&self) -> HashSet<ShardId> {
        self.nolock_shards.iter().cloned().map(ShardId).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable_as_is() {
        let config = ClusterCommConfig::default();
        assert_eq!(config.self_server_id, "CRDN-UNSET");
        assert!(config.request_timeout() > config.connect_timeout());
        assert!(config.nolock_shard_set().is_empty());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = ClusterCommConfig::from_toml_str(
            r#"
            self_server_id = "CRDN-01"
            request_timeout_secs = 30.0
            nolock_shards = ["s01", "s02"]
            "#,
        )
        .unwrap();

        assert_eq!(config.self_server_id, "CRDN-01");
        assert_eq!(config.request_timeout(), Duration::from_secs_f64(30.0));
        assert_eq!(config.connect_timeout_secs, default_connect_timeout_secs());
        assert_eq!(config.nolock_shard_set().len(), 2);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(ClusterCommConfig::from_toml_str("not valid toml = [").is_err());
    }

    #[test]
    fn sweep_interval_has_a_sane_floor() {
        let mut config = ClusterCommConfig::default();
        config.sweep_interval_secs = 0.0;
        assert!(config.sweep_interval() >= Duration::from_millis(10));
    }
}
