//! The cluster topology service: shard->server and server->endpoint
//! lookup, consumed through this narrow interface rather than implemented
//! here.

use async_trait::async_trait;
use url::Url;

use crate::record::{ServerId, ShardId};

#[async_trait]
pub trait ClusterTopology: Send + Sync {
    /// Servers responsible for a shard, in preference order. Empty if the
    /// shard is unknown.
    async fn responsible_servers(&self, shard_id: &ShardId) -> Vec<ServerId>;

    /// The endpoint of a server, or `None` if unknown.
    async fn server_endpoint(&self, server_id: &ServerId) -> Option<Url>;
}

/// A static in-memory topology, useful for tests and for small fixed
/// deployments that don't run a real topology service.
#[derive(Debug, Default, Clone)]
pub struct StaticTopology {
    shards: std::collections::HashMap<ShardId, Vec<ServerId>>,
    endpoints: std::collections::HashMap<ServerId, Url>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shard(mut self, shard_id: ShardId, servers: Vec<ServerId>) -> Self {
        self.shards.insert(shard_id, servers);
        self
    }

    pub fn with_endpoint(mut self, server_id: ServerId, endpoint: Url) -> Self {
        self.endpoints.insert(server_id, endpoint);
        self
    }
}

#[async_trait]
impl ClusterTopology for StaticTopology {
    async fn responsible_servers(&self, shard_id: &ShardId) -> Vec<ServerId> {
        self.shards.get(shard_id).cloned().unwrap_or_default()
    }

    async fn server_endpoint(&self, server_id: &ServerId) -> Option<Url> {
        self.endpoints.get(server_id).cloned()
    }
}
