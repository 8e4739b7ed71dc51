//! Destination resolver.

use std::sync::Arc;

use tracing::Level;
use url::Url;

use crate::record::{Destination, ResolvedDestination, ServerId, ShardId};
use crate::topology::ClusterTopology;

/// Parses the `shard:`, `server:`, `tcp://`, `ssl://` destination forms.
/// All other forms are rejected.
pub fn parse_destination(raw: &str) -> Result<Destination, String> {
    if let Some(shard) = raw.strip_prefix("shard:") {
        return Ok(Destination::Shard(ShardId(shard.to_string())));
    }
    if let Some(server) = raw.strip_prefix("server:") {
        return Ok(Destination::Server(ServerId(server.to_string())));
    }
    if raw.starts_with("tcp://") || raw.starts_with("ssl://") {
        let translated = translate_scheme(raw);
        let url = Url::parse(&translated).map_err(|e| format!("bad endpoint '{raw}': {e}"))?;
        return Ok(Destination::Endpoint(url));
    }
    Err(format!("did not understand destination '{raw}'"))
}

/// `tcp://` -> `http://`, `ssl://` -> `https://`.
pub fn translate_scheme(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("tcp://") {
        format!("http://{rest}")
    } else if let Some(rest) = raw.strip_prefix("ssl://") {
        format!("https://{rest}")
    } else {
        raw.to_string()
    }
}

/// The outcome of resolving a destination: either a resolved endpoint, or
/// a terminal-failure message (the record becomes `BackendUnavailable`
/// with no transport submission).
pub enum ResolveOutcome {
    Resolved(ResolvedDestination),
    Failed(String),
}

/// Resolves a destination string against the topology service. `log_level`
/// controls how loudly a resolution failure is logged.
pub async fn resolve_destination(
    raw: &str,
    topology: &Arc<dyn ClusterTopology>,
    log_level: Level,
) -> ResolveOutcome {
    let destination = match parse_destination(raw) {
        Ok(d) => d,
        Err(message) => {
            log_failure(log_level, &message);
            return ResolveOutcome::Failed(message);
        }
    };

    match destination {
        Destination::Endpoint(endpoint) => ResolveOutcome::Resolved(ResolvedDestination {
            shard_id: None,
            server_id: None,
            endpoint,
        }),
        Destination::Shard(shard_id) => {
            let servers = topology.responsible_servers(&shard_id).await;
            let Some(server_id) = servers.into_iter().next() else {
                let message = format!("cannot find responsible server for shard '{shard_id}'");
                log_failure(log_level, &message);
                return ResolveOutcome::Failed(message);
            };
            resolve_server(Some(shard_id), server_id, topology, log_level).await
        }
        Destination::Server(server_id) => resolve_server(None, server_id, topology, log_level).await,
    }
}

async fn resolve_server(
    shard_id: Option<ShardId>,
    server_id: ServerId,
    topology: &Arc<dyn ClusterTopology>,
    log_level: Level,
) -> ResolveOutcome {
    match topology.server_endpoint(&server_id).await {
        Some(endpoint) => ResolveOutcome::Resolved(ResolvedDestination {
            shard_id,
            server_id: Some(server_id),
            endpoint,
        }),
        None => {
            let message = format!("did not find endpoint of server '{server_id}'");
            log_failure(log_level, &message);
            ResolveOutcome::Failed(message)
        }
    }
}

fn log_failure(level: Level, message: &str) {
    match level {
        Level::ERROR => tracing::error!(%message, "destination resolution failed"),
        Level::WARN => tracing::warn!(%message, "destination resolution failed"),
        Level::INFO => tracing::info!(%message, "destination resolution failed"),
        Level::DEBUG => tracing::debug!(%message, "destination resolution failed"),
        Level::TRACE => tracing::trace!(%message, "destination resolution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;

    #[test]
    fn parses_all_four_grammar_forms() {
        assert_eq!(parse_destination("shard:s01").unwrap(), Destination::Shard(ShardId("s01".into())));
        assert_eq!(parse_destination("server:DBS-1").unwrap(), Destination::Server(ServerId("DBS-1".into())));
        assert!(matches!(parse_destination("tcp://10.0.0.1:8529").unwrap(), Destination::Endpoint(_)));
        assert!(matches!(parse_destination("ssl://10.0.0.1:8529").unwrap(), Destination::Endpoint(_)));
    }

    #[test]
    fn rejects_unknown_forms() {
        assert!(parse_destination("udp://10.0.0.1:1234").is_err());
        assert!(parse_destination("DBS-1").is_err());
    }

    #[test]
    fn translates_tcp_and_ssl_schemes() {
        assert_eq!(translate_scheme("tcp://host:1"), "http://host:1");
        assert_eq!(translate_scheme("ssl://host:1"), "https://host:1");
    }

    #[tokio::test]
    async fn resolves_shard_to_first_responsible_servers_endpoint() {
        let endpoint = Url::parse("http://dbserver-1:8529").unwrap();
        let topology: Arc<dyn ClusterTopology> = Arc::new(
            StaticTopology::new()
                .with_shard(ShardId("s01".into()), vec![ServerId("DBS-1".into())])
                .with_endpoint(ServerId("DBS-1".into()), endpoint.clone()),
        );

        match resolve_destination("shard:s01", &topology, Level::WARN).await {
            ResolveOutcome::Resolved(resolved) => {
                assert_eq!(resolved.shard_id, Some(ShardId("s01".into())));
                assert_eq!(resolved.server_id, Some(ServerId("DBS-1".into())));
                assert_eq!(resolved.endpoint, endpoint);
            }
            ResolveOutcome::Failed(message) => panic!("expected resolution, got {message}"),
        }
    }

    #[tokio::test]
    async fn fails_cleanly_on_unknown_shard() {
        let topology: Arc<dyn ClusterTopology> = Arc::new(StaticTopology::new());
        match resolve_destination("shard:missing", &topology, Level::WARN).await {
            ResolveOutcome::Failed(_) => {}
            ResolveOutcome::Resolved(_) => panic!("unknown shard should not resolve"),
        }
    }

    #[tokio::test]
    async fn literal_endpoint_bypasses_topology() {
        let topology: Arc<dyn ClusterTopology> = Arc::new(StaticTopology::new());
        match resolve_destination("ssl://dbserver-9:8530", &topology, Level::WARN).await {
            ResolveOutcome::Resolved(resolved) => {
                assert_eq!(resolved.shard_id, None);
                assert_eq!(resolved.server_id, None);
                assert_eq!(resolved.endpoint.as_str(), "https://dbserver-9:8530/");
            }
            ResolveOutcome::Failed(message) => panic!("expected resolution, got {message}"),
        }
    }
}
