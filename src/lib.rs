//! Inter-node RPC dispatch for a sharded cluster: resolves a destination
//! (shard, server, or literal endpoint) against a topology service, fires
//! the request over a shared HTTP transport, and tracks its outcome until
//! a caller collects it — synchronously, by polling, or via an
//! out-of-band "async answer" delivered back to this node later.

pub mod clock;
pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod errors;
pub mod fanout;
pub mod identity;
pub mod preparer;
pub mod record;
pub mod registry;
pub mod server;
pub mod topology;
pub mod transport;
pub mod worker;

pub use config::ClusterCommConfig;
pub use dispatcher::{ClusterComm, ProcessAnswerOutcome, RequestOptions};
pub use errors::{ClusterCommError, ClusterCommErrorContext, ClusterCommResult};
pub use fanout::{perform_requests, FanoutOptions, FanoutRequest};
pub use record::{Destination, RequestRecord, ServerId, ShardId, Status, Ticket};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info` when unset. Call once, near the start of `main`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .ok();
}
