//! Request preparer: builds the outbound HTTP request and injects
//! the standard headers.

use std::collections::HashSet;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::clock::HybridLogicalClock;
use crate::identity::ServerIdentity;
use crate::record::{ResolvedDestination, ServerId, ShardId, Ticket, TransactionIds};

/// Outbound request, ready to hand to the transport driver.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Options controlling header injection. The async-answer pattern only
/// applies when `single_request` is false.
pub struct PrepareOptions<'a> {
    pub hlc_header_name: &'a str,
    pub nolock_shards: &'a HashSet<ShardId>,
    pub single_request: bool,
    pub ticket: Ticket,
    pub transaction: &'a TransactionIds,
}

/// Builds the outbound HTTP request for an already-resolved destination.
/// Always copies caller headers before mutating them.
pub fn prepare_request(
    destination: &ResolvedDestination,
    method: Method,
    path: &str,
    body: Vec<u8>,
    caller_headers: &HeaderMap,
    identity: &Arc<dyn ServerIdentity>,
    clock: &Arc<dyn HybridLogicalClock>,
    options: &PrepareOptions<'_>,
) -> Result<PreparedRequest, http::header::InvalidHeaderValue> {
    let mut headers = caller_headers.clone();

    headers.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&identity.authentication_header_value())?,
    );

    let tick = clock.now();
    let encoded_tick = clock.encode_timestamp(tick);
    let hlc_name = HeaderName::try_from(options.hlc_header_name)
        .unwrap_or_else(|_| HeaderName::from_static("x-arango-hlc"));
    headers.insert(hlc_name, HeaderValue::from_str(&encoded_tick)?);

    if let Some(shard_id) = &destination.shard_id {
        if options.nolock_shards.contains(shard_id) {
            headers.insert(
                HeaderName::from_static("x-arango-nolock"),
                HeaderValue::from_str(&shard_id.0)?,
            );
        }
    }

    if !options.single_request {
        headers.insert(
            HeaderName::from_static("x-arango-async"),
            HeaderValue::from_static("store"),
        );

        let self_id = identity.self_server_id();
        let coordinator_header = format_coordinator_header(&self_id, options.ticket, options.transaction);
        headers.insert(
            HeaderName::from_static("x-arango-coordinator"),
            HeaderValue::from_str(&coordinator_header)?,
        );
    }

    let mut url = destination.endpoint.clone();
    {
        let mut segs = url.path().trim_end_matches('/').to_string();
        segs.push_str(path);
        url.set_path(&segs);
    }

    Ok(PreparedRequest {
        url,
        method,
        headers,
        body,
    })
}

/// `<selfServerId>:<ticket>:<clientTxId>:<coordTxId>`.
pub fn format_coordinator_header(
    self_server_id: &ServerId,
    ticket: Ticket,
    transaction: &TransactionIds,
) -> String {
    format!(
        "{}:{}:{}:{}",
        self_server_id,
        ticket,
        transaction.client_tx_id.as_deref().unwrap_or(""),
        transaction.coord_tx_id.unwrap_or(0),
    )
}

/// Parsed `X-Arango-Coordinator` header: at least two `:`-separated
/// fields required, ticket parsed as an unsigned 64-bit decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCoordinatorHeader {
    pub server_id: ServerId,
    pub ticket: Ticket,
    pub client_tx_id: Option<String>,
    pub coord_tx_id: Option<u64>,
}

pub fn parse_coordinator_header(header: &str) -> Result<ParsedCoordinatorHeader, String> {
    let fields: Vec<&str> = header.split(':').collect();
    if fields.len() < 2 {
        return Err(format!(
            "malformed X-Arango-Coordinator header '{header}': expected at least 2 fields"
        ));
    }

    let server_id = ServerId(fields[0].to_string());
    let ticket = fields[1]
        .parse::<u64>()
        .map_err(|e| format!("malformed ticket in '{header}': {e}"))?;

    let client_tx_id = fields.get(2).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let coord_tx_id = fields
        .get(3)
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&v| v != 0);

    Ok(ParsedCoordinatorHeader {
        server_id,
        ticket: Ticket(ticket),
        client_tx_id,
        coord_tx_id,
    })
}
