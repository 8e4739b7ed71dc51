//! Fan-out orchestration: issue a batch of requests against possibly
//! many shards, retry the ones that hit a down backend, and give up on the
//! whole fleet once a global deadline passes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{HeaderMap, Method};
use tracing::trace;

use crate::dispatcher::{ClusterComm, RequestOptions};
use crate::record::{AnswerRequest, RequestRecord, Status, Ticket};

/// One leg of a fan-out. `shard_id` is carried along only for logging; the
/// actual routing happens through `destination`.
#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub destination: String,
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub shard_id: String,
}

#[derive(Debug, Clone)]
pub struct FanoutOptions {
    pub client_tx_id: String,
    pub coord_tx_id: u64,
    /// Per-attempt wait before a retry is considered.
    pub local_timeout: Duration,
    /// Deadline for the whole fleet; anything still outstanding past this
    /// point is dropped and reported `Timeout`.
    pub global_timeout: Duration,
}

const MIN_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MIN_INIT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs every request in `requests` to completion (or until `global_timeout`
/// expires) and returns one `RequestRecord` per request, in the same order.
///
/// A single request skips the full store-and-retry machinery: it's sent
/// synchronously and its own response stands in for the out-of-band answer
/// the multi-request path would otherwise wait for.
pub async fn perform_requests(
    comm: &Arc<ClusterComm>,
    requests: Vec<FanoutRequest>,
    options: FanoutOptions,
) -> Vec<RequestRecord> {
    if requests.len() == 1 {
        let request = requests.into_iter().next().expect("len checked above");
        return vec![perform_single(comm, request, &options).await];
    }
    perform_many(comm, requests, options).await
}

async fn perform_single(
    comm: &Arc<ClusterComm>,
    request: FanoutRequest,
    options: &FanoutOptions,
) -> RequestRecord {
    let req = RequestOptions::new(request.destination, request.method, request.path)
        .with_body(request.body)
        .with_headers(request.headers)
        .with_transaction(options.client_tx_id.clone(), options.coord_tx_id)
        .with_timeout(options.local_timeout);

    let mut record = comm.sync_request(req).await;

    if record.status == Status::Received {
        if let Some(result) = record.result.clone() {
            if result.status_code == 503 {
                // A single shard reporting 503 almost always means its
                // leader moved or it's overloaded: treat it the same as a
                // connect failure so callers retry it the same way.
                record.status = Status::BackendUnavailable;
                record.error_message = Some("backend reported 503 Service Unavailable".to_string());
            } else {
                record.answer = Some(AnswerRequest {
                    body: result.body,
                    headers: result.headers,
                });
            }
        }
    }

    record
}

struct Pending {
    index: usize,
    ticket: Ticket,
    request: FanoutRequest,
    attempt: u32,
}

async fn perform_many(
    comm: &Arc<ClusterComm>,
    requests: Vec<FanoutRequest>,
    options: FanoutOptions,
) -> Vec<RequestRecord> {
    let start_time = Instant::now();
    let fleet_deadline = start_time + options.global_timeout;
    let mut results: Vec<Option<RequestRecord>> = vec![None; requests.len()];

    let mut pending = Vec::with_capacity(requests.len());
    for (index, request) in requests.into_iter().enumerate() {
        let ticket = issue(comm, &request, &options, start_time, fleet_deadline).await;
        pending.push(Pending {
            index,
            ticket,
            request,
            attempt: 1,
        });
    }

    while !pending.is_empty() {
        if Instant::now() >= fleet_deadline {
            for p in pending {
                comm.drop_request(p.ticket, "", 0, "");
                results[p.index] = Some(drop_as_timeout(comm, p.ticket));
            }
            break;
        }

        let mut still_pending = Vec::with_capacity(pending.len());
        for mut p in pending {
            let remaining_fleet = fleet_deadline.saturating_duration_since(Instant::now());
            let wait_for = options.local_timeout.min(remaining_fleet);

            let record = comm
                .wait(p.ticket, &options.client_tx_id, options.coord_tx_id, "", wait_for)
                .await;

            if !record.status.is_terminal() {
                still_pending.push(p);
                continue;
            }

            let retry_eligible = record.status == Status::BackendUnavailable
                || (record.status == Status::Timeout && !record.send_was_complete);

            if retry_eligible {
                // Backoff escalates with time elapsed since the fleet call
                // itself started, not since this particular attempt was
                // (re)submitted — otherwise every retry resets the clock
                // and the delay never actually grows.
                let elapsed = Instant::now().saturating_duration_since(start_time);
                let backoff = (elapsed * 2).clamp(MIN_BACKOFF, MAX_BACKOFF);
                let now = Instant::now();
                if now + backoff < fleet_deadline {
                    trace!(
                        shard = %p.request.shard_id,
                        attempt = p.attempt,
                        backoff_ms = backoff.as_millis(),
                        "retrying fanout leg after {:?}",
                        record.status
                    );
                    tokio::time::sleep(backoff).await;
                    p.ticket = issue(comm, &p.request, &options, start_time, fleet_deadline).await;
                    p.attempt += 1;
                    still_pending.push(p);
                    continue;
                }
            }

            results[p.index] = Some(record);
        }
        pending = still_pending;
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| RequestRecord::synthesised_dropped(Ticket::NONE)))
        .collect()
}

fn drop_as_timeout(comm: &Arc<ClusterComm>, ticket: Ticket) -> RequestRecord {
    let mut record = comm.enquire(ticket);
    if !record.status.is_terminal() {
        record.status = Status::Timeout;
        record.send_was_complete = false;
    }
    record
}

/// Issues (or re-issues) one leg, recomputing its per-attempt connect and
/// request timeouts from how much of the fleet deadline is left: the
/// request timeout shrinks to whatever's left before `fleet_deadline`, and
/// the connect timeout grows with elapsed fleet time (so early attempts
/// fail fast on a dead connection, later ones get more slack), both capped
/// by the remaining time.
async fn issue(
    comm: &Arc<ClusterComm>,
    request: &FanoutRequest,
    options: &FanoutOptions,
    start_time: Instant,
    fleet_deadline: Instant,
) -> Ticket {
    let now = Instant::now();
    let remaining = fleet_deadline.saturating_duration_since(now);
    let elapsed = now.saturating_duration_since(start_time);
    let init_timeout = elapsed.clamp(MIN_INIT_TIMEOUT, MAX_INIT_TIMEOUT).min(remaining);

    let req = RequestOptions::new(
        request.destination.clone(),
        request.method.clone(),
        request.path.clone(),
    )
    .with_body(request.body.clone())
    .with_headers(request.headers.clone())
    .with_transaction(options.client_tx_id.clone(), options.coord_tx_id)
    .with_timeout(remaining)
    .with_init_timeout(init_timeout);

    comm.async_request(req, None).await
}
