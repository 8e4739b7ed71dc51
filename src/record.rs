//! The dispatcher's data model: tickets, destinations, transaction tags,
//! status, and the per-ticket `RequestRecord`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use url::Url;

/// A process-unique, monotonically issued, never-zero request id.
///
/// Also the key used to correlate inbound "async answers" back to the
/// outbound request that triggered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl Ticket {
    pub const NONE: Ticket = Ticket(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates tickets from a process-wide monotonic counter, skipping zero.
#[derive(Debug, Default)]
pub struct TicketAllocator {
    next: AtomicU64,
}

impl TicketAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next ticket. Pairwise distinct and strictly increasing
    /// across concurrent callers.
    pub fn next_ticket(&self) -> Ticket {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(id, 0, "ticket counter wrapped through zero");
        Ticket(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unresolved destination string, one of the four grammar forms
/// (`shard:`, `server:`, `tcp://`, `ssl://`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Shard(ShardId),
    Server(ServerId),
    /// A `tcp://` or `ssl://` endpoint, already translated to `http://`/`https://`.
    Endpoint(Url),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shard(s) => write!(f, "shard:{s}"),
            Self::Server(s) => write!(f, "server:{s}"),
            Self::Endpoint(u) => write!(f, "{u}"),
        }
    }
}

/// Destination after resolution: both ids are populated for `shard:`, only
/// the server id for `server:`, neither for a literal endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub shard_id: Option<ShardId>,
    pub server_id: Option<ServerId>,
    pub endpoint: Url,
}

impl fmt::Display for ResolvedDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

/// The two optional caller-supplied correlation tags, preserved on results
/// to support wildcard matching in `wait`/`drop`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionIds {
    pub client_tx_id: Option<String>,
    pub coord_tx_id: Option<u64>,
}

impl TransactionIds {
    pub fn new(client_tx_id: impl Into<String>, coord_tx_id: u64) -> Self {
        let client_tx_id = client_tx_id.into();
        Self {
            client_tx_id: (!client_tx_id.is_empty()).then_some(client_tx_id),
            coord_tx_id: (coord_tx_id != 0).then_some(coord_tx_id),
        }
    }

    /// Wildcard rule: empty/zero filters match anything.
    pub fn matches_filter(&self, client_tx_id: &str, coord_tx_id: u64) -> bool {
        let client_ok = client_tx_id.is_empty()
            || self.client_tx_id.as_deref() == Some(client_tx_id);
        let coord_ok = coord_tx_id == 0 || self.coord_tx_id == Some(coord_tx_id);
        client_ok && coord_ok
    }
}

/// Status state machine. Terminal states are
/// `Received | Timeout | Error | Dropped | BackendUnavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Submitted,
    Sending,
    Sent,
    Received,
    Timeout,
    Error,
    Dropped,
    BackendUnavailable,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Received
                | Status::Timeout
                | Status::Error
                | Status::Dropped
                | Status::BackendUnavailable
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A completed HTTP exchange, as handed back from the transport driver.
#[derive(Debug, Clone, Default)]
pub struct HttpResult {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResult {
    pub fn body_as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// The inbound "answer" request recovered by `processAnswer`, stashed on
/// the record for callers that want to inspect it.
#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// In-flight (and, once terminal, final) state for one ticket.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub ticket: Ticket,
    pub transaction: TransactionIds,
    pub destination: Option<ResolvedDestination>,
    pub status: Status,
    pub error_message: Option<String>,
    pub result: Option<HttpResult>,
    pub answer: Option<AnswerRequest>,
    pub answer_status_code: Option<u16>,
    /// true for sync requests and one-off fan-outs; false for the
    /// store-and-callback async-answer pattern.
    pub single: bool,
    pub dropped: bool,
    pub submit_time: Instant,
    pub deadline: Option<Instant>,
    /// Set when a Timeout originated from an incomplete send (eligible
    /// for retry in `performRequests`); meaningless for other statuses.
    pub send_was_complete: bool,
}

impl RequestRecord {
    pub fn new(
        ticket: Ticket,
        transaction: TransactionIds,
        destination: Option<ResolvedDestination>,
        single: bool,
        timeout: Option<Duration>,
    ) -> Self {
        let submit_time = Instant::now();
        Self {
            ticket,
            transaction,
            destination,
            status: Status::Submitted,
            error_message: None,
            result: None,
            answer: None,
            answer_status_code: None,
            single,
            dropped: false,
            submit_time,
            deadline: timeout.map(|t| submit_time + t),
            send_was_complete: true,
        }
    }

    /// A synthesised terminal record for a ticket that was never tracked
    /// (already dropped, or never existed).
    pub fn synthesised_dropped(ticket: Ticket) -> Self {
        Self {
            ticket,
            transaction: TransactionIds::default(),
            destination: None,
            status: Status::Dropped,
            error_message: None,
            result: None,
            answer: None,
            answer_status_code: None,
            single: true,
            dropped: true,
            submit_time: Instant::now(),
            deadline: None,
            send_was_complete: true,
        }
    }

    /// A record that never reached the transport: resolution failed.
    pub fn terminal_backend_unavailable(
        ticket: Ticket,
        transaction: TransactionIds,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ticket,
            transaction,
            destination: None,
            status: Status::BackendUnavailable,
            error_message: Some(message.into()),
            result: None,
            answer: None,
            answer_status_code: None,
            single: true,
            dropped: false,
            submit_time: Instant::now(),
            deadline: None,
            send_was_complete: true,
        }
    }

    pub fn matches_filter(&self, client_tx_id: &str, coord_tx_id: u64, shard_id: &str) -> bool {
        let shard_ok = shard_id.is_empty()
            || self
                .destination
                .as_ref()
                .and_then(|d| d.shard_id.as_ref())
                .map(|s| s.0 == shard_id)
                .unwrap_or(false);

        shard_ok && self.transaction.matches_filter(client_tx_id, coord_tx_id)
    }

    pub fn fill_from_success(&mut self, result: HttpResult) {
        self.answer_status_code = Some(result.status_code);
        self.result = Some(result);
        self.status = Status::Received;
    }

    /// The store-and-callback pattern's immediate response is only an
    /// acknowledgement that the backend accepted the request for async
    /// processing; the real answer arrives later via `processAnswer`.
    pub fn fill_from_async_accept(&mut self, result: HttpResult) {
        self.answer_status_code = Some(result.status_code);
        self.result = Some(result);
        self.status = Status::Sent;
    }

    pub fn fill_from_error(&mut self, status: Status, message: impl Into<String>, send_was_complete: bool) {
        self.status = status;
        self.error_message = Some(message.into());
        self.send_was_complete = send_was_complete;
    }
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticket={} status={} single={}",
            self.ticket, self.status, self.single
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_allocator_never_yields_zero_and_is_strictly_increasing() {
        let allocator = TicketAllocator::new();
        let mut last = Ticket::NONE;
        for _ in 0..1000 {
            let next = allocator.next_ticket();
            assert!(!next.is_none());
            assert!(next.0 > last.0);
            last = next;
        }
    }

    #[test]
    fn transaction_filter_wildcards_on_empty_or_zero() {
        let tx = TransactionIds::new("client-a", 42);
        assert!(tx.matches_filter("", 0));
        assert!(tx.matches_filter("client-a", 0));
        assert!(tx.matches_filter("", 42));
        assert!(tx.matches_filter("client-a", 42));
        assert!(!tx.matches_filter("client-b", 0));
        assert!(!tx.matches_filter("", 7));
    }

    #[test]
    fn transaction_new_treats_empty_string_and_zero_as_unset() {
        let tx = TransactionIds::new("", 0);
        assert_eq!(tx.client_tx_id, None);
        assert_eq!(tx.coord_tx_id, None);
    }

    #[test]
    fn status_terminal_classification() {
        for terminal in [
            Status::Received,
            Status::Timeout,
            Status::Error,
            Status::Dropped,
            Status::BackendUnavailable,
        ] {
            assert!(terminal.is_terminal());
        }
        for non_terminal in [Status::Submitted, Status::Sending, Status::Sent] {
            assert!(!non_terminal.is_terminal());
        }
    }

    #[test]
    fn record_matches_filter_checks_shard_when_given() {
        let ticket = Ticket(1);
        let destination = ResolvedDestination {
            shard_id: Some(ShardId("s01".to_string())),
            server_id: Some(ServerId("DBS-1".to_string())),
            endpoint: Url::parse("http://dbserver-1:8529").unwrap(),
        };
        let record = RequestRecord::new(
            ticket,
            TransactionIds::new("client-a", 1),
            Some(destination),
            true,
            None,
        );

        assert!(record.matches_filter("client-a", 1, "s01"));
        assert!(record.matches_filter("", 0, ""));
        assert!(!record.matches_filter("client-a", 1, "s02"));
    }

    #[test]
    fn async_accept_moves_to_sent_not_received() {
        let mut record = RequestRecord::new(Ticket(1), TransactionIds::default(), None, false, None);
        record.fill_from_async_accept(HttpResult {
            status_code: 202,
            headers: Vec::new(),
            body: Vec::new(),
        });
        assert_eq!(record.status, Status::Sent);

        let mut single = RequestRecord::new(Ticket(2), TransactionIds::default(), None, true, None);
        single.fill_from_success(HttpResult {
            status_code: 200,
            headers: Vec::new(),
            body: b"ok".to_vec(),
        });
        assert_eq!(single.status, Status::Received);
    }
}
