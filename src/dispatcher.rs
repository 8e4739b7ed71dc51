//! Dispatcher façade: the public surface that ties the destination
//! resolver, request preparer, ticket registry, and transport driver
//! together into the operations callers actually see.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{HeaderMap, Method};
use tracing::{instrument, warn};

use crate::clock::HybridLogicalClock;
use crate::config::ClusterCommConfig;
use crate::destination::{resolve_destination, ResolveOutcome};
use crate::errors::{ClusterCommError, ClusterCommErrorContext, ClusterCommResult};
use crate::identity::ServerIdentity;
use crate::preparer::{parse_coordinator_header, prepare_request, PrepareOptions};
use crate::record::{
    AnswerRequest, HttpResult, RequestRecord, Status, Ticket, TicketAllocator, TransactionIds,
};
use crate::registry::{CompletionCallback, TicketRegistry};
use crate::topology::ClusterTopology;
use crate::transport::{SubmitOptions, TransportCallbacks, TransportDriver, TransportError};
use crate::worker::BackgroundWorker;

/// Everything needed to issue one request, gathered into a single value so
/// `async_request`/`sync_request` take one argument instead of eight.
pub struct RequestOptions {
    pub destination: String,
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub client_tx_id: String,
    pub coord_tx_id: u64,
    /// Overrides the dispatcher's configured request timeout for this call.
    pub timeout: Option<Duration>,
    /// Overrides the transport's connect timeout for this call. Falls back
    /// to `timeout` (not the configured default) when absent or zero.
    pub init_timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(destination: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            method,
            path: path.into(),
            body: Vec::new(),
            headers: HeaderMap::new(),
            client_tx_id: String::new(),
            coord_tx_id: 0,
            timeout: None,
            init_timeout: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_transaction(mut self, client_tx_id: impl Into<String>, coord_tx_id: u64) -> Self {
        self.client_tx_id = client_tx_id.into();
        self.coord_tx_id = coord_tx_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_init_timeout(mut self, init_timeout: Duration) -> Self {
        self.init_timeout = Some(init_timeout);
        self
    }
}

/// Outcome of delivering an inbound async answer to the tracked ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAnswerOutcome {
    Applied,
    /// Nothing is tracking that ticket any more: it was already dropped,
    /// already timed out and swept, or never existed on this process.
    UnknownTicket,
}

/// The façade. Constructed once per node and shared behind an `Arc`.
pub struct ClusterComm {
    config: ClusterCommConfig,
    identity: Arc<dyn ServerIdentity>,
    topology: Arc<dyn ClusterTopology>,
    clock: Arc<dyn HybridLogicalClock>,
    transport: Arc<dyn TransportDriver>,
    registry: Arc<TicketRegistry>,
    tickets: TicketAllocator,
    /// Separate client for delivering outbound async answers: these are
    /// one-shot fire-and-forget POSTs, not tracked tickets, so they don't
    /// belong on the main transport driver's semaphore.
    answer_client: reqwest::Client,
    worker: tokio::sync::Mutex<Option<BackgroundWorker>>,
}

impl ClusterComm {
    pub fn new(
        config: ClusterCommConfig,
        identity: Arc<dyn ServerIdentity>,
        topology: Arc<dyn ClusterTopology>,
        clock: Arc<dyn HybridLogicalClock>,
        transport: Arc<dyn TransportDriver>,
    ) -> ClusterCommResult<Arc<Self>> {
        let answer_client = reqwest::ClientBuilder::new()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(ClusterCommError::from)?;

        Ok(Arc::new(Self {
            config,
            identity,
            topology,
            clock,
            transport,
            registry: Arc::new(TicketRegistry::new()),
            tickets: TicketAllocator::new(),
            answer_client,
            worker: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn registry(&self) -> &Arc<TicketRegistry> {
        &self.registry
    }

    /// Starts the background timeout-sweeping worker. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(BackgroundWorker::spawn(
                self.registry.clone(),
                self.transport.clone(),
                self.config.sweep_interval(),
            ));
        }
    }

    /// Stops accepting new submissions, then waits for the worker to exit.
    /// In-flight requests are left to run to completion; their results are
    /// simply discarded once no one is left to observe them.
    pub async fn shutdown(&self) {
        self.registry.stop_accepting();
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.shutdown().await;
        }
    }

    /// Fires a request and returns its ticket immediately, without waiting
    /// for a response. The real answer, if any, arrives later through
    /// `process_answer` and is observed via `wait`/`enquire` or `callback`.
    #[instrument(skip(self, req, callback), fields(destination = %req.destination))]
    pub async fn async_request(
        self: &Arc<Self>,
        req: RequestOptions,
        callback: Option<CompletionCallback>,
    ) -> Ticket {
        self.submit(req, false, callback).await
    }

    /// Fires a request and blocks until it reaches a terminal state or the
    /// request's own timeout elapses, whichever comes first. The one
    /// genuinely private piece of state here is a `oneshot` channel: no
    /// other waiter can observe it, so there's nothing to broadcast.
    #[instrument(skip(self, req), fields(destination = %req.destination))]
    pub async fn sync_request(self: &Arc<Self>, req: RequestOptions) -> RequestRecord {
        let local_timeout = req.timeout.unwrap_or_else(|| self.config.request_timeout());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let callback: CompletionCallback = Arc::new(move |record: &RequestRecord| {
            if !record.status.is_terminal() {
                return false;
            }
            if let Some(tx) = tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
                let _ = tx.send(record.clone());
            }
            true
        });

        let ticket = self.submit(req, true, Some(callback)).await;

        match tokio::time::timeout(local_timeout, rx).await {
            Ok(Ok(record)) => record,
            Ok(Err(_closed)) => self.registry.enquire(ticket),
            Err(_elapsed) => {
                self.drop_request(ticket, "", 0, "");
                let mut record = self.registry.enquire(ticket);
                if !record.status.is_terminal() {
                    record.status = Status::Timeout;
                    record.send_was_complete = false;
                }
                record
            }
        }
    }

    /// Read-only peek at a ticket's current state.
    pub fn enquire(&self, ticket: Ticket) -> RequestRecord {
        self.registry.enquire(ticket)
    }

    /// Blocks until the ticket (or, if `ticket` is `Ticket::NONE`, the
    /// first tracked request matching the wildcard filter) reaches a
    /// terminal state, or `timeout` elapses. A terminal observation removes
    /// the entry from the registry before returning it: `wait` is the
    /// primary removal point for the primary async_request/wait and
    /// perform_requests paths, which never register a caller callback.
    pub async fn wait(
        &self,
        ticket: Ticket,
        client_tx_id: &str,
        coord_tx_id: u64,
        shard_id: &str,
        timeout: Duration,
    ) -> RequestRecord {
        let deadline = Instant::now() + timeout;

        loop {
            let resolved = if ticket.is_none() {
                self.registry.find_matching(client_tx_id, coord_tx_id, shard_id)
            } else {
                Some(ticket)
            };
            let current = resolved.and_then(|t| self.registry.snapshot(t));

            if let Some(record) = &current {
                if record.status.is_terminal() {
                    let resolved = resolved.expect("current implies resolved is Some");
                    return self.registry.remove(resolved).unwrap_or_else(|| current.expect("checked Some above"));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return current.unwrap_or_else(|| RequestRecord::synthesised_dropped(ticket));
            }

            let _ = tokio::time::timeout(remaining, self.registry.notified()).await;
        }
    }

    /// Forgets a request before it completes. If `ticket` is given it is
    /// used directly; otherwise every tracked request matching the
    /// wildcard filter is dropped.
    pub fn drop_request(&self, ticket: Ticket, client_tx_id: &str, coord_tx_id: u64, shard_id: &str) {
        if !ticket.is_none() {
            self.registry.drop_ticket(ticket);
        } else {
            self.registry.drop_matching(client_tx_id, coord_tx_id, shard_id);
        }
    }

    /// Applies an inbound async answer (the body of a `PUT
    /// /_api/shard-comm` carrying an `X-Arango-Coordinator` header) to the
    /// ticket it correlates with.
    pub fn process_answer(
        &self,
        coordinator_header: &str,
        body: Vec<u8>,
        headers: Vec<(String, String)>,
    ) -> ClusterCommResult<ProcessAnswerOutcome> {
        let parsed = parse_coordinator_header(coordinator_header)
            .map_err(|message| ClusterCommError::Config(Cow::Owned(message)))?;

        let status_code = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("x-arango-async-status"))
            .and_then(|(_, value)| value.parse::<u16>().ok())
            .unwrap_or(200);

        let answer = AnswerRequest {
            body: body.clone(),
            headers: headers.clone(),
        };
        let result = HttpResult {
            status_code,
            headers,
            body,
        };

        match self.registry.update(parsed.ticket, move |record| {
            record.answer = Some(answer);
            record.fill_from_success(result);
        }) {
            Some(should_forget) => {
                if should_forget {
                    self.registry.remove(parsed.ticket);
                }
                Ok(ProcessAnswerOutcome::Applied)
            }
            None => {
                warn!(ticket = %parsed.ticket, "answer for unknown or already-forgotten ticket");
                Ok(ProcessAnswerOutcome::UnknownTicket)
            }
        }
    }

    /// The reverse direction: once a store-and-callback request has been
    /// handled locally, deliver its result back to the coordinator named
    /// in the `X-Arango-Coordinator` header that arrived with it. Fire and
    /// forget; a failed delivery is logged, never retried (the coordinator
    /// will itself time the ticket out).
    pub async fn async_answer(&self, coordinator_header: &str, result: HttpResult) -> ClusterCommResult<()> {
        let parsed = parse_coordinator_header(coordinator_header)
            .map_err(|message| ClusterCommError::Config(Cow::Owned(message)))?;

        let endpoint = self
            .topology
            .server_endpoint(&parsed.server_id)
            .await
            .comm_context(format!("no endpoint known for coordinator '{}'", parsed.server_id))?;

        let mut url = endpoint;
        {
            let mut path = url.path().trim_end_matches('/').to_string();
            path.push_str("/_api/shard-comm");
            url.set_path(&path);
        }

        let outcome = self
            .answer_client
            .put(url)
            .header("x-arango-coordinator", coordinator_header)
            .header(
                http::header::AUTHORIZATION,
                self.identity.authentication_header_value(),
            )
            .header("x-arango-async-status", result.status_code.to_string())
            .body(result.body)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                warn!(ticket = %parsed.ticket, status = %response.status(), "coordinator rejected async answer");
                Ok(())
            }
            Err(err) => {
                warn!(ticket = %parsed.ticket, %err, "failed delivering async answer");
                Err(ClusterCommError::from(err))
            }
        }
    }

    async fn submit(
        self: &Arc<Self>,
        req: RequestOptions,
        single: bool,
        callback: Option<CompletionCallback>,
    ) -> Ticket {
        let ticket = self.tickets.next_ticket();
        let transaction = TransactionIds::new(req.client_tx_id, req.coord_tx_id);

        if !self.registry.is_accepting() {
            let record = RequestRecord::terminal_backend_unavailable(
                ticket,
                transaction,
                "dispatcher is shutting down",
            );
            self.finish_immediately(record, callback);
            return ticket;
        }

        let outcome = resolve_destination(&req.destination, &self.topology, tracing::Level::WARN).await;
        let resolved = match outcome {
            ResolveOutcome::Resolved(r) => r,
            ResolveOutcome::Failed(message) => {
                let record = RequestRecord::terminal_backend_unavailable(ticket, transaction, message);
                self.finish_immediately(record, callback);
                return ticket;
            }
        };

        let nolock_shards = self.config.nolock_shard_set();
        let prepare_options = PrepareOptions {
            hlc_header_name: &self.config.hlc_header_name,
            nolock_shards: &nolock_shards,
            single_request: single,
            ticket,
            transaction: &transaction,
        };

        let prepared = match prepare_request(
            &resolved,
            req.method,
            &req.path,
            req.body,
            &req.headers,
            &self.identity,
            &self.clock,
            &prepare_options,
        ) {
            Ok(p) => p,
            Err(err) => {
                let record = RequestRecord::terminal_backend_unavailable(
                    ticket,
                    transaction,
                    format!("failed building request headers: {err}"),
                );
                self.finish_immediately(record, callback);
                return ticket;
            }
        };

        // `connectTimeout = initTimeout` (or `timeout` if `initTimeout` is
        // absent/zero), `requestTimeout = timeout` — both derived from this
        // call's own values, not the dispatcher's configured defaults. A
        // call that overrides neither still falls back to the dispatcher's
        // two distinct configured defaults rather than collapsing onto one.
        let request_timeout = req.timeout.unwrap_or_else(|| self.config.request_timeout());
        let connect_timeout = match req.init_timeout.filter(|d| !d.is_zero()) {
            Some(init_timeout) => init_timeout,
            None => req.timeout.unwrap_or_else(|| self.config.connect_timeout()),
        };

        let record = RequestRecord::new(ticket, transaction, Some(resolved), single, Some(request_timeout));
        self.registry.insert(ticket, record.submit_time, record, callback);

        let callbacks: Arc<dyn TransportCallbacks> = Arc::new(DispatchCallback {
            registry: self.registry.clone(),
        });

        self.transport.clone().submit(
            ticket,
            prepared,
            callbacks,
            SubmitOptions {
                connect_timeout,
                request_timeout,
            },
        );

        ticket
    }

    /// A record that never reached the transport (shutdown, resolution
    /// failure, header-building failure) is already terminal: there's no
    /// later `update` that will invoke `callback`, so invoke it here and
    /// only keep the record around if the caller didn't ask to forget it.
    fn finish_immediately(&self, record: RequestRecord, callback: Option<CompletionCallback>) {
        let ticket = record.ticket;
        let forget = callback.as_ref().map(|cb| cb(&record)).unwrap_or(false);
        if forget {
            return;
        }
        self.registry.insert(ticket, record.submit_time, record, None);
    }
}

struct DispatchCallback {
    registry: Arc<TicketRegistry>,
}

impl DispatchCallback {
    fn finish(&self, ticket: Ticket, mutate: impl FnOnce(&mut RequestRecord)) {
        if let Some(should_forget) = self.registry.update(ticket, mutate) {
            if should_forget {
                self.registry.remove(ticket);
            }
        }
    }
}

impl TransportCallbacks for DispatchCallback {
    fn on_sending(&self, ticket: Ticket) {
        let _ = self.registry.update(ticket, |record| {
            if record.status == Status::Submitted {
                record.status = Status::Sending;
            }
        });
    }

    fn on_success(&self, ticket: Ticket, result: HttpResult) {
        self.finish(ticket, move |record| {
            if record.single {
                record.fill_from_success(result);
            } else {
                record.fill_from_async_accept(result);
            }
        });
    }

    fn on_error(&self, ticket: Ticket, error: TransportError) {
        self.finish(ticket, move |record| match error {
            TransportError::Connect { message } => {
                record.fill_from_error(Status::BackendUnavailable, message, false);
            }
            TransportError::Timeout { send_complete } => {
                record.fill_from_error(Status::Timeout, "request timed out", send_complete);
            }
            TransportError::Http { message } => {
                record.fill_from_error(Status::Error, message, true);
            }
        });
    }
}
