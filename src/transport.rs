//! Transport driver: a shared multi-connection HTTP engine owning N
//! concurrent in-flight requests. Implemented atop `reqwest`, the same
//! non-blocking HTTP client stack `web3_proxy` builds its shared
//! `http_client` from (`app.rs`).
//!
//! The original design multiplexes sockets on one dedicated thread via
//! `submit`/`workOnce`/`wait`. Under tokio the natural translation is N
//! concurrently spawned tasks bounded by a semaphore — the reactor already
//! drives the I/O, so there is no separate `workOnce` step to hand-write.
//! `workOnce`/`wait` are kept on the trait for contract fidelity but are
//! no-ops here; see DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metered::{metered, HitCount, ResponseTime};
use tokio::sync::Semaphore;
use tracing::{trace, warn};

use crate::preparer::PreparedRequest;
use crate::record::{HttpResult, Ticket};

#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// Why a submitted request did not produce a response.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The connection could not be established. Terminal
    /// `BackendUnavailable`; eligible for `performRequests` backoff retry.
    Connect { message: String },
    /// The deadline passed before the exchange completed.
    /// `send_complete = false` marks it retry-eligible.
    Timeout { send_complete: bool },
    /// A completed exchange that the transport itself considers an
    /// error (malformed response, etc). Terminal `Error`; never retried.
    Http { message: String },
}

/// Invoked from the task driving the request. `on_sending` fires once,
/// right before the request actually goes out; exactly one of `on_success`
/// / `on_error` follows it, also exactly once.
pub trait TransportCallbacks: Send + Sync {
    fn on_sending(&self, ticket: Ticket);
    fn on_success(&self, ticket: Ticket, result: HttpResult);
    fn on_error(&self, ticket: Ticket, error: TransportError);
}

/// `submit` consumes `Arc<Self>` rather than `&self` so the spawned
/// per-request task can own a strong reference without the driver having
/// to keep a self-referential `Arc` around internally.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    fn submit(
        self: Arc<Self>,
        ticket: Ticket,
        request: PreparedRequest,
        callbacks: Arc<dyn TransportCallbacks>,
        options: SubmitOptions,
    );

    /// One non-blocking drive of I/O. No-op under the tokio-reactor
    /// translation described above.
    async fn work_once(&self) {}

    /// Blocks until I/O or an explicit wakeup. No-op here.
    async fn wait(&self) {}
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    metrics: ReqwestTransportMetrics,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            client,
            in_flight: Arc::new(Semaphore::new(max_concurrent.max(1))),
            metrics: ReqwestTransportMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &ReqwestTransportMetrics {
        &self.metrics
    }

    pub fn shared_client(&self) -> reqwest::Client {
        self.client.clone()
    }
}

#[metered(registry = ReqwestTransportMetrics, visibility = pub)]
impl ReqwestTransport {
    #[measure([HitCount, ResponseTime])]
    fn drive(
        self: Arc<Self>,
        ticket: Ticket,
        request: PreparedRequest,
        callbacks: Arc<dyn TransportCallbacks>,
        options: SubmitOptions,
    ) {
        tokio::spawn(async move {
            let Ok(_permit) = self.in_flight.acquire().await else {
                return;
            };

            trace!(%ticket, url = %request.url, "submitting request");
            callbacks.on_sending(ticket);

            let builder = self
                .client
                .request(request.method, request.url.clone())
                .headers(request.headers)
                .timeout(options.request_timeout)
                .body(request.body);

            match tokio::time::timeout(options.request_timeout, builder.send()).await {
                Ok(Ok(response)) => {
                    let status_code = response.status().as_u16();
                    let headers = response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.to_string(),
                                value.to_str().unwrap_or_default().to_string(),
                            )
                        })
                        .collect();

                    match response.bytes().await {
                        Ok(body) => callbacks.on_success(
                            ticket,
                            HttpResult {
                                status_code,
                                headers,
                                body: body.to_vec(),
                            },
                        ),
                        Err(err) => {
                            warn!(%ticket, %err, "failed reading response body");
                            callbacks.on_error(
                                ticket,
                                TransportError::Http {
                                    message: err.to_string(),
                                },
                            );
                        }
                    }
                }
                Ok(Err(err)) => {
                    if err.is_connect() {
                        callbacks.on_error(
                            ticket,
                            TransportError::Connect {
                                message: err.to_string(),
                            },
                        );
                    } else if err.is_timeout() {
                        callbacks.on_error(ticket, TransportError::Timeout { send_complete: false });
                    } else {
                        callbacks.on_error(
                            ticket,
                            TransportError::Http {
                                message: err.to_string(),
                            },
                        );
                    }
                }
                Err(_elapsed) => {
                    callbacks.on_error(ticket, TransportError::Timeout { send_complete: false });
                }
            }
        });
    }
}

#[async_trait]
impl TransportDriver for ReqwestTransport {
    fn submit(
        self: Arc<Self>,
        ticket: Ticket,
        request: PreparedRequest,
        callbacks: Arc<dyn TransportCallbacks>,
        options: SubmitOptions,
    ) {
        self.drive(ticket, request, callbacks, options);
    }
}
