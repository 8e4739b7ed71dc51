//! End-to-end coverage driving the full stack (resolver, preparer,
//! registry, transport) against a real HTTP server, the way wiremock is
//! used across the example pack's own integration suites.

use std::sync::Arc;
use std::time::Duration;

use cluster_comm::dispatcher::{ClusterComm, ProcessAnswerOutcome, RequestOptions};
use cluster_comm::fanout::{perform_requests, FanoutOptions, FanoutRequest};
use cluster_comm::record::{ServerId, ShardId, Status};
use cluster_comm::ClusterCommConfig;

use cluster_comm::clock::MonotonicHlc;
use cluster_comm::identity::StaticIdentity;
use cluster_comm::topology::{ClusterTopology, StaticTopology};
use cluster_comm::transport::{ReqwestTransport, TransportDriver};

use http::Method;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> ClusterCommConfig {
    ClusterCommConfig {
        self_server_id: "CRDN-TEST".to_string(),
        request_timeout_secs: 2.0,
        connect_timeout_secs: 1.0,
        max_concurrent_requests: 16,
        sweep_interval_secs: 0.05,
        ..ClusterCommConfig::default()
    }
}

fn build_comm(topology: StaticTopology) -> Arc<ClusterComm> {
    build_comm_with_config(topology, test_config())
}

fn build_comm_with_config(topology: StaticTopology, config: ClusterCommConfig) -> Arc<ClusterComm> {
    let identity = Arc::new(StaticIdentity::new(
        ServerId(config.self_server_id.clone()),
        "Bearer test-token",
    ));
    let clock = Arc::new(MonotonicHlc::new());
    let transport = ReqwestTransport::new(reqwest::Client::new(), config.max_concurrent_requests);
    let transport: Arc<dyn TransportDriver> = transport;
    let topology: Arc<dyn ClusterTopology> = Arc::new(topology);

    ClusterComm::new(config, identity, topology, clock, transport).expect("config builds a client")
}

#[tokio::test]
async fn sync_request_routes_to_the_shards_responsible_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_api/document/c/1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{\"ok\":true}".to_vec()))
        .mount(&server)
        .await;

    let topology = StaticTopology::new()
        .with_shard(ShardId("s01".into()), vec![ServerId("DBS-1".into())])
        .with_endpoint(ServerId("DBS-1".into()), Url::parse(&server.uri()).unwrap());

    let comm = build_comm(topology);

    let record = comm
        .sync_request(RequestOptions::new("shard:s01", Method::GET, "/_api/document/c/1"))
        .await;

    assert_eq!(record.status, Status::Received);
    assert_eq!(record.result.unwrap().status_code, 200);
}

#[tokio::test]
async fn sync_request_against_unknown_shard_is_backend_unavailable() {
    let comm = build_comm(StaticTopology::new());

    let record = comm
        .sync_request(RequestOptions::new("shard:ghost", Method::GET, "/_api/document/c/1"))
        .await;

    assert_eq!(record.status, Status::BackendUnavailable);
    assert!(record.error_message.unwrap().contains("ghost"));
}

#[tokio::test]
async fn sync_request_against_a_literal_endpoint_skips_the_topology() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/_api/document/c/2"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let raw_endpoint = server.uri().replacen("http://", "tcp://", 1);
    let comm = build_comm(StaticTopology::new());

    let record = comm
        .sync_request(RequestOptions::new(raw_endpoint, Method::PUT, "/_api/document/c/2"))
        .await;

    assert_eq!(record.status, Status::Received);
    assert_eq!(record.result.unwrap().status_code, 201);
}

#[tokio::test]
async fn async_request_is_correlated_by_a_later_process_answer() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/_api/document/c/3"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let topology = StaticTopology::new()
        .with_shard(ShardId("s01".into()), vec![ServerId("DBS-1".into())])
        .with_endpoint(ServerId("DBS-1".into()), Url::parse(&server.uri()).unwrap());
    let comm = build_comm(topology);

    let ticket = comm
        .async_request(
            RequestOptions::new("shard:s01", Method::PUT, "/_api/document/c/3").with_transaction("client-a", 9),
            None,
        )
        .await;

    let sent = comm
        .wait(ticket, "", 0, "", Duration::from_millis(300))
        .await;
    // The store response only acknowledges receipt; it must not be
    // reported as the final answer.
    assert_ne!(sent.status, Status::Received);

    let coordinator_header = format!("CRDN-TEST:{ticket}:client-a:9");
    let outcome = comm
        .process_answer(&coordinator_header, b"{\"done\":true}".to_vec(), Vec::new())
        .unwrap();
    assert_eq!(outcome, ProcessAnswerOutcome::Applied);

    let final_record = comm.enquire(ticket);
    assert_eq!(final_record.status, Status::Received);
    assert_eq!(final_record.answer.unwrap().body, b"{\"done\":true}".to_vec());
}

#[tokio::test]
async fn process_answer_for_an_unknown_ticket_is_reported_not_applied() {
    let comm = build_comm(StaticTopology::new());
    let outcome = comm
        .process_answer("CRDN-TEST:99999:client-a:1", Vec::new(), Vec::new())
        .unwrap();
    assert_eq!(outcome, ProcessAnswerOutcome::UnknownTicket);
}

#[tokio::test]
async fn fanout_retries_a_backend_that_recovers() {
    let server = MockServer::start().await;
    // First attempt: connection refused by never mounting a responder for
    // it would hang; instead simulate an unhealthy backend with a 503,
    // then a healthy response on the retry via wiremock's up_to_n_times.
    Mock::given(method("GET"))
        .and(path("/_api/document/c/4"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_api/document/c/4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"recovered".to_vec()))
        .mount(&server)
        .await;

    let topology = StaticTopology::new()
        .with_shard(ShardId("s01".into()), vec![ServerId("DBS-1".into())])
        .with_endpoint(ServerId("DBS-1".into()), Url::parse(&server.uri()).unwrap());
    let comm = build_comm(topology);

    let requests = vec![
        FanoutRequest {
            destination: "shard:s01".to_string(),
            method: Method::GET,
            path: "/_api/document/c/4".to_string(),
            body: Vec::new(),
            headers: Default::default(),
            shard_id: "s01".to_string(),
        },
        FanoutRequest {
            destination: "shard:s01".to_string(),
            method: Method::GET,
            path: "/_api/document/c/4".to_string(),
            body: Vec::new(),
            headers: Default::default(),
            shard_id: "s01".to_string(),
        },
    ];

    let options = FanoutOptions {
        client_tx_id: String::new(),
        coord_tx_id: 0,
        local_timeout: Duration::from_millis(500),
        global_timeout: Duration::from_secs(5),
    };

    let results = perform_requests(&comm, requests, options).await;
    assert_eq!(results.len(), 2);
    for record in results {
        assert_eq!(record.status, Status::Received);
    }
}

#[tokio::test]
async fn fanout_drops_legs_that_outlive_the_global_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_api/document/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let topology = StaticTopology::new()
        .with_shard(ShardId("s01".into()), vec![ServerId("DBS-1".into())])
        .with_endpoint(ServerId("DBS-1".into()), Url::parse(&server.uri()).unwrap());
    let comm = build_comm(topology);

    let requests = vec![
        FanoutRequest {
            destination: "shard:s01".to_string(),
            method: Method::GET,
            path: "/_api/document/slow".to_string(),
            body: Vec::new(),
            headers: Default::default(),
            shard_id: "s01".to_string(),
        },
        // A shard with no responsible server never reaches the transport
        // at all, so it resolves to a terminal record well before the
        // fleet deadline.
        FanoutRequest {
            destination: "shard:ghost".to_string(),
            method: Method::GET,
            path: "/_api/document/slow".to_string(),
            body: Vec::new(),
            headers: Default::default(),
            shard_id: "ghost".to_string(),
        },
    ];

    let options = FanoutOptions {
        client_tx_id: String::new(),
        coord_tx_id: 0,
        local_timeout: Duration::from_millis(150),
        global_timeout: Duration::from_millis(300),
    };

    let results = perform_requests(&comm, requests, options).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, Status::Timeout);
    assert_eq!(results[1].status, Status::BackendUnavailable);
}

#[tokio::test]
async fn drop_request_discards_a_ticket_before_it_completes() {
    let comm = build_comm(StaticTopology::new());
    let ticket = comm
        .async_request(RequestOptions::new("shard:unreachable", Method::GET, "/x"), None)
        .await;

    // Resolution already failed, so the record is terminal and tracked;
    // dropping it removes it outright.
    comm.drop_request(ticket, "", 0, "");
    let record = comm.enquire(ticket);
    assert_eq!(record.status, Status::Dropped);
    assert!(record.dropped);
}

#[tokio::test]
async fn start_and_shutdown_are_idempotent() {
    let comm = build_comm(StaticTopology::new());
    comm.start().await;
    comm.start().await;
    comm.shutdown().await;
}

