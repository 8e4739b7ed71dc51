//! The inbound half of the async-answer pattern: an HTTP endpoint backend
//! servers `PUT` their results to once a stored request has been handled.
//! Styled after `frontend/http_proxy.rs` and `frontend/errors.rs`.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::Router;
use derive_more::From;
use tracing::{instrument, warn};

use crate::dispatcher::{ClusterComm, ProcessAnswerOutcome};
use crate::errors::ClusterCommError;

const COORDINATOR_HEADER: &str = "x-arango-coordinator";

pub fn router(comm: Arc<ClusterComm>) -> Router {
    Router::new()
        .route("/_api/shard-comm", put(shard_comm))
        .layer(Extension(comm))
}

#[derive(Debug, From)]
enum ShardCommError {
    MissingCoordinatorHeader,
    Dispatch(ClusterCommError),
    UnknownTicket,
}

impl IntoResponse for ShardCommError {
    #[instrument(level = "trace")]
    fn into_response(self) -> Response {
        match self {
            Self::MissingCoordinatorHeader => (
                StatusCode::BAD_REQUEST,
                format!("missing required '{COORDINATOR_HEADER}' header"),
            )
                .into_response(),
            Self::Dispatch(err) => {
                warn!(%err, "malformed async answer");
                (StatusCode::BAD_REQUEST, err.to_string()).into_response()
            }
            Self::UnknownTicket => {
                (StatusCode::NOT_FOUND, "no tracked request for that ticket").into_response()
            }
        }
    }
}

#[instrument(skip(comm, headers, body))]
async fn shard_comm(
    Extension(comm): Extension<Arc<ClusterComm>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, ShardCommError> {
    let coordinator_header = headers
        .get(COORDINATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ShardCommError::MissingCoordinatorHeader)?
        .to_string();

    let forwarded_headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    match comm.process_answer(&coordinator_header, body.to_vec(), forwarded_headers)? {
        ProcessAnswerOutcome::Applied => Ok(StatusCode::NO_CONTENT),
        ProcessAnswerOutcome::UnknownTicket => Err(ShardCommError::UnknownTicket),
    }
}
