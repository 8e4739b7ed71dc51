//! Crate-wide error type for plumbing failures that have no `RequestRecord`
//! to report through (config loading, worker startup, ...). Per-ticket
//! failures (resolution, connect, timeout, HTTP errors) are never turned
//! into a `ClusterCommError` — they stay terminal `RequestRecord`s.

use std::borrow::Cow;

use derive_more::{Display, Error, From};

pub type ClusterCommResult<T> = Result<T, ClusterCommError>;

#[derive(Debug, Display, Error, From)]
pub enum ClusterCommError {
    #[display(fmt = "{_0}")]
    #[error(ignore)]
    Anyhow(anyhow::Error),
    #[display(fmt = "config error: {_0}")]
    #[error(ignore)]
    #[from(ignore)]
    Config(Cow<'static, str>),
    Io(std::io::Error),
    Join(tokio::task::JoinError),
    #[display(fmt = "invalid header value: {_0}")]
    InvalidHeaderValue(http::header::InvalidHeaderValue),
    #[display(fmt = "invalid uri: {_0}")]
    InvalidUri(http::uri::InvalidUri),
    Reqwest(reqwest::Error),
    SerdeJson(serde_json::Error),
    TomlDecode(toml::de::Error),
    /// A structural impossibility: e.g. a record with no resolution error
    /// and no transport request.
    #[display(fmt = "internal invariant violated: {_0}")]
    #[error(ignore)]
    #[from(ignore)]
    InternalInvariant(Cow<'static, str>),
    /// Wraps another error with a human-readable breadcrumb.
    #[display(fmt = "{_1}: {_0:?}")]
    #[error(ignore)]
    #[from(ignore)]
    WithContext(Option<Box<ClusterCommError>>, Cow<'static, str>),
}

pub trait ClusterCommErrorContext<T> {
    fn comm_context<S: Into<Cow<'static, str>>>(self, msg: S) -> ClusterCommResult<T>;
}

impl<T> ClusterCommErrorContext<T> for Option<T> {
    fn comm_context<S: Into<Cow<'static, str>>>(self, msg: S) -> ClusterCommResult<T> {
        self.ok_or_else(|| ClusterCommError::WithContext(None, msg.into()))
    }
}

impl<T, E> ClusterCommErrorContext<T> for Result<T, E>
where
    E: Into<ClusterCommError>,
{
    fn comm_context<S: Into<Cow<'static, str>>>(self, msg: S) -> ClusterCommResult<T> {
        self.map_err(|err| ClusterCommError::WithContext(Some(Box::new(err.into())), msg.into()))
    }
}
