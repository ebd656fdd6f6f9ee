//! Error types for the reqwest-rotating-proxy crate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::fetch::BadProxyReporter;

/// Error returned by an upstream proxy provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request to the provider could not be completed.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The provider answered with a non-success status.
    #[error("provider returned status {0}")]
    Status(reqwest::StatusCode),
    /// The provider body was not a valid proxy list.
    #[error("malformed provider response: {0}")]
    Decode(#[from] serde_json::Error),
    /// The provider did not answer before the deadline.
    #[error("provider did not respond within {0:?}")]
    Timeout(Duration),
    /// No API token is configured for the provider.
    #[error("no provider token configured")]
    MissingToken,
    /// The configured provider URL is not a valid URL.
    #[error("invalid provider url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Error returned by the proxy pool.
///
/// Cloneable so that every caller waiting on the same refresh can receive
/// its outcome.
#[derive(Debug, Clone, Error)]
pub enum ProxyPoolError {
    /// Refreshing the pool from the provider failed. Pool state is unchanged.
    #[error("upstream proxy provider unavailable: {0}")]
    UpstreamUnavailable(#[source] Arc<ProviderError>),
    /// The active set is empty after refresh and recovery.
    #[error("No proxy available in pool")]
    NoProxiesAvailable,
}

impl From<ProviderError> for ProxyPoolError {
    fn from(err: ProviderError) -> Self {
        ProxyPoolError::UpstreamUnavailable(Arc::new(err))
    }
}

/// Error returned when an alert could not be delivered.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("alert delivery failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("alert channel returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Error returned by [`ProxiedFetch`](crate::fetch::ProxiedFetch).
#[derive(Debug, Error)]
pub enum FetchError {
    /// No proxy could be assigned.
    #[error(transparent)]
    Pool(#[from] ProxyPoolError),
    /// The HTTP client for the assigned proxy could not be built.
    #[error("failed to build client: {0}")]
    Client(#[source] reqwest::Error),
    /// The request failed in transit. The reporter lets the caller decide
    /// whether the proxy is to blame.
    #[error("request through {} failed: {source}", .reporter.describe())]
    Transport {
        #[source]
        source: reqwest::Error,
        reporter: BadProxyReporter,
    },
}

/// Error returned by the usage meter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UsageError {
    #[error("no pricing configured for model {0}")]
    UnknownModel(String),
}

/// Error returned by the task store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("invalid task id {0:?}")]
    InvalidId(String),
    #[error("task {0} not found")]
    NotFound(u64),
    #[error("unknown task status {0:?}")]
    UnknownStatus(String),
}
