//! Sending requests through the pool.

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::pool::ProxyPool;
use crate::proxy::{ProxyAssignment, ProxyEndpoint};
use crate::utils;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Request, Response, Url};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

type EndpointLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Lets the caller report the proxy that served a request as bad.
///
/// The pool never decides on its own that a proxy failed; whoever holds the
/// response does.
#[derive(Clone)]
pub struct BadProxyReporter {
    pool: Arc<ProxyPool>,
    assignment: ProxyAssignment,
}

impl BadProxyReporter {
    pub(crate) fn new(pool: Arc<ProxyPool>, assignment: ProxyAssignment) -> Self {
        Self { pool, assignment }
    }

    /// Quarantine the proxy used for the request. Returns `false` when the
    /// request was not proxied.
    pub fn mark_bad(&self) -> bool {
        match &self.assignment {
            ProxyAssignment::Proxy(endpoint) => {
                self.pool.mark_bad(endpoint);
                true
            }
            ProxyAssignment::Direct => false,
        }
    }

    /// The proxy used for the request, if any.
    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.assignment.endpoint()
    }

    pub(crate) fn describe(&self) -> String {
        match &self.assignment {
            ProxyAssignment::Proxy(endpoint) => endpoint.to_string(),
            ProxyAssignment::Direct => "direct connection".to_string(),
        }
    }
}

impl fmt::Debug for BadProxyReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BadProxyReporter")
            .field("proxy", &self.describe())
            .finish()
    }
}

/// A response together with the means to blame its proxy.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub response: Response,
    reporter: BadProxyReporter,
}

impl ProxiedResponse {
    /// Quarantine the proxy that served this response.
    pub fn mark_proxy_bad(&self) -> bool {
        self.reporter.mark_bad()
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.reporter.proxy()
    }

    pub fn into_parts(self) -> (Response, BadProxyReporter) {
        (self.response, self.reporter)
    }
}

/// Issues requests through the next proxy of the pool.
pub struct ProxiedFetch {
    pool: Arc<ProxyPool>,
    config: FetchConfig,
    limiters: Mutex<HashMap<ProxyEndpoint, Arc<EndpointLimiter>>>,
}

impl ProxiedFetch {
    pub fn new(pool: Arc<ProxyPool>, config: FetchConfig) -> Self {
        Self {
            pool,
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Send a GET request to `url`.
    pub async fn get(&self, url: Url) -> Result<ProxiedResponse, FetchError> {
        self.execute(Request::new(Method::GET, url)).await
    }

    /// Send `request` through the next proxy, or directly when the pool is in
    /// pass-through mode.
    ///
    /// A timeout set on the request takes precedence over the configured one.
    /// Dropping the returned future aborts the request.
    pub async fn execute(&self, mut request: Request) -> Result<ProxiedResponse, FetchError> {
        let assignment = self.pool.get_proxy().await?;

        if let Some(limiter) = assignment.endpoint().and_then(|e| self.limiter_for(e)) {
            limiter.until_ready().await;
        }

        let client = build_client(&assignment).map_err(FetchError::Client)?;
        self.prepare(&mut request);
        let reporter = BadProxyReporter::new(Arc::clone(&self.pool), assignment);
        info!("Fetching {} via {}", request.url(), reporter.describe());

        match client.execute(request).await {
            Ok(response) => {
                debug!("{} answered {}", reporter.describe(), response.status());
                Ok(ProxiedResponse { response, reporter })
            }
            Err(source) => Err(FetchError::Transport { source, reporter }),
        }
    }

    fn prepare(&self, request: &mut Request) {
        if request.timeout().is_none() {
            *request.timeout_mut() = Some(self.config.request_timeout);
        }
        if self.config.randomize_user_agent && !request.headers().contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(&utils::generate_user_agent()) {
                request.headers_mut().insert(USER_AGENT, value);
            }
        }
    }

    /// The pacing limiter of `endpoint`. Limiters of endpoints the pool has
    /// forgotten are discarded whenever a new endpoint shows up.
    fn limiter_for(&self, endpoint: &ProxyEndpoint) -> Option<Arc<EndpointLimiter>> {
        let rps = self.config.max_requests_per_second?;
        let mut limiters = self.limiters.lock();
        if let Some(limiter) = limiters.get(endpoint) {
            return Some(Arc::clone(limiter));
        }

        let before = limiters.len();
        limiters.retain(|known, _| self.pool.contains(known));
        if limiters.len() < before {
            debug!("Discarded {} rate limiters of retired proxies", before - limiters.len());
        }

        let per_second = NonZeroU32::new(rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));
        limiters.insert(endpoint.clone(), Arc::clone(&limiter));
        Some(limiter)
    }
}

/// Build a client routed through the assigned proxy, or one that ignores
/// system proxies for direct routing.
pub(crate) fn build_client(assignment: &ProxyAssignment) -> Result<Client, reqwest::Error> {
    let builder = Client::builder();
    let builder = match assignment {
        ProxyAssignment::Proxy(endpoint) => builder.proxy(endpoint.to_reqwest_proxy()?),
        ProxyAssignment::Direct => builder.no_proxy(),
    };
    builder.build()
}
