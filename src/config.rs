//! Configuration for the proxy pool and its collaborators.

use log::warn;
use std::env;
use std::time::Duration;

/// Default proxy list endpoint of the upstream provider.
pub const DEFAULT_PROVIDER_URL: &str = "https://proxy.webshare.io/api/v2/proxy/list/";

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Minimum time between provider refreshes while the pool has members.
    pub refresh_window: Duration,
    /// Deadline for a single provider refresh.
    pub refresh_timeout: Duration,
    /// How long a quarantined proxy waits before it is put back in rotation.
    pub retry_interval: Duration,
    /// Bad fraction at or above which the pool logs that it is degraded.
    pub degraded_threshold: f64,
    /// Bad fraction above which an alert is sent.
    pub alert_threshold: f64,
    /// Throttle key for degradation alerts.
    pub alert_key: String,
    /// Minimum time between two degradation alerts.
    pub alert_interval: Duration,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// Load the configuration from `PROXY_REFRESH_WINDOW_SECS` and
    /// `PROXY_RETRY_INTERVAL_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let mut builder = Self::builder();
        if let Some(window) = env_secs("PROXY_REFRESH_WINDOW_SECS") {
            builder = builder.refresh_window(window);
        }
        if let Some(retry) = env_secs("PROXY_RETRY_INTERVAL_SECS") {
            builder = builder.retry_interval(retry);
        }
        builder.build()
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    refresh_window: Option<Duration>,
    refresh_timeout: Option<Duration>,
    retry_interval: Option<Duration>,
    degraded_threshold: Option<f64>,
    alert_threshold: Option<f64>,
    alert_key: Option<String>,
    alert_interval: Option<Duration>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            refresh_window: None,
            refresh_timeout: None,
            retry_interval: None,
            degraded_threshold: None,
            alert_threshold: None,
            alert_key: None,
            alert_interval: None,
        }
    }

    /// Set the minimum time between provider refreshes.
    pub fn refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = Some(window);
        self
    }

    /// Set the deadline for a single provider refresh.
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = Some(timeout);
        self
    }

    /// Set how long a quarantined proxy waits before being retried.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Set the bad fraction at which the pool reports itself degraded.
    pub fn degraded_threshold(mut self, fraction: f64) -> Self {
        self.degraded_threshold = Some(fraction);
        self
    }

    /// Set the bad fraction above which an alert is sent.
    pub fn alert_threshold(mut self, fraction: f64) -> Self {
        self.alert_threshold = Some(fraction);
        self
    }

    /// Set the throttle key for degradation alerts.
    pub fn alert_key(mut self, key: impl Into<String>) -> Self {
        self.alert_key = Some(key.into());
        self
    }

    /// Set the minimum time between two degradation alerts.
    pub fn alert_interval(mut self, interval: Duration) -> Self {
        self.alert_interval = Some(interval);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            refresh_window: self.refresh_window.unwrap_or(Duration::from_secs(60 * 60)),
            refresh_timeout: self.refresh_timeout.unwrap_or(Duration::from_secs(30)),
            retry_interval: self.retry_interval.unwrap_or(Duration::from_secs(2 * 60 * 60)),
            degraded_threshold: self.degraded_threshold.unwrap_or(0.10),
            alert_threshold: self.alert_threshold.unwrap_or(0.25),
            alert_key: self.alert_key.unwrap_or_else(|| "proxy-bad".to_string()),
            alert_interval: self.alert_interval.unwrap_or(Duration::from_secs(60 * 60)),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the upstream proxy provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Proxy list endpoint.
    pub api_url: String,
    /// API token. Without one the pool routes every request directly.
    pub token: Option<String>,
    /// Number of proxies requested from the first page.
    pub page_size: u32,
    /// Scheme used to build proxy addresses.
    pub scheme: String,
    /// Timeout for the provider HTTP request.
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Create a configuration for the default endpoint with the given token.
    pub fn new(token: Option<String>) -> Self {
        Self {
            api_url: DEFAULT_PROVIDER_URL.to_string(),
            token,
            page_size: 100,
            scheme: "http".to_string(),
            request_timeout: Duration::from_secs(20),
        }
    }

    /// Set the proxy list endpoint.
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Set the number of proxies requested.
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set the scheme used to build proxy addresses.
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Load the configuration from `WEBSHARE_TOKEN` and `WEBSHARE_API_URL`.
    pub fn from_env() -> Self {
        let token = env::var("WEBSHARE_TOKEN").ok().filter(|t| !t.is_empty());
        let config = Self::new(token);
        match env::var("WEBSHARE_API_URL") {
            Ok(url) if !url.is_empty() => config.api_url(url),
            _ => config,
        }
    }
}

/// Configuration for the alert channel.
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    /// Webhook receiving alert messages. Alerts are only logged when unset.
    pub webhook_url: Option<String>,
}

impl NotifierConfig {
    /// Load the configuration from `DISCORD_WEBHOOK_URL`.
    pub fn from_env() -> Self {
        Self {
            webhook_url: env::var("DISCORD_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
        }
    }
}

/// Configuration for requests sent through the pool.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Timeout applied to requests that do not carry their own.
    pub request_timeout: Duration,
    /// Send a randomized mobile Safari User-Agent when the request has none.
    pub randomize_user_agent: bool,
    /// Maximum requests per second sent through a single proxy.
    pub max_requests_per_second: Option<f64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            randomize_user_agent: false,
            max_requests_per_second: None,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_defaults() {
        let config = ProxyPoolConfig::default();
        assert_eq!(config.refresh_window, Duration::from_secs(3600));
        assert_eq!(config.retry_interval, Duration::from_secs(7200));
        assert_eq!(config.degraded_threshold, 0.10);
        assert_eq!(config.alert_threshold, 0.25);
        assert_eq!(config.alert_key, "proxy-bad");
        assert_eq!(config.alert_interval, Duration::from_secs(3600));
    }

    #[test]
    fn builder_overrides() {
        let config = ProxyPoolConfig::builder()
            .retry_interval(Duration::from_secs(30 * 60))
            .alert_threshold(0.5)
            .alert_key("pool")
            .build();
        assert_eq!(config.retry_interval, Duration::from_secs(1800));
        assert_eq!(config.alert_threshold, 0.5);
        assert_eq!(config.alert_key, "pool");
        assert_eq!(config.refresh_window, Duration::from_secs(3600));
    }

    #[test]
    fn provider_defaults() {
        let config = ProviderConfig::new(Some("secret".into()));
        assert_eq!(config.api_url, DEFAULT_PROVIDER_URL);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.scheme, "http");
    }
}
