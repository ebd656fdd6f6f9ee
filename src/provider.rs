//! Upstream proxy list provider.

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::proxy::ProxyEndpoint;

use async_trait::async_trait;
use log::debug;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// Source of proxy endpoints for the pool.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Whether credentials are available. An unconfigured provider puts the
    /// pool in pass-through mode.
    fn is_configured(&self) -> bool {
        true
    }

    /// Fetch the current list of endpoints.
    async fn fetch_proxies(&self) -> Result<Vec<ProxyEndpoint>, ProviderError>;
}

/// One page of the provider proxy list.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyListResponse {
    pub count: u64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<ProxyRecord>,
}

/// A proxy as described by the provider. Only the address and credentials
/// are used to build endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRecord {
    pub username: String,
    pub password: String,
    pub proxy_address: String,
    pub port: u16,
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default)]
    pub last_verification: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub asn_name: Option<String>,
    #[serde(default)]
    pub asn_number: Option<u64>,
    #[serde(default)]
    pub high_country_confidence: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ProxyRecord {
    /// Build the endpoint address for this record.
    pub fn to_endpoint(&self, scheme: &str) -> ProxyEndpoint {
        ProxyEndpoint::from_parts(scheme, &self.username, &self.password, &self.proxy_address, self.port)
    }
}

/// Client for the Webshare proxy list API. Only the first page is fetched.
#[derive(Debug, Clone)]
pub struct WebshareProvider {
    client: Client,
    config: ProviderConfig,
}

impl WebshareProvider {
    /// Create a provider client with the given configuration.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, config })
    }

    fn list_url(&self) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.config.api_url)?;
        url.query_pairs_mut()
            .append_pair("mode", "direct")
            .append_pair("page", "1")
            .append_pair("page_size", &self.config.page_size.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ProxyProvider for WebshareProvider {
    fn is_configured(&self) -> bool {
        self.config.token.is_some()
    }

    async fn fetch_proxies(&self) -> Result<Vec<ProxyEndpoint>, ProviderError> {
        let token = self.config.token.as_deref().ok_or(ProviderError::MissingToken)?;
        let url = self.list_url()?;
        debug!("Fetching proxy list from {}", url);

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Token {}", token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status));
        }

        let body = response.bytes().await?;
        let list: ProxyListResponse = serde_json::from_slice(&body)?;
        debug!(
            "Provider listed {} proxies ({} returned on first page)",
            list.count,
            list.results.len()
        );

        Ok(list
            .results
            .iter()
            .map(|record| record.to_endpoint(&self.config.scheme))
            .collect())
    }
}
