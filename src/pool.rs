//! Core proxy pool implementation.
//!
//! The pool keeps an ordered active set that is handed out round robin and a
//! quarantine of endpoints reported bad. Quarantined endpoints return to the
//! tail of the rotation once they have waited out the retry interval. The
//! whole list is refreshed from the provider once per refresh window.

use crate::config::{NotifierConfig, ProviderConfig, ProxyPoolConfig};
use crate::error::{ProviderError, ProxyPoolError};
use crate::notifier::{DiscordWebhook, RateLimitedNotifier};
use crate::provider::{ProxyProvider, WebshareProvider};
use crate::proxy::{ProxyAssignment, ProxyEndpoint};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Membership counts of the pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    /// Endpoints eligible for rotation.
    pub active: usize,
    /// Endpoints waiting out their retry interval.
    pub quarantined: usize,
    /// Time of the last successful provider refresh.
    pub last_refresh: Option<Instant>,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.active + self.quarantined
    }

    /// Fraction of known endpoints that are quarantined, 0 for an empty pool.
    pub fn bad_fraction(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.quarantined as f64 / total as f64,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    active: Vec<ProxyEndpoint>,
    /// Kept in the order endpoints were quarantined.
    quarantine: Vec<(ProxyEndpoint, Instant)>,
    /// Everything the provider listed in the last refresh.
    advertised: HashSet<ProxyEndpoint>,
    last_refresh_at: Option<Instant>,
    cursor: usize,
}

impl PoolState {
    fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.len(),
            quarantined: self.quarantine.len(),
            last_refresh: self.last_refresh_at,
        }
    }

    fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        let populated = !self.active.is_empty() || !self.quarantine.is_empty();
        populated
            && self
                .last_refresh_at
                .is_some_and(|at| now.duration_since(at) < window)
    }

    fn apply_refresh(&mut self, fetched: Vec<ProxyEndpoint>, now: Instant) {
        let mut advertised = HashSet::with_capacity(fetched.len());
        let fresh: Vec<ProxyEndpoint> = fetched
            .into_iter()
            .filter(|endpoint| advertised.insert(endpoint.clone()))
            .collect();

        // Endpoints the provider no longer lists are forgotten.
        self.quarantine.retain(|(endpoint, _)| advertised.contains(endpoint));

        let quarantined: HashSet<&ProxyEndpoint> =
            self.quarantine.iter().map(|(endpoint, _)| endpoint).collect();
        let active: Vec<ProxyEndpoint> = fresh
            .into_iter()
            .filter(|endpoint| !quarantined.contains(endpoint))
            .collect();

        self.active = active;
        self.advertised = advertised;
        if self.active.is_empty() {
            self.cursor = 0;
        }
        self.last_refresh_at = Some(now);
    }

    fn next(&mut self) -> Option<ProxyEndpoint> {
        if self.active.is_empty() {
            self.cursor = 0;
            return None;
        }
        let index = self.cursor % self.active.len();
        self.cursor = (index + 1) % self.active.len();
        Some(self.active[index].clone())
    }

    fn mark_bad(&mut self, endpoint: &ProxyEndpoint, now: Instant) {
        self.active.retain(|e| e != endpoint);
        self.quarantine.retain(|(e, _)| e != endpoint);
        self.quarantine.push((endpoint.clone(), now));
    }

    /// Move endpoints quarantined for longer than `retry_interval` back to
    /// the end of the active set. Aged endpoints the provider no longer lists
    /// are dropped instead. Returns how many were moved.
    fn restore_aged(&mut self, now: Instant, retry_interval: Duration) -> usize {
        let (aged, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.quarantine)
            .into_iter()
            .partition(|(_, since)| now.duration_since(*since) > retry_interval);
        self.quarantine = waiting;

        let mut restored = 0;
        for (endpoint, _) in aged {
            if self.advertised.contains(&endpoint) {
                self.active.push(endpoint);
                restored += 1;
            } else {
                debug!("Dropping {} from quarantine: no longer listed by the provider", endpoint);
            }
        }
        restored
    }
}

/// A pool of provider-supplied proxies shared by every outbound request.
pub struct ProxyPool {
    /// Membership, quarantine, refresh time and rotation cursor.
    state: Mutex<PoolState>,
    /// Serializes provider fetches and holds the outcome of the latest one.
    refresh_gate: tokio::sync::Mutex<Option<ProxyPoolError>>,
    /// Number of completed provider fetches.
    refresh_generation: AtomicU64,
    provider: Arc<dyn ProxyProvider>,
    notifier: Arc<RateLimitedNotifier>,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
}

impl ProxyPool {
    /// Create an empty pool. It is filled from the provider on first use.
    pub fn new(
        config: ProxyPoolConfig,
        provider: Arc<dyn ProxyProvider>,
        notifier: Arc<RateLimitedNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            refresh_gate: tokio::sync::Mutex::new(None),
            refresh_generation: AtomicU64::new(0),
            provider,
            notifier,
            config,
        })
    }

    /// Create a pool backed by the Webshare provider and a webhook alert
    /// channel, both configured from the environment.
    pub fn from_env() -> Result<Arc<Self>, ProviderError> {
        let provider = WebshareProvider::new(ProviderConfig::from_env())?;
        if !provider.is_configured() {
            warn!("WEBSHARE_TOKEN is not set, requests will not be proxied");
        }
        let channel = DiscordWebhook::new(NotifierConfig::from_env());
        Ok(Self::new(
            ProxyPoolConfig::from_env(),
            Arc::new(provider),
            Arc::new(RateLimitedNotifier::new(Arc::new(channel))),
        ))
    }

    /// Refresh the pool from the provider unless it is populated and was
    /// refreshed within the refresh window.
    ///
    /// At most one fetch runs at a time. Callers that queue behind a fetch
    /// share its outcome instead of fetching again. On failure the pool is
    /// left untouched.
    pub async fn ensure_fresh(&self) -> Result<(), ProxyPoolError> {
        if self.is_fresh() {
            return Ok(());
        }

        let ticket = self.refresh_generation.load(Ordering::Acquire);
        let mut last_outcome = self.refresh_gate.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != ticket {
            return match last_outcome.as_ref() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
        }
        if self.is_fresh() {
            return Ok(());
        }

        let timeout = self.config.refresh_timeout;
        let fetched = match time::timeout(timeout, self.provider.fetch_proxies()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };

        let outcome = match fetched {
            Ok(endpoints) => {
                let fetched_count = endpoints.len();
                let stats = {
                    let mut state = self.state.lock();
                    state.apply_refresh(endpoints, Instant::now());
                    state.stats()
                };
                info!(
                    "Refreshed proxy pool: {} fetched, {} active, {} quarantined",
                    fetched_count, stats.active, stats.quarantined
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh proxy pool: {}", e);
                Err(ProxyPoolError::from(e))
            }
        };

        *last_outcome = outcome.clone().err();
        self.refresh_generation.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Get the next proxy in round-robin order.
    ///
    /// Returns [`ProxyAssignment::Direct`] when the provider has no
    /// credentials.
    pub async fn get_proxy(&self) -> Result<ProxyAssignment, ProxyPoolError> {
        if !self.provider.is_configured() {
            return Ok(ProxyAssignment::Direct);
        }

        self.ensure_fresh().await?;

        let (selected, alert) = {
            let mut state = self.state.lock();
            let alert = self.restore_locked(&mut state);
            (state.next(), alert)
        };
        self.send_alert(alert);

        match selected {
            Some(endpoint) => {
                debug!("Assigned proxy {}", endpoint);
                Ok(ProxyAssignment::Proxy(endpoint))
            }
            None => {
                warn!("No proxy available. {:?}", self.stats());
                Err(ProxyPoolError::NoProxiesAvailable)
            }
        }
    }

    /// Take an endpoint out of rotation. Marking it again restarts its
    /// quarantine clock.
    pub fn mark_bad(&self, endpoint: &ProxyEndpoint) {
        let stats = {
            let mut state = self.state.lock();
            state.mark_bad(endpoint, Instant::now());
            state.stats()
        };
        info!(
            "Proxy {} marked bad: {}/{} proxies quarantined",
            endpoint,
            stats.quarantined,
            stats.total()
        );
    }

    /// Return aged quarantined endpoints to rotation and alert if too much
    /// of the pool is quarantined. The alert is delivered in the background.
    pub fn restore(&self) {
        let alert = {
            let mut state = self.state.lock();
            self.restore_locked(&mut state)
        };
        self.send_alert(alert);
    }

    /// Run [`restore`](Self::restore) every `every` in the background.
    pub fn spawn_restore_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.restore();
                debug!("Proxy pool status update: {:?}", pool.stats());
            }
        })
    }

    /// Get statistics about the proxy pool.
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    /// Snapshot of the active set in rotation order.
    pub fn active_endpoints(&self) -> Vec<ProxyEndpoint> {
        self.state.lock().active.clone()
    }

    /// Whether the endpoint is currently active or quarantined.
    pub fn contains(&self, endpoint: &ProxyEndpoint) -> bool {
        let state = self.state.lock();
        state.active.contains(endpoint) || state.quarantine.iter().any(|(e, _)| e == endpoint)
    }

    /// Snapshot of the quarantine in the order endpoints were reported.
    pub fn quarantined_endpoints(&self) -> Vec<ProxyEndpoint> {
        self.state
            .lock()
            .quarantine
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    fn is_fresh(&self) -> bool {
        self.state
            .lock()
            .is_fresh(Instant::now(), self.config.refresh_window)
    }

    /// Recovery step, run with the state lock held. Returns the alert text
    /// to send once the lock is released.
    fn restore_locked(&self, state: &mut PoolState) -> Option<String> {
        let stats = state.stats();
        let fraction = stats.bad_fraction();

        if stats.quarantined > 0 && fraction >= self.config.degraded_threshold {
            info!(
                "Proxy pool degraded: {}/{} proxies quarantined",
                stats.quarantined,
                stats.total()
            );
        }

        let alert = (fraction > self.config.alert_threshold)
            .then(|| format!("{:.2}% of proxies have gone bad.", fraction * 100.0));

        let restored = state.restore_aged(Instant::now(), self.config.retry_interval);
        if restored > 0 {
            info!("Restored {} quarantined proxies to rotation", restored);
        }
        alert
    }

    fn send_alert(&self, alert: Option<String>) {
        if let Some(message) = alert {
            self.notifier
                .notify(&self.config.alert_key, self.config.alert_interval, message);
        }
    }
}
