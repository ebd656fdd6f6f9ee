//! Operational alerts with per-key throttling.

use crate::config::NotifierConfig;
use crate::error::NotifyError;

use async_trait::async_trait;
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{debug, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A channel that delivers alert text.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

/// Posts alerts to a Discord-style webhook as `{"content": message}`.
#[derive(Debug, Clone)]
pub struct DiscordWebhook {
    client: Client,
    webhook_url: Option<String>,
}

impl DiscordWebhook {
    pub fn new(config: NotifierConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            webhook_url: config.webhook_url,
        }
    }
}

#[async_trait]
impl AlertChannel for DiscordWebhook {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let Some(url) = self.webhook_url.as_deref() else {
            warn!("DISCORD_WEBHOOK_URL is not set, alert not sent: {}", message);
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&WebhookMessage { content: message })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

type KeyLimiter<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Sends alerts through a channel at most once per interval for each key.
///
/// Each key gets its own single-cell limiter, so the first alert goes out
/// immediately and repeats wait a full interval. The interval given with the
/// first alert for a key governs that key.
///
/// Delivery runs on a spawned task: the caller never waits on the channel,
/// and failures are logged and never returned.
pub struct RateLimitedNotifier<C: Clock = DefaultClock> {
    channel: Arc<dyn AlertChannel>,
    clock: C,
    limiters: Mutex<HashMap<String, Arc<KeyLimiter<C>>>>,
}

impl RateLimitedNotifier {
    pub fn new(channel: Arc<dyn AlertChannel>) -> Self {
        Self::with_clock(channel, DefaultClock::default())
    }
}

impl<C: Clock + Clone> RateLimitedNotifier<C> {
    /// Create a notifier measuring intervals with `clock`.
    pub fn with_clock(channel: Arc<dyn AlertChannel>, clock: C) -> Self {
        Self {
            channel,
            clock,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Send `message` unless an alert with the same key went out less than
    /// `min_interval` ago. Returns the delivery task when a send was started.
    pub fn notify(&self, key: &str, min_interval: Duration, message: impl Into<String>) -> Option<JoinHandle<()>> {
        if !self.claim(key, min_interval) {
            debug!("Suppressing alert {:?}: sent within the last {:?}", key, min_interval);
            return None;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime to deliver alert {:?}, dropping it", key);
            return None;
        };
        let channel = Arc::clone(&self.channel);
        let key = key.to_string();
        let message = message.into();
        Some(runtime.spawn(async move {
            if let Err(e) = channel.send(&message).await {
                warn!("Failed to deliver alert {:?}: {}", key, e);
            }
        }))
    }

    /// Take the send slot for `key` if its limiter allows it.
    fn claim(&self, key: &str, min_interval: Duration) -> bool {
        let Some(quota) = Quota::with_period(min_interval) else {
            // A zero interval means no throttling.
            return true;
        };
        let limiter = {
            let mut limiters = self.limiters.lock();
            let limiter = limiters.entry(key.to_string()).or_insert_with(|| {
                Arc::new(RateLimiter::direct_with_clock(
                    quota.allow_burst(NonZeroU32::MIN),
                    self.clock.clone(),
                ))
            });
            Arc::clone(limiter)
        };
        limiter.check().is_ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Channel that records delivered messages.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub(crate) messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        async fn send(&self, message: &str) -> Result<(), NotifyError> {
            self.messages.lock().push(message.to_string());
            Ok(())
        }
    }

    struct FailingChannel {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AlertChannel for FailingChannel {
        async fn send(&self, _message: &str) -> Result<(), NotifyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Status(reqwest::StatusCode::BAD_GATEWAY))
        }
    }

    /// Channel that takes a long time to deliver.
    pub(crate) struct SlowChannel {
        pub(crate) delay: Duration,
        pub(crate) started: AtomicUsize,
    }

    #[async_trait]
    impl AlertChannel for SlowChannel {
        async fn send(&self, _message: &str) -> Result<(), NotifyError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn fake_clocked(channel: Arc<dyn AlertChannel>) -> (RateLimitedNotifier<FakeRelativeClock>, FakeRelativeClock) {
        let clock = FakeRelativeClock::default();
        (RateLimitedNotifier::with_clock(channel, clock.clone()), clock)
    }

    async fn delivered(handle: Option<JoinHandle<()>>) -> bool {
        match handle {
            Some(task) => {
                task.await.unwrap();
                true
            }
            None => false,
        }
    }

    #[tokio::test]
    async fn first_alert_is_sent_immediately() {
        let channel = Arc::new(RecordingChannel::default());
        let (notifier, _) = fake_clocked(channel.clone());

        assert!(delivered(notifier.notify("k", HOUR, "hello")).await);
        assert_eq!(*channel.messages.lock(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn repeats_are_suppressed_within_interval() {
        let channel = Arc::new(RecordingChannel::default());
        let (notifier, clock) = fake_clocked(channel.clone());

        assert!(delivered(notifier.notify("k", HOUR, "one")).await);
        clock.advance(Duration::from_secs(59 * 60));
        assert!(!delivered(notifier.notify("k", HOUR, "two")).await);
        clock.advance(Duration::from_secs(60));
        assert!(delivered(notifier.notify("k", HOUR, "three")).await);

        assert_eq!(*channel.messages.lock(), vec!["one".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn keys_are_throttled_independently() {
        let channel = Arc::new(RecordingChannel::default());
        let (notifier, _) = fake_clocked(channel.clone());

        assert!(delivered(notifier.notify("a", HOUR, "a")).await);
        assert!(delivered(notifier.notify("b", HOUR, "b")).await);
        assert!(!delivered(notifier.notify("a", HOUR, "a again")).await);
        assert_eq!(channel.messages.lock().len(), 2);
    }

    #[tokio::test]
    async fn zero_interval_never_throttles() {
        let channel = Arc::new(RecordingChannel::default());
        let (notifier, _) = fake_clocked(channel.clone());

        assert!(delivered(notifier.notify("k", Duration::ZERO, "x")).await);
        assert!(delivered(notifier.notify("k", Duration::ZERO, "y")).await);
        assert_eq!(channel.messages.lock().len(), 2);
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let channel = Arc::new(FailingChannel {
            attempts: AtomicUsize::new(0),
        });
        let notifier = RateLimitedNotifier::new(channel.clone());

        assert!(delivered(notifier.notify("k", HOUR, "boom")).await);
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_channel_does_not_hold_up_the_caller() {
        let channel = Arc::new(SlowChannel {
            delay: Duration::from_secs(30),
            started: AtomicUsize::new(0),
        });
        let notifier = RateLimitedNotifier::new(channel.clone());

        let started = std::time::Instant::now();
        let task = notifier.notify("k", HOUR, "slow");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(task.is_some());
        tokio::task::yield_now().await;
        assert_eq!(channel.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn alerts_outside_a_runtime_are_dropped() {
        let channel = Arc::new(RecordingChannel::default());
        let notifier = RateLimitedNotifier::new(channel.clone());

        assert!(notifier.notify("k", HOUR, "lost").is_none());
        assert!(channel.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn webhook_posts_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({ "content": "pool degraded" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let webhook = DiscordWebhook::new(NotifierConfig {
            webhook_url: Some(format!("{}/hook", server.uri())),
        });
        webhook.send("pool degraded").await.unwrap();
    }

    #[tokio::test]
    async fn webhook_reports_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let webhook = DiscordWebhook::new(NotifierConfig {
            webhook_url: Some(server.uri()),
        });
        let err = webhook.send("x").await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(s) if s.as_u16() == 500));
    }

    #[tokio::test]
    async fn unconfigured_webhook_is_not_an_error() {
        let webhook = DiscordWebhook::new(NotifierConfig::default());
        webhook.send("nobody listening").await.unwrap();
    }
}
