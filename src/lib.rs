//! # reqwest-rotating-proxy
//!
//! A rotating proxy pool for reqwest backed by a proxy list provider.
//!
//! The pool refreshes its endpoints from the provider, hands them out round
//! robin, quarantines endpoints that callers report as bad and returns them
//! to rotation once they have rested. When too much of the pool is
//! quarantined a throttled alert is posted to a webhook. Requests can be sent
//! through the pool with [`ProxiedFetch`] or the [`ProxyPoolMiddleware`].
//!
//! Alongside the pool the crate keeps the bookkeeping of the surrounding
//! service: per-customer model spend in [`UsageMeter`] and background tasks
//! in [`TaskStore`].

pub mod config;
pub mod error;
pub mod fetch;
pub mod middleware;
pub mod notifier;
pub mod pool;
pub mod provider;
pub mod proxy;
pub mod tasks;
pub mod usage;
pub mod utils;

pub use config::{FetchConfig, NotifierConfig, ProviderConfig, ProxyPoolConfig, ProxyPoolConfigBuilder};
pub use error::{FetchError, NotifyError, ProviderError, ProxyPoolError, TaskError, UsageError};
pub use fetch::{BadProxyReporter, ProxiedFetch, ProxiedResponse};
pub use middleware::ProxyPoolMiddleware;
pub use notifier::{AlertChannel, DiscordWebhook, RateLimitedNotifier};
pub use pool::{PoolStats, ProxyPool};
pub use provider::{ProxyProvider, WebshareProvider};
pub use proxy::{ProxyAssignment, ProxyEndpoint};
pub use tasks::{Task, TaskListParams, TaskPage, TaskStats, TaskStatus, TaskStore};
pub use usage::{ModelPricing, TokenUsage, UsageMeter};
