//! Simple example of using reqwest-rotating-proxy.
//!
//! Reads `WEBSHARE_TOKEN` and `DISCORD_WEBHOOK_URL` from the environment.
//! Without a token every request goes out directly.

use reqwest::Url;
use reqwest_rotating_proxy::{FetchConfig, FetchError, ProxiedFetch, ProxyPool};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let pool = ProxyPool::from_env()?;
    pool.spawn_restore_task(Duration::from_secs(60));

    let fetch = ProxiedFetch::new(
        pool,
        FetchConfig {
            randomize_user_agent: true,
            // lower throughput per proxy, less likely to get banned
            max_requests_per_second: Some(3.0),
            ..FetchConfig::default()
        },
    );

    let url = Url::parse("https://httpbin.org/ip")?;
    for attempt in 1..=3 {
        println!("Sending request (attempt {})...", attempt);
        match fetch.get(url.clone()).await {
            Ok(proxied) if proxied.response.status().is_success() => {
                println!("Status: {}", proxied.response.status());
                println!("Response: {}", proxied.response.text().await?);
                return Ok(());
            }
            Ok(proxied) => {
                println!("Status: {}, blaming proxy", proxied.response.status());
                proxied.mark_proxy_bad();
            }
            Err(FetchError::Transport { source, reporter }) => {
                println!("Request failed: {}", source);
                reporter.mark_bad();
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("Pool status: {:?}", fetch.pool().stats());
    Ok(())
}
