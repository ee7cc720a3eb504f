use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::retry::{retry_async, RetryConfig};
use super::{decode_batch, FetchError, UpstreamClient, UpstreamError};
use crate::config::Config;
use crate::logging::log_fetch_ok;
use crate::reconcile::Batch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn begin(&self) -> Attempt<'_> {
        self.total.fetch_add(1, Ordering::Relaxed);
        Attempt { counters: self, settled: false }
    }
}

/// One counted request. Dropped unsettled (the tick budget ran out mid-request)
/// it counts as failed, so `total == success + failed` once nothing is in flight.
struct Attempt<'a> {
    counters: &'a Counters,
    settled: bool,
}

impl Attempt<'_> {
    fn settle(mut self, ok: bool) {
        let slot = if ok { &self.counters.success } else { &self.counters.failed };
        slot.fetch_add(1, Ordering::Relaxed);
        self.settled = true;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Fetches batches from the HTTP endpoint.
pub struct HttpUpstream {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
    tbm_id: String,
    retry: RetryConfig,
    /// Wall-clock allowance for one tick's fetch, retries included.
    budget: Duration,
    counters: Counters,
}

fn map_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::Status(status.as_u16())
    } else {
        FetchError::Network(err.to_string())
    }
}

impl HttpUpstream {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.fetch_timeout())
            .user_agent(concat!("tbm-monitor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let period = cfg.poll_period();
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            access_token: cfg.access_token.clone(),
            tbm_id: cfg.tbm_id.clone(),
            retry: RetryConfig {
                max_retries: cfg.fetch_retries,
                ..Default::default()
            },
            budget: period.saturating_sub(period / 10),
            counters: Counters::default(),
        })
    }

    async fn request(&self) -> Result<Batch, UpstreamError> {
        let mut query: Vec<(&str, &str)> = vec![("tbmId", self.tbm_id.as_str())];
        if let Some(token) = &self.access_token {
            query.push(("access-token", token.as_str()));
        }

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(map_transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()).into());
        }
        let body = resp.bytes().await.map_err(map_transport)?;
        Ok(decode_batch(&body)?)
    }

    async fn fetch_once(&self) -> Result<Batch, UpstreamError> {
        let attempt = self.counters.begin();
        let outcome = self.request().await;
        attempt.settle(outcome.is_ok());
        outcome
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn fetch_batch(&self) -> Result<Batch, UpstreamError> {
        let started = Instant::now();
        let before = self.counters.total.load(Ordering::Relaxed);
        let attempt = retry_async(&self.retry, "fetch_batch", UpstreamError::is_retryable, || {
            self.fetch_once()
        });
        let batch = tokio::time::timeout(self.budget, attempt)
            .await
            .map_err(|_| FetchError::Timeout)??;
        let attempts = self.counters.total.load(Ordering::Relaxed) - before;
        log_fetch_ok(
            &self.endpoint,
            attempts as u32,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(batch)
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }

    fn stats(&self) -> RequestStats {
        RequestStats {
            total: self.counters.total.load(Ordering::Relaxed),
            success: self.counters.success.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_inside_period() {
        let cfg = Config {
            poll_secs: 5,
            ..Default::default()
        };
        let up = HttpUpstream::from_config(&cfg).unwrap();
        assert_eq!(up.budget, Duration::from_millis(4_500));
        assert_eq!(up.stats(), RequestStats::default());
        assert_eq!(up.describe(), cfg.endpoint);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_fetch_error() {
        let cfg = Config {
            endpoint: "http://127.0.0.1:9/api/tbm-data".to_string(),
            fetch_retries: 0,
            poll_secs: 2,
            ..Default::default()
        };
        let up = HttpUpstream::from_config(&cfg).unwrap();
        let err = up.fetch_batch().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Fetch(_)));
        let stats = up.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_abandoned_attempt_counts_as_failed() {
        let counters = Counters::default();
        counters.begin().settle(true);
        counters.begin().settle(false);
        drop(counters.begin());
        assert_eq!(counters.total.load(Ordering::Relaxed), 3);
        assert_eq!(counters.success.load(Ordering::Relaxed), 1);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_budget_timeout_is_counted_as_failure() {
        // Accepts connections into the backlog and never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let cfg = Config {
            endpoint: format!("http://{}/api/tbm-data", silent.local_addr().unwrap()),
            fetch_retries: 0,
            poll_secs: 5,
            ..Default::default()
        };
        let mut up = HttpUpstream::from_config(&cfg).unwrap();
        up.budget = Duration::from_millis(100);

        let err = up.fetch_batch().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Fetch(FetchError::Timeout)));
        let stats = up.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, stats.success + stats.failed);
    }
}
