use std::str::FromStr;
use std::time::Duration;

/// Tunables of the reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileParams {
    /// Cycles the prediction model needs before it emits a usable forecast.
    /// Advisory only: readiness is taken from the upstream `buffer_ready` flag.
    pub min_history_for_prediction: u64,
    /// Absolute change below which a value counts as unchanged.
    pub no_change_epsilon: f64,
}

impl Default for ReconcileParams {
    fn default() -> Self {
        Self {
            min_history_for_prediction: 5,
            no_change_epsilon: 1e-4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub access_token: Option<String>,
    pub tbm_id: String,
    pub poll_secs: u64,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: u32,
    /// Per-feature probability that the fallback generator emits a value.
    pub fallback_presence: f64,
    /// Fraction of synthesized values additionally tagged as predicted.
    pub fallback_predicted: f64,
    pub fallback_seed: Option<u64>,
    pub history_db: Option<String>,
    /// Consecutive fetch failures before the connection indicator turns to error.
    pub error_after_failures: u32,
    pub reconcile: ReconcileParams,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("TBM_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:8765/api/tbm-data".to_string()),
            access_token: std::env::var("TBM_ACCESS_TOKEN").ok().filter(|v| !v.is_empty()),
            tbm_id: std::env::var("TBM_ID").unwrap_or_else(|_| "THDG24493".to_string()),
            poll_secs: env_parse("POLL_SECS", 10u64).max(1),
            fetch_timeout_ms: env_parse("FETCH_TIMEOUT_MS", 8_000u64),
            fetch_retries: env_parse("FETCH_RETRIES", 1u32),
            fallback_presence: env_parse("FALLBACK_PRESENCE", 0.7f64).clamp(0.0, 1.0),
            fallback_predicted: env_parse("FALLBACK_PREDICTED", 0.1f64).clamp(0.0, 1.0),
            fallback_seed: std::env::var("FALLBACK_SEED").ok().and_then(|v| v.parse().ok()),
            history_db: std::env::var("HISTORY_DB").ok().filter(|v| !v.is_empty()),
            error_after_failures: env_parse("ERROR_AFTER_FAILURES", 1u32).max(1),
            reconcile: ReconcileParams::default(),
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    /// Request timeout, kept strictly inside the tick period.
    pub fn fetch_timeout(&self) -> Duration {
        let period_ms = self.poll_secs.saturating_mul(1000);
        let cap = period_ms.saturating_sub(period_ms / 10).max(100);
        Duration::from_millis(self.fetch_timeout_ms.clamp(100, cap))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8765/api/tbm-data".to_string(),
            access_token: None,
            tbm_id: "THDG24493".to_string(),
            poll_secs: 10,
            fetch_timeout_ms: 8_000,
            fetch_retries: 1,
            fallback_presence: 0.7,
            fallback_predicted: 0.1,
            fallback_seed: None,
            history_db: None,
            error_after_failures: 1,
            reconcile: ReconcileParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_timeout_stays_inside_period() {
        let cfg = Config {
            poll_secs: 2,
            fetch_timeout_ms: 30_000,
            ..Default::default()
        };
        assert_eq!(cfg.fetch_timeout(), Duration::from_millis(1_800));
    }

    #[test]
    fn test_fetch_timeout_passthrough() {
        let cfg = Config::default();
        assert_eq!(cfg.fetch_timeout(), Duration::from_millis(8_000));
        assert_eq!(cfg.poll_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_reconcile_defaults() {
        let p = ReconcileParams::default();
        assert_eq!(p.min_history_for_prediction, 5);
        assert!((p.no_change_epsilon - 1e-4).abs() < 1e-12);
    }
}
