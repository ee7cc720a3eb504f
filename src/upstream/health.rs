use serde::Serialize;

/// Connection indicator shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

/// Tracks consecutive fetch failures. Synthetic data never counts as a
/// success, so an outage stays visible while the fallback fills the table.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub failures: u32,
    pub threshold: u32,
}

impl ConnectionHealth {
    pub fn new(threshold: u32) -> Self {
        Self { status: ConnectionStatus::Connecting, failures: 0, threshold: threshold.max(1) }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.status = ConnectionStatus::Connected;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.threshold {
            self.status = ConnectionStatus::Error;
        }
    }

    /// An unusable batch is reported immediately.
    pub fn record_format_error(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.status = ConnectionStatus::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_on_threshold() {
        let mut h = ConnectionHealth::new(3);
        assert_eq!(h.status, ConnectionStatus::Connecting);
        h.record_failure();
        h.record_failure();
        assert_eq!(h.status, ConnectionStatus::Connecting);
        h.record_failure();
        assert_eq!(h.status, ConnectionStatus::Error);
    }

    #[test]
    fn test_resets_on_success() {
        let mut h = ConnectionHealth::new(1);
        h.record_failure();
        assert_eq!(h.status, ConnectionStatus::Error);
        h.record_success();
        assert_eq!(h.status, ConnectionStatus::Connected);
        assert_eq!(h.failures, 0);
    }

    #[test]
    fn test_format_error_ignores_threshold() {
        let mut h = ConnectionHealth::new(5);
        h.record_success();
        h.record_format_error();
        assert_eq!(h.status, ConnectionStatus::Error);
    }
}
