//! Upstream client contract and the wire format of the fetch endpoint.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::reconcile::{Batch, FeatureInput, FormatError, MachineActivity, RawFeatureValue, Source};

pub mod fallback;
pub mod health;
pub mod http;
pub mod retry;

pub use fallback::FallbackGenerator;
pub use health::{ConnectionHealth, ConnectionStatus};
pub use http::{HttpUpstream, RequestStats};

/// Transport-level failure. Recovered by substituting a synthetic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    Network(String),
    Timeout,
    Status(u16),
    Upstream(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout => true,
            FetchError::Status(code) => retry::is_retryable_http_error(*code),
            FetchError::Upstream(_) => false,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Network(msg) => write!(f, "network error: {}", msg),
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::Status(code) => write!(f, "upstream returned HTTP {}", code),
            FetchError::Upstream(msg) => write!(f, "upstream error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamError {
    Fetch(FetchError),
    Format(FormatError),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Fetch(e) => e.fmt(f),
            UpstreamError::Format(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<FetchError> for UpstreamError {
    fn from(e: FetchError) -> Self {
        UpstreamError::Fetch(e)
    }
}

impl From<FormatError> for UpstreamError {
    fn from(e: FormatError) -> Self {
        UpstreamError::Format(e)
    }
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Fetch(e) if e.is_retryable())
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// One fetch per tick. Timeouts are enforced by the implementation.
    async fn fetch_batch(&self) -> Result<Batch, UpstreamError>;

    fn describe(&self) -> String;

    fn stats(&self) -> RequestStats {
        RequestStats::default()
    }
}

#[derive(Debug, Deserialize)]
struct WireBatch {
    features: Vec<Value>,
    #[serde(default)]
    step_count: u64,
    #[serde(default)]
    buffer_ready: bool,
    #[serde(default)]
    tbm_status: Option<String>,
}

/// Decodes a 2xx response body. Length is checked later by the engine.
pub fn decode_batch(body: &[u8]) -> Result<Batch, FormatError> {
    let wire: WireBatch =
        serde_json::from_slice(body).map_err(|e| FormatError::Decode(e.to_string()))?;
    let features = wire.features.iter().map(decode_feature).collect();
    let mut batch = Batch::upstream(features, wire.step_count, wire.buffer_ready);
    batch.activity = wire
        .tbm_status
        .as_deref()
        .map(MachineActivity::parse)
        .unwrap_or(MachineActivity::Unknown);
    Ok(batch)
}

fn number(v: Option<&Value>) -> Result<Option<f64>, String> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(format!("non-numeric value {}", other)),
    }
}

fn source(v: Option<&Value>) -> Result<Option<Source>, String> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Source::parse(s)
            .map(Some)
            .ok_or_else(|| format!("unknown source {:?}", s)),
        Some(other) => Err(format!("non-string source {}", other)),
    }
}

fn decode_feature(entry: &Value) -> FeatureInput {
    match entry {
        Value::Null => FeatureInput::absent(),
        Value::Number(n) => match n.as_f64() {
            Some(v) => FeatureInput::new(RawFeatureValue::Bare(v), None),
            None => FeatureInput::new(RawFeatureValue::Malformed(n.to_string()), None),
        },
        Value::Object(map) if ["current_value", "current_source", "prediction_value"]
            .iter()
            .any(|k| map.contains_key(*k)) =>
        {
            let prediction = number(map.get("prediction_value")).ok().flatten();
            let raw = match (number(map.get("current_value")), source(map.get("current_source"))) {
                (Ok(None), Ok(_)) => RawFeatureValue::Absent,
                (Ok(Some(value)), Ok(src)) => RawFeatureValue::Tagged {
                    value: Some(value),
                    predicted: src == Some(Source::Predicted),
                    source: src,
                },
                (Err(msg), _) | (_, Err(msg)) => RawFeatureValue::Malformed(msg),
            };
            FeatureInput::new(raw, prediction)
        }
        Value::Object(map) if map.contains_key("value") => {
            let raw = match (number(map.get("value")), source(map.get("source"))) {
                (Ok(value), Ok(src)) => RawFeatureValue::Tagged {
                    value,
                    predicted: map.get("predicted").and_then(Value::as_bool).unwrap_or(false),
                    source: src,
                },
                (Err(msg), _) | (_, Err(msg)) => RawFeatureValue::Malformed(msg),
            };
            FeatureInput::new(raw, None)
        }
        Value::Object(_) => FeatureInput::new(RawFeatureValue::Malformed("object without value".into()), None),
        Value::Array(_) => FeatureInput::new(RawFeatureValue::Malformed("array".into()), None),
        Value::String(_) => FeatureInput::new(RawFeatureValue::Malformed("string".into()), None),
        Value::Bool(_) => FeatureInput::new(RawFeatureValue::Malformed("bool".into()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{classify, DataStatus};

    #[test]
    fn test_decode_current_shape() {
        let body = br#"{
            "features": [
                {"current_value": 12.3, "current_source": "api", "prediction_value": 13.1},
                {"current_value": null, "current_source": null, "prediction_value": null},
                {"current_value": 4.0, "current_source": "cached", "prediction_value": null}
            ],
            "step_count": 7,
            "buffer_ready": true,
            "tbm_status": "active"
        }"#;
        let batch = decode_batch(body).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.step_count, 7);
        assert!(batch.buffer_ready);
        assert_eq!(batch.activity, MachineActivity::Active);
        assert_eq!(batch.features[0].prediction, Some(13.1));
        assert_eq!(batch.features[0].raw.explicit_source(), Some(Source::Api));
        assert_eq!(batch.features[1].raw, RawFeatureValue::Absent);
        assert_eq!(batch.features[2].raw.explicit_source(), Some(Source::Cached));
    }

    #[test]
    fn test_decode_legacy_and_odd_shapes() {
        let body = br#"{"features": [
            {"value": 3.5, "predicted": true},
            {"value": 3.5},
            7.25,
            null,
            [1, 2],
            {"current_value": 1.0, "current_source": "telepathy"},
            {"unexpected": 1}
        ]}"#;
        let batch = decode_batch(body).unwrap();
        let statuses: Vec<DataStatus> = batch.features.iter().map(|f| classify(&f.raw)).collect();
        assert_eq!(
            statuses,
            vec![
                DataStatus::Predicted,
                DataStatus::Valid,
                DataStatus::Valid,
                DataStatus::Missing,
                DataStatus::Error,
                DataStatus::Error,
                DataStatus::Error,
            ]
        );
        assert!(!batch.buffer_ready);
        assert_eq!(batch.activity, MachineActivity::Unknown);
    }

    #[test]
    fn test_undecodable_body_is_format_error() {
        assert!(matches!(decode_batch(b"<html>"), Err(FormatError::Decode(_))));
        assert!(matches!(decode_batch(br#"{"step_count": 1}"#), Err(FormatError::Decode(_))));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Status(502).is_retryable());
        assert!(!FetchError::Status(404).is_retryable());
        assert!(!UpstreamError::Format(FormatError::Decode("x".into())).is_retryable());
    }
}
