use serde::{Deserialize, Serialize};

/// Provenance tag attached by the upstream (or the fallback generator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Api,
    Predicted,
    Simulated,
    Cached,
}

impl Source {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "api" => Some(Source::Api),
            "predicted" => Some(Source::Predicted),
            "simulated" => Some(Source::Simulated),
            "cached" => Some(Source::Cached),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Api => "api",
            Source::Predicted => "predicted",
            Source::Simulated => "simulated",
            Source::Cached => "cached",
        }
    }
}

/// One feature's reading for one tick, as delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFeatureValue {
    Absent,
    Bare(f64),
    Tagged {
        value: Option<f64>,
        predicted: bool,
        source: Option<Source>,
    },
    /// Shape that could not be interpreted; carries a short description.
    Malformed(String),
}

impl RawFeatureValue {
    pub fn tagged(value: f64, source: Source) -> Self {
        RawFeatureValue::Tagged {
            value: Some(value),
            predicted: source == Source::Predicted,
            source: Some(source),
        }
    }

    /// Finite numeric reading carried by this value, if any.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            RawFeatureValue::Bare(v) => Some(*v),
            RawFeatureValue::Tagged { value: Some(v), .. } => Some(*v),
            _ => None,
        }
        .filter(|v| v.is_finite())
    }

    pub fn explicit_source(&self) -> Option<Source> {
        match self {
            RawFeatureValue::Tagged { source, .. } => *source,
            _ => None,
        }
    }
}

/// Coarse machine activity label reported next to the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineActivity {
    Active,
    Rest,
    Unknown,
}

impl MachineActivity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" | "running" | "boring" => MachineActivity::Active,
            "rest" | "idle" | "stopped" => MachineActivity::Rest,
            _ => MachineActivity::Unknown,
        }
    }

    /// Cutterhead torque above zero means the machine is boring.
    pub fn from_torque(torque: Option<f64>) -> Self {
        match torque {
            Some(t) if t > 0.0 => MachineActivity::Active,
            _ => MachineActivity::Rest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineActivity::Active => "active",
            MachineActivity::Rest => "rest",
            MachineActivity::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOrigin {
    Upstream,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInput {
    pub raw: RawFeatureValue,
    /// Forecast for the next tick's value of this feature.
    pub prediction: Option<f64>,
}

impl FeatureInput {
    pub fn new(raw: RawFeatureValue, prediction: Option<f64>) -> Self {
        Self { raw, prediction }
    }

    pub fn absent() -> Self {
        Self { raw: RawFeatureValue::Absent, prediction: None }
    }
}

/// Everything one tick delivers, index-aligned to the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Vec<FeatureInput>,
    pub step_count: u64,
    pub buffer_ready: bool,
    pub activity: MachineActivity,
    pub origin: BatchOrigin,
}

impl Batch {
    pub fn upstream(features: Vec<FeatureInput>, step_count: u64, buffer_ready: bool) -> Self {
        Self {
            features,
            step_count,
            buffer_ready,
            activity: MachineActivity::Unknown,
            origin: BatchOrigin::Upstream,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parse() {
        assert_eq!(Source::parse("API"), Some(Source::Api));
        assert_eq!(Source::parse(" cached "), Some(Source::Cached));
        assert_eq!(Source::parse("live"), None);
    }

    #[test]
    fn test_numeric_rejects_non_finite() {
        assert_eq!(RawFeatureValue::Bare(f64::NAN).numeric(), None);
        assert_eq!(RawFeatureValue::Bare(1.5).numeric(), Some(1.5));
        assert_eq!(RawFeatureValue::tagged(2.0, Source::Cached).numeric(), Some(2.0));
        assert_eq!(RawFeatureValue::Absent.numeric(), None);
    }

    #[test]
    fn test_activity_from_torque() {
        assert_eq!(MachineActivity::from_torque(Some(120.0)), MachineActivity::Active);
        assert_eq!(MachineActivity::from_torque(Some(0.0)), MachineActivity::Rest);
        assert_eq!(MachineActivity::from_torque(None), MachineActivity::Rest);
        assert_eq!(MachineActivity::parse("idle"), MachineActivity::Rest);
    }
}
