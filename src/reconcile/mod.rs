//! Reconciliation of one tick's batch against the state carried across ticks.
//!
//! A tick runs in two passes. The render pass reads only the state left by
//! the previous cycle and produces an immutable [`RenderRecord`] plus a
//! pending [`FeatureUpdate`] per feature. The commit pass then applies all
//! updates at once, so no feature ever observes another feature's advanced
//! state within the same cycle.

pub mod raw;
pub mod stale;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{self, FeatureDescriptor, FEATURE_COUNT};
use crate::config::ReconcileParams;

pub use raw::{Batch, BatchOrigin, FeatureInput, MachineActivity, RawFeatureValue, Source};
pub use stale::StaleDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStatus {
    Valid,
    Predicted,
    Missing,
    Error,
}

impl DataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataStatus::Valid => "valid",
            DataStatus::Predicted => "predicted",
            DataStatus::Missing => "missing",
            DataStatus::Error => "error",
        }
    }
}

/// Total over every raw shape; an unrecognized shape maps to `Error`.
pub fn classify(raw: &RawFeatureValue) -> DataStatus {
    match raw {
        RawFeatureValue::Absent => DataStatus::Missing,
        RawFeatureValue::Tagged { predicted: true, .. } => DataStatus::Predicted,
        RawFeatureValue::Tagged { value: Some(v), .. } if v.is_finite() => DataStatus::Valid,
        RawFeatureValue::Bare(v) if v.is_finite() => DataStatus::Valid,
        _ => DataStatus::Error,
    }
}

/// Provenance shown next to a value; drives color coding downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplaySource {
    Api,
    Predicted,
    Simulated,
    Cached,
    Missing,
}

impl DisplaySource {
    pub fn resolve(raw: &RawFeatureValue, status: DataStatus) -> Self {
        if let Some(source) = raw.explicit_source() {
            return source.into();
        }
        match status {
            DataStatus::Predicted => DisplaySource::Predicted,
            DataStatus::Valid => DisplaySource::Api,
            DataStatus::Missing | DataStatus::Error => DisplaySource::Missing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplaySource::Api => "api",
            DisplaySource::Predicted => "predicted",
            DisplaySource::Simulated => "simulated",
            DisplaySource::Cached => "cached",
            DisplaySource::Missing => "missing",
        }
    }
}

impl From<Source> for DisplaySource {
    fn from(source: Source) -> Self {
        match source {
            Source::Api => DisplaySource::Api,
            Source::Predicted => DisplaySource::Predicted,
            Source::Simulated => DisplaySource::Simulated,
            Source::Cached => DisplaySource::Cached,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// No numeric value arrived this tick.
    Unavailable,
    /// First known value for this feature.
    Unknown,
    NoChange,
    Increase { delta: f64, percent: Option<f64> },
    Decrease { delta: f64, percent: Option<f64> },
}

impl Change {
    pub fn between(previous: f64, current: f64, epsilon: f64) -> Self {
        let delta = current - previous;
        if delta.abs() < epsilon {
            return Change::NoChange;
        }
        let percent = if previous != 0.0 {
            Some(delta / previous.abs() * 100.0)
        } else {
            None
        };
        if delta > 0.0 {
            Change::Increase { delta, percent }
        } else {
            Change::Decrease { delta, percent }
        }
    }
}

/// Content of the t+1 cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NextStep {
    /// The model is still warming up.
    Collecting,
    /// Ready, but the batch carried no forecast for this feature.
    Unavailable,
    Value(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRecord {
    pub feature_id: u16,
    pub status: DataStatus,
    pub source: DisplaySource,
    pub current: Option<f64>,
    pub change: Change,
    /// Forecast made during the previous cycle for the value arriving now.
    pub t_time_prediction: Option<f64>,
    pub next_step: NextStep,
    pub buffer_ready: bool,
    pub out_of_range: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecordedPrediction {
    pub value: f64,
    /// Local cycle during which the forecast was recorded.
    pub cycle: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FeatureState {
    pub last_value: Option<f64>,
    pub last_displayed_prediction: Option<RecordedPrediction>,
}

/// State changes one feature will receive in the commit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureUpdate {
    pub last_value: Option<f64>,
    pub prediction: Option<RecordedPrediction>,
}

impl FeatureState {
    fn apply(&mut self, update: FeatureUpdate) {
        if let Some(v) = update.last_value {
            self.last_value = Some(v);
        }
        if let Some(p) = update.prediction {
            self.last_displayed_prediction = Some(p);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Applied reconciliation cycles. Display only; never gates predictions.
    pub step_count: u64,
    pub upstream_step: u64,
    pub buffer_ready: bool,
    pub activity: MachineActivity,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            step_count: 0,
            upstream_step: 0,
            buffer_ready: false,
            activity: MachineActivity::Unknown,
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub valid: usize,
    pub predicted: usize,
    pub missing: usize,
    pub error: usize,
}

impl StatusCounts {
    fn add(&mut self, status: DataStatus) {
        match status {
            DataStatus::Valid => self.valid += 1,
            DataStatus::Predicted => self.predicted += 1,
            DataStatus::Missing => self.missing += 1,
            DataStatus::Error => self.error += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub cycle: u64,
    pub upstream_step: u64,
    pub buffer_ready: bool,
    /// Local warm-up estimate, shown next to the upstream flag.
    pub local_history_ready: bool,
    pub activity: MachineActivity,
    pub origin: BatchOrigin,
    pub records: Vec<RenderRecord>,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatError {
    FeatureCount { expected: usize, actual: usize },
    Decode(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::FeatureCount { expected, actual } => {
                write!(f, "batch carries {} features, expected {}", actual, expected)
            }
            FormatError::Decode(msg) => write!(f, "undecodable batch: {}", msg),
        }
    }
}

impl std::error::Error for FormatError {}

/// Render pass for a single feature. Reads `state` only.
pub fn plan_feature(
    desc: &FeatureDescriptor,
    input: &FeatureInput,
    state: &FeatureState,
    cycle: u64,
    buffer_ready: bool,
    params: &ReconcileParams,
) -> (RenderRecord, FeatureUpdate) {
    let status = classify(&input.raw);
    let source = DisplaySource::resolve(&input.raw, status);
    let current = input.raw.numeric();

    let change = match (current, state.last_value) {
        (None, _) => Change::Unavailable,
        (Some(_), None) => Change::Unknown,
        (Some(now), Some(prev)) => Change::between(prev, now, params.no_change_epsilon),
    };

    let t_time_prediction = state
        .last_displayed_prediction
        .filter(|p| p.cycle + 1 == cycle)
        .map(|p| p.value);

    let forecast = input.prediction.filter(|p| p.is_finite());
    let (next_step, prediction) = match (buffer_ready, forecast) {
        (false, _) => (NextStep::Collecting, None),
        (true, Some(value)) => (NextStep::Value(value), Some(RecordedPrediction { value, cycle })),
        (true, None) => (NextStep::Unavailable, None),
    };

    let out_of_range = current.map(|v| !desc.is_plausible(v)).unwrap_or(false);

    let record = RenderRecord {
        feature_id: desc.id,
        status,
        source,
        current,
        change,
        t_time_prediction,
        next_step,
        buffer_ready,
        out_of_range,
    };
    let update = FeatureUpdate { last_value: current, prediction };
    (record, update)
}

/// Owns every piece of state that persists across ticks.
#[derive(Debug, Clone)]
pub struct Engine {
    params: ReconcileParams,
    session: SessionState,
    features: Vec<FeatureState>,
}

impl Engine {
    pub fn new(params: ReconcileParams) -> Self {
        Self {
            params,
            session: SessionState::new(),
            features: vec![FeatureState::default(); FEATURE_COUNT],
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn states(&self) -> &[FeatureState] {
        &self.features
    }

    pub fn feature_state(&self, id: u16) -> Option<&FeatureState> {
        let idx = usize::from(id).checked_sub(1)?;
        self.features.get(idx)
    }

    pub fn params(&self) -> &ReconcileParams {
        &self.params
    }

    /// Reconciles one batch. A batch of the wrong length is rejected before
    /// anything is touched.
    pub fn reconcile_tick(&mut self, batch: &Batch) -> Result<TickReport, FormatError> {
        if batch.len() != FEATURE_COUNT {
            return Err(FormatError::FeatureCount {
                expected: FEATURE_COUNT,
                actual: batch.len(),
            });
        }

        let cycle = self.session.step_count + 1;
        let mut records = Vec::with_capacity(FEATURE_COUNT);
        let mut updates = Vec::with_capacity(FEATURE_COUNT);
        let mut counts = StatusCounts::default();

        for ((desc, input), state) in catalog::features()
            .iter()
            .zip(batch.features.iter())
            .zip(self.features.iter())
        {
            let (record, update) =
                plan_feature(desc, input, state, cycle, batch.buffer_ready, &self.params);
            counts.add(record.status);
            records.push(record);
            updates.push(update);
        }

        for (state, update) in self.features.iter_mut().zip(updates) {
            state.apply(update);
        }
        self.session.step_count = cycle;
        self.session.upstream_step = batch.step_count;
        self.session.buffer_ready = batch.buffer_ready;
        self.session.activity = batch.activity;

        Ok(TickReport {
            cycle,
            upstream_step: batch.step_count,
            buffer_ready: batch.buffer_ready,
            local_history_ready: cycle >= self.params.min_history_for_prediction,
            activity: batch.activity,
            origin: batch.origin,
            records,
            counts,
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(ReconcileParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_with(first: FeatureInput, ready: bool) -> Batch {
        let mut features = vec![FeatureInput::absent(); FEATURE_COUNT];
        features[0] = first;
        Batch::upstream(features, 1, ready)
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(classify(&RawFeatureValue::Absent), DataStatus::Missing);
        assert_eq!(classify(&RawFeatureValue::Bare(3.0)), DataStatus::Valid);
        assert_eq!(classify(&RawFeatureValue::Bare(f64::INFINITY)), DataStatus::Error);
        assert_eq!(
            classify(&RawFeatureValue::Tagged { value: Some(1.0), predicted: true, source: None }),
            DataStatus::Predicted
        );
        assert_eq!(
            classify(&RawFeatureValue::Tagged { value: Some(1.0), predicted: false, source: None }),
            DataStatus::Valid
        );
        assert_eq!(
            classify(&RawFeatureValue::Tagged { value: None, predicted: false, source: None }),
            DataStatus::Error
        );
        assert_eq!(classify(&RawFeatureValue::Malformed("array".into())), DataStatus::Error);
    }

    #[test]
    fn test_display_source_prefers_explicit_tag() {
        let raw = RawFeatureValue::tagged(1.0, Source::Cached);
        assert_eq!(DisplaySource::resolve(&raw, classify(&raw)), DisplaySource::Cached);
        let bare = RawFeatureValue::Bare(1.0);
        assert_eq!(DisplaySource::resolve(&bare, classify(&bare)), DisplaySource::Api);
        let absent = RawFeatureValue::Absent;
        assert_eq!(DisplaySource::resolve(&absent, classify(&absent)), DisplaySource::Missing);
    }

    #[test]
    fn test_change_between() {
        assert_eq!(Change::between(10.0, 10.00005, 1e-4), Change::NoChange);
        match Change::between(10.0, 12.0, 1e-4) {
            Change::Increase { delta, percent } => {
                assert!((delta - 2.0).abs() < 1e-9);
                assert!((percent.unwrap() - 20.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Change::between(-4.0, -6.0, 1e-4) {
            Change::Decrease { delta, percent } => {
                assert!((delta + 2.0).abs() < 1e-9);
                assert!((percent.unwrap() + 50.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Change::between(0.0, 1.0, 1e-4) {
            Change::Increase { percent, .. } => assert!(percent.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_wrong_length_without_mutation() {
        let mut engine = Engine::default();
        engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(1.0), None), false))
            .unwrap();
        let before = engine.states().to_vec();

        let short = Batch::upstream(vec![FeatureInput::absent(); 30], 2, true);
        let err = engine.reconcile_tick(&short).unwrap_err();
        assert_eq!(err, FormatError::FeatureCount { expected: 31, actual: 30 });
        assert_eq!(engine.states(), &before[..]);
        assert_eq!(engine.session().step_count, 1);
    }

    #[test]
    fn test_first_observation_is_unknown() {
        let mut engine = Engine::default();
        let report = engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(12.3), None), false))
            .unwrap();
        assert_eq!(report.records[0].change, Change::Unknown);
        assert_eq!(report.records[1].change, Change::Unavailable);
        assert_eq!(report.counts.valid, 1);
        assert_eq!(report.counts.missing, 30);
        assert!(report.records.iter().all(|r| r.next_step == NextStep::Collecting));
    }

    #[test]
    fn test_prediction_shifts_to_t_time_cell() {
        let mut engine = Engine::default();
        let r1 = engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(12.0), Some(13.1)), true))
            .unwrap();
        assert_eq!(r1.records[0].t_time_prediction, None);
        assert_eq!(r1.records[0].next_step, NextStep::Value(13.1));

        let r2 = engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(99.0), Some(14.0)), true))
            .unwrap();
        assert_eq!(r2.records[0].t_time_prediction, Some(13.1));
        assert_eq!(r2.records[0].next_step, NextStep::Value(14.0));
    }

    #[test]
    fn test_not_ready_tick_keeps_prediction_state() {
        let mut engine = Engine::default();
        engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(1.0), Some(2.0)), true))
            .unwrap();
        let frozen = engine.feature_state(1).unwrap().last_displayed_prediction;

        let r2 = engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(1.0), Some(5.0)), false))
            .unwrap();
        assert_eq!(r2.records[0].t_time_prediction, Some(2.0));
        assert_eq!(r2.records[0].next_step, NextStep::Collecting);
        assert_eq!(engine.feature_state(1).unwrap().last_displayed_prediction, frozen);

        let r3 = engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(1.0), None), true))
            .unwrap();
        assert_eq!(r3.records[0].t_time_prediction, None);
        assert_eq!(r3.records[0].next_step, NextStep::Unavailable);
    }

    #[test]
    fn test_out_of_range_flag() {
        let mut engine = Engine::default();
        let report = engine
            .reconcile_tick(&batch_with(FeatureInput::new(RawFeatureValue::Bare(250.0), None), false))
            .unwrap();
        assert!(report.records[0].out_of_range);
        assert_eq!(report.records[0].status, DataStatus::Valid);
        assert!(!report.records[1].out_of_range);
    }
}
