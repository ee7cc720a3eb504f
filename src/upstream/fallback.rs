use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::catalog::{self, CUTTERHEAD_TORQUE_ID};
use crate::config::Config;
use crate::logging::log_fallback_batch;
use crate::reconcile::{Batch, BatchOrigin, FeatureInput, MachineActivity, RawFeatureValue, Source};

/// Largest relative step a synthetic reading takes away from its base.
const JITTER: f64 = 0.05;

/// Synthesizes batches while the upstream is unreachable.
///
/// Each reading drifts from a base: the last value the dashboard showed for
/// that feature, or the unit default when nothing has been seen yet. Every value it produces is tagged `simulated`, so the display never
/// mistakes it for upstream data. It never emits forecasts and always reports
/// the buffer as not ready, which keeps prediction state frozen during an
/// outage.
pub struct FallbackGenerator {
    rng: StdRng,
    presence: f64,
    predicted_fraction: f64,
}

impl FallbackGenerator {
    pub fn new(presence: f64, predicted_fraction: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            presence: presence.clamp(0.0, 1.0),
            predicted_fraction: predicted_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.fallback_presence, cfg.fallback_predicted, cfg.fallback_seed)
    }

    /// Next reading around `base`, kept within 70%..130% of it and never negative.
    fn drift(&mut self, base: f64) -> f64 {
        let base = base.max(0.0);
        let step = base * JITTER * self.rng.gen_range(-1.0..=1.0);
        (base + step).clamp(base * 0.7, base * 1.3)
    }

    /// `step_count` is carried over from the last upstream batch. `last_values`
    /// holds the last shown value per feature, in catalog order.
    pub fn generate(&mut self, step_count: u64, last_values: &[Option<f64>], reason: &str) -> Batch {
        let mut features = Vec::with_capacity(catalog::FEATURE_COUNT);
        let mut present = 0;
        let mut predicted = 0;
        for desc in catalog::features() {
            if !self.rng.gen_bool(self.presence) {
                features.push(FeatureInput::absent());
                continue;
            }
            let base = last_values
                .get(desc.index())
                .copied()
                .flatten()
                .filter(|v| v.is_finite())
                .unwrap_or_else(|| desc.seed_value());
            let value = self.drift(base);
            let is_predicted = self.rng.gen_bool(self.predicted_fraction);
            present += 1;
            if is_predicted {
                predicted += 1;
            }
            features.push(FeatureInput::new(
                RawFeatureValue::Tagged {
                    value: Some(value),
                    predicted: is_predicted,
                    source: Some(Source::Simulated),
                },
                None,
            ));
        }

        let torque = features
            .get(usize::from(CUTTERHEAD_TORQUE_ID) - 1)
            .and_then(|f| f.raw.numeric());
        log_fallback_batch(present, predicted, reason);

        Batch {
            features,
            step_count,
            buffer_ready: false,
            activity: MachineActivity::from_torque(torque),
            origin: BatchOrigin::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FEATURE_COUNT;

    const NOTHING_SEEN: [Option<f64>; FEATURE_COUNT] = [None; FEATURE_COUNT];

    fn within_jitter(v: f64, base: f64) -> bool {
        v >= base * (1.0 - JITTER) - 1e-9 && v <= base * (1.0 + JITTER) + 1e-9
    }

    #[test]
    fn test_every_value_is_simulated_and_near_default() {
        let mut gen = FallbackGenerator::new(1.0, 0.0, Some(7));
        let batch = gen.generate(3, &NOTHING_SEEN, "test");
        assert_eq!(batch.len(), FEATURE_COUNT);
        assert_eq!(batch.origin, BatchOrigin::Fallback);
        assert_eq!(batch.step_count, 3);
        assert!(!batch.buffer_ready);
        for (desc, input) in catalog::features().iter().zip(&batch.features) {
            assert_eq!(input.raw.explicit_source(), Some(Source::Simulated));
            assert!(input.prediction.is_none());
            let v = input.raw.numeric().unwrap();
            assert!(within_jitter(v, desc.seed_value()), "{} = {}", desc.name, v);
            assert!(desc.is_plausible(v), "{} = {}", desc.name, v);
        }
        assert_eq!(batch.activity, MachineActivity::Active);
    }

    #[test]
    fn test_unit_default_seeds_the_series() {
        let mut gen = FallbackGenerator::new(1.0, 0.0, Some(3));
        let batch = gen.generate(0, &NOTHING_SEEN, "test");
        let force = batch.features[13].raw.numeric().unwrap();
        assert!((9_500.0..=10_500.0).contains(&force), "thrust force {}", force);
        let torque = batch.features[20].raw.numeric().unwrap();
        assert!((2_850.0..=3_150.0).contains(&torque), "torque {}", torque);
    }

    #[test]
    fn test_last_value_is_the_base() {
        let mut last = NOTHING_SEEN;
        last[0] = Some(2.0);
        last[13] = Some(12_000.0);
        last[21] = Some(0.0);
        let mut gen = FallbackGenerator::new(1.0, 0.0, Some(11));
        for _ in 0..20 {
            let batch = gen.generate(0, &last, "test");
            assert!(within_jitter(batch.features[0].raw.numeric().unwrap(), 2.0));
            assert!(within_jitter(batch.features[13].raw.numeric().unwrap(), 12_000.0));
            assert_eq!(batch.features[21].raw.numeric(), Some(0.0));
        }
    }

    #[test]
    fn test_drift_never_goes_negative() {
        let mut gen = FallbackGenerator::new(1.0, 0.0, Some(2));
        assert_eq!(gen.drift(-40.0), 0.0);
        assert_eq!(gen.drift(f64::NAN), 0.0);
    }

    #[test]
    fn test_zero_presence_is_all_absent() {
        let mut gen = FallbackGenerator::new(0.0, 0.5, Some(1));
        let batch = gen.generate(0, &NOTHING_SEEN, "test");
        assert!(batch.features.iter().all(|f| f.raw == RawFeatureValue::Absent));
        assert_eq!(batch.activity, MachineActivity::Rest);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = FallbackGenerator::new(0.7, 0.1, Some(42)).generate(0, &NOTHING_SEEN, "test");
        let b = FallbackGenerator::new(0.7, 0.1, Some(42)).generate(0, &NOTHING_SEEN, "test");
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_predicted_fraction_tags_everything() {
        let mut gen = FallbackGenerator::new(1.0, 1.0, Some(9));
        let batch = gen.generate(0, &NOTHING_SEEN, "test");
        assert!(batch
            .features
            .iter()
            .all(|f| matches!(f.raw, RawFeatureValue::Tagged { predicted: true, .. })));
    }
}
