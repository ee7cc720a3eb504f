use sha2::{Digest, Sha256};

use super::raw::{Batch, RawFeatureValue};

/// SHA-256 over the batch's current readings, in catalog order.
pub fn fingerprint(batch: &Batch) -> String {
    let mut hasher = Sha256::new();
    for input in &batch.features {
        match &input.raw {
            RawFeatureValue::Absent => hasher.update(b"-;"),
            RawFeatureValue::Malformed(_) => hasher.update(b"!;"),
            raw => match raw.numeric() {
                Some(v) => hasher.update(format!("{};", v.to_bits()).as_bytes()),
                None => hasher.update(b"?;"),
            },
        }
    }
    hex::encode(hasher.finalize())
}

/// Spots an upstream that keeps serving the same readings.
#[derive(Debug, Default)]
pub struct StaleDetector {
    last: Option<String>,
    repeats: u64,
    total: u64,
}

impl StaleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fingerprint and the current repeat run when the batch
    /// matches the previous one.
    pub fn observe(&mut self, batch: &Batch) -> Option<(String, u64)> {
        let fp = fingerprint(batch);
        if self.last.as_deref() == Some(fp.as_str()) {
            self.repeats += 1;
            self.total += 1;
            Some((fp, self.repeats))
        } else {
            self.last = Some(fp);
            self.repeats = 0;
            None
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
