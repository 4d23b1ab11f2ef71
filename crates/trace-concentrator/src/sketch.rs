// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Duration distribution of a stats group.
//!
//! Wraps a [`DDSketch`] configured with the bucket's `eps` as its relative
//! accuracy. Only a fixed set of quantiles goes on the wire.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use sketches_ddsketch::{Config as DDSketchConfig, DDSketch};
use tracing::warn;

use crate::config::{is_valid_eps, DEFAULT_EPS};

/// Bin budget of a sketch; lower bins collapse past this.
const MAX_BINS: u32 = 2048;

/// Durations are in nanoseconds, anything below one lands in the zero bin.
const MIN_VALUE: f64 = 1.0;

#[derive(Clone)]
pub struct DurationSketch {
    eps: f64,
    sketch: DDSketch,
}

// `DDSketch` does not implement `Debug`, so summarize it by count.
impl std::fmt::Debug for DurationSketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurationSketch")
            .field("eps", &self.eps)
            .field("count", &self.sketch.count())
            .finish_non_exhaustive()
    }
}

impl DurationSketch {
    /// `eps` must be in `(0, 1)`; anything else falls back to the default.
    #[must_use]
    pub fn new(eps: f64) -> Self {
        let eps = if is_valid_eps(eps) {
            eps
        } else {
            warn!("Invalid sketch eps {eps}, using {DEFAULT_EPS}");
            DEFAULT_EPS
        };
        Self {
            eps,
            sketch: DDSketch::new(DDSketchConfig::new(eps, MAX_BINS, MIN_VALUE)),
        }
    }

    pub fn insert(&mut self, value: f64) {
        let value = if value.is_finite() { value } else { 0.0 };
        self.sketch.add(value);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.sketch.count() as u64
    }

    #[must_use]
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Estimated value at quantile `q` (clamped to `[0, 1]`), or `None` when
    /// the sketch is empty.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.sketch.quantile(q.clamp(0.0, 1.0)).ok().flatten()
    }
}

impl Serialize for DurationSketch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DurationSketch", 9)?;
        state.serialize_field("eps", &self.eps)?;
        state.serialize_field("count", &self.count())?;
        state.serialize_field("min", &self.sketch.min())?;
        state.serialize_field("max", &self.sketch.max())?;
        state.serialize_field("p50", &self.quantile(0.5))?;
        state.serialize_field("p75", &self.quantile(0.75))?;
        state.serialize_field("p90", &self.quantile(0.9))?;
        state.serialize_field("p95", &self.quantile(0.95))?;
        state.serialize_field("p99", &self.quantile(0.99))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_sketch() {
        let sketch = DurationSketch::new(0.01);
        assert_eq!(sketch.count(), 0);
        assert_eq!(sketch.quantile(0.5), None);
    }

    #[test]
    fn test_zero_durations() {
        let mut sketch = DurationSketch::new(0.01);
        sketch.insert(0.0);
        sketch.insert(f64::NAN);
        sketch.insert(100.0);

        assert_eq!(sketch.count(), 3);
        assert_eq!(sketch.quantile(0.0), Some(0.0));
        let max = sketch.quantile(1.0).expect("non-empty sketch");
        assert!((max - 100.0).abs() <= 1.0);
    }

    #[test]
    fn test_keeps_every_valid_eps() {
        for eps in [1e-9, 0.01, 0.5, 0.9, 0.999] {
            assert_eq!(DurationSketch::new(eps).eps(), eps);
        }
    }

    #[test]
    fn test_invalid_eps_falls_back_to_default() {
        assert_eq!(DurationSketch::new(0.0).eps(), DEFAULT_EPS);
        assert_eq!(DurationSketch::new(1.0).eps(), DEFAULT_EPS);
        assert_eq!(DurationSketch::new(f64::NAN).eps(), DEFAULT_EPS);
    }

    #[test]
    fn test_serialized_quantiles() {
        let mut sketch = DurationSketch::new(0.01);
        for v in 1..=100 {
            sketch.insert(f64::from(v));
        }
        let json = serde_json::to_value(&sketch).expect("sketch should serialize");
        assert_eq!(json["count"], 100);
        assert_eq!(json["min"], 1.0);
        assert_eq!(json["max"], 100.0);
        let p50 = json["p50"].as_f64().expect("p50 is a number");
        assert!((p50 - 50.0).abs() <= 50.0 * 0.011);
    }

    proptest! {
        #[test]
        fn quantiles_stay_within_relative_error(
            mut values in prop::collection::vec(2.0f64..1e9, 1..200),
            q in 0.0f64..=1.0,
        ) {
            let eps = 0.02;
            let mut sketch = DurationSketch::new(eps);
            for v in &values {
                sketch.insert(*v);
            }
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let rank = (q * (values.len() - 1) as f64).floor() as usize;
            let exact = values[rank];
            let estimate = sketch.quantile(q).unwrap();
            prop_assert!((estimate - exact).abs() <= exact * eps * 1.01);
        }
    }
}
