use crate::device::Collect;
use crate::error::{EvalError, EvalResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// A metric value and the weight it carries in an average, typically the
/// number of examples it was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedScalar {
    pub value: f64,
    pub weight: f64,
}

impl WeightedScalar {
    #[must_use]
    pub fn new(value: f64, weight: f64) -> Self {
        Self { value, weight }
    }
}

/// Named weighted scalars reported by one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightedScalars(BTreeMap<String, WeightedScalar>);

impl WeightedScalars {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: f64, weight: f64) -> Self {
        self.insert(name, value, weight);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64, weight: f64) {
        self.0.insert(name.into(), WeightedScalar::new(value, weight));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<WeightedScalar> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WeightedScalar)> {
        self.0.iter()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, WeightedScalar)> for WeightedScalars {
    fn from_iter<I: IntoIterator<Item = (String, WeightedScalar)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Weighted all-reduce: per key, `Σ vᵢwᵢ / Σ wᵢ` with weights summed.
impl Collect for WeightedScalars {
    fn all_reduce(parts: Vec<Self>) -> EvalResult<Self> {
        let mut iter = parts.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Self::new());
        };
        let mut sums: BTreeMap<String, (f64, f64)> =
            first.0.into_iter().map(|(k, s)| (k, (s.value * s.weight, s.weight))).collect();
        for part in iter {
            if part.0.len() != sums.len() || part.0.keys().any(|k| !sums.contains_key(k)) {
                return Err(EvalError::KeyMismatch { left: sums.keys().cloned().collect(), right: part.keys() });
            }
            for (k, s) in part.0 {
                if let Some((total, weight)) = sums.get_mut(&k) {
                    *total += s.value * s.weight;
                    *weight += s.weight;
                }
            }
        }
        Ok(sums
            .into_iter()
            .map(|(k, (total, weight))| {
                let value = if weight == 0.0 { 0.0 } else { total / weight };
                (k, WeightedScalar::new(value, weight))
            })
            .collect())
    }
}

/// Running weighted mean per metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeanMetrics {
    entries: BTreeMap<String, WeightedScalar>,
}

impl MeanMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one step's scalars into the running means.
    pub fn store(&mut self, scalars: &WeightedScalars) {
        for (name, s) in scalars.iter() {
            self.fold(name, s.value * s.weight, s.weight, s.value);
        }
    }

    /// Folds several steps at once. Equivalent to storing each in turn.
    pub fn store_all(&mut self, batches: &[WeightedScalars]) {
        let mut sums: BTreeMap<&str, (f64, f64, f64)> = BTreeMap::new();
        for scalars in batches {
            for (name, s) in scalars.iter() {
                let entry = sums.entry(name.as_str()).or_insert((0.0, 0.0, s.value));
                entry.0 += s.value * s.weight;
                entry.1 += s.weight;
            }
        }
        for (name, (total, weight, first)) in sums {
            self.fold(name, total, weight, first);
        }
    }

    // `first` seeds a new entry whose incoming weight is zero.
    fn fold(&mut self, name: &str, weighted_total: f64, weight: f64, first: f64) {
        let entry = self.entries.entry(name.to_string()).or_insert(WeightedScalar::new(first, 0.0));
        let combined = entry.weight + weight;
        if combined > 0.0 {
            // Incremental form of (mean·W + Σvw) / (W + Σw).
            entry.value += (weighted_total - weight * entry.value) / combined;
        }
        entry.weight = combined;
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<WeightedScalar> {
        self.entries.get(name).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current means as plain floats, logged under `namespace`.
    pub fn summarize(&self, step: u64, namespace: &str) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .map(|(name, s)| {
                info!(step, metric = %format!("{namespace}/{name}"), value = s.value, weight = s.weight, "metric");
                (name.clone(), s.value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceValues;

    #[test]
    fn test_running_mean_matches_weighted_average() {
        let mut metrics = MeanMetrics::new();
        for (v, w) in [(1.0, 1.0), (2.0, 1.0), (3.0, 2.0)] {
            metrics.store(&WeightedScalars::new().with("acc", v, w));
        }
        let acc = metrics.get("acc").unwrap();
        assert!((acc.value - 2.25).abs() < 1e-12);
        assert!((acc.weight - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_store_all_matches_sequential_store() {
        let batches: Vec<_> =
            [(1.0, 1.0), (2.0, 1.0), (3.0, 2.0)].iter().map(|&(v, w)| WeightedScalars::new().with("acc", v, w)).collect();
        let mut sequential = MeanMetrics::new();
        for b in &batches {
            sequential.store(b);
        }
        let mut batched = MeanMetrics::new();
        batched.store_all(&batches);
        assert!((sequential.get("acc").unwrap().value - batched.get("acc").unwrap().value).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weight_keeps_the_value() {
        let mut metrics = MeanMetrics::new();
        metrics.store(&WeightedScalars::new().with("x", 5.0, 0.0));
        assert_eq!(metrics.get("x").unwrap().value, 5.0);
        metrics.store(&WeightedScalars::new().with("x", 1.0, 2.0));
        assert_eq!(metrics.get("x").unwrap().value, 1.0);
    }

    #[test]
    fn test_all_reduce_weights_each_device() {
        let parts = vec![WeightedScalars::new().with("loss", 1.0, 1.0), WeightedScalars::new().with("loss", 4.0, 3.0)];
        let reduced = DeviceValues::PerDevice(parts).into_host().unwrap();
        let loss = reduced.get("loss").unwrap();
        assert!((loss.value - 3.25).abs() < 1e-12);
        assert_eq!(loss.weight, 4.0);

        let mismatched = vec![WeightedScalars::new().with("a", 1.0, 1.0), WeightedScalars::new().with("b", 1.0, 1.0)];
        assert!(matches!(DeviceValues::PerDevice(mismatched).into_host(), Err(EvalError::KeyMismatch { .. })));
    }
}
