//! Structured metric accumulators that merge across batches and devices.

use crate::device::Collect;
use crate::error::{EvalError, EvalResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mergeable metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Accumulator {
    /// Weighted mean: `total` is the weighted sum.
    Mean { total: f64, weight: f64 },
    Sum { total: f64 },
    Min { value: f64 },
    Max { value: f64 },
    /// Counts per bucket; `edges` has one more entry than `counts`.
    Histogram { edges: Vec<f64>, counts: Vec<u64> },
    Nested { children: MetricTree },
}

impl Accumulator {
    #[must_use]
    pub fn mean(value: f64, weight: f64) -> Self {
        Self::Mean { total: value * weight, weight }
    }

    #[must_use]
    pub fn sum(total: f64) -> Self {
        Self::Sum { total }
    }

    #[must_use]
    pub fn min(value: f64) -> Self {
        Self::Min { value }
    }

    #[must_use]
    pub fn max(value: f64) -> Self {
        Self::Max { value }
    }

    /// Buckets `values` by `edges`. Values outside the edges land in the
    /// first or last bucket.
    #[must_use]
    pub fn histogram(edges: Vec<f64>, values: &[f64]) -> Self {
        let buckets = edges.len().saturating_sub(1);
        let mut counts = vec![0u64; buckets];
        if buckets > 0 {
            for v in values {
                let idx = edges[1..].iter().position(|edge| v < edge).unwrap_or(buckets - 1);
                counts[idx] += 1;
            }
        }
        Self::Histogram { edges, counts }
    }

    #[must_use]
    pub fn nested(children: MetricTree) -> Self {
        Self::Nested { children }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Mean { .. } => "mean",
            Self::Sum { .. } => "sum",
            Self::Min { .. } => "min",
            Self::Max { .. } => "max",
            Self::Histogram { .. } => "histogram",
            Self::Nested { .. } => "nested",
        }
    }

    /// Combines two accumulators of the same kind.
    pub fn merge(&self, other: &Self, key: &str) -> EvalResult<Self> {
        let merged = match (self, other) {
            (Self::Mean { total: a, weight: wa }, Self::Mean { total: b, weight: wb }) => {
                Self::Mean { total: a + b, weight: wa + wb }
            }
            (Self::Sum { total: a }, Self::Sum { total: b }) => Self::Sum { total: a + b },
            (Self::Min { value: a }, Self::Min { value: b }) => Self::Min { value: a.min(*b) },
            (Self::Max { value: a }, Self::Max { value: b }) => Self::Max { value: a.max(*b) },
            (Self::Histogram { edges: ea, counts: ca }, Self::Histogram { edges: eb, counts: cb }) => {
                self.check(key)?;
                other.check(key)?;
                if ea != eb || ca.len() != cb.len() {
                    return Err(EvalError::AccumulatorMismatch {
                        key: key.to_string(),
                        reason: "histogram bucket edges differ".to_string(),
                    });
                }
                Self::Histogram { edges: ea.clone(), counts: ca.iter().zip(cb).map(|(a, b)| a + b).collect() }
            }
            (Self::Nested { children: a }, Self::Nested { children: b }) => {
                Self::Nested { children: a.merge_at(b, key)? }
            }
            (a, b) => {
                return Err(EvalError::AccumulatorMismatch {
                    key: key.to_string(),
                    reason: format!("cannot merge {} with {}", a.kind(), b.kind()),
                });
            }
        };
        Ok(merged)
    }

    /// Rejects a histogram whose edges don't bound its buckets, at any depth.
    pub fn check(&self, key: &str) -> EvalResult<()> {
        match self {
            Self::Histogram { edges, counts } if edges.len() != counts.len() + 1 => {
                Err(EvalError::AccumulatorMismatch {
                    key: key.to_string(),
                    reason: format!("histogram has {} edges for {} buckets", edges.len(), counts.len()),
                })
            }
            Self::Nested { children } => children.check_at(key),
            _ => Ok(()),
        }
    }

    /// Final value; `None` for nested accumulators, which flatten instead,
    /// and for malformed histograms.
    #[must_use]
    pub fn compute(&self) -> Option<f64> {
        match self {
            Self::Mean { total, weight } => Some(if *weight == 0.0 { 0.0 } else { total / weight }),
            Self::Sum { total } => Some(*total),
            Self::Min { value } | Self::Max { value } => Some(*value),
            Self::Histogram { edges, counts } => {
                if edges.len() != counts.len() + 1 {
                    return None;
                }
                let n: u64 = counts.iter().sum();
                if n == 0 {
                    return Some(0.0);
                }
                let weighted: f64 =
                    counts.iter().zip(edges.windows(2)).map(|(&c, pair)| c as f64 * (pair[0] + pair[1]) / 2.0).sum();
                Some(weighted / n as f64)
            }
            Self::Nested { .. } => None,
        }
    }
}

/// Named accumulators, possibly nested. Two trees merge only when they
/// hold the same keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricTree(BTreeMap<String, Accumulator>);

impl MetricTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, acc: Accumulator) -> Self {
        self.0.insert(name.into(), acc);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Accumulator> {
        self.0.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Merges two trees key by key.
    pub fn merge(&self, other: &Self) -> EvalResult<Self> {
        self.merge_at(other, "")
    }

    fn merge_at(&self, other: &Self, prefix: &str) -> EvalResult<Self> {
        if self.0.len() != other.0.len() || self.0.keys().zip(other.0.keys()).any(|(a, b)| a != b) {
            return Err(EvalError::KeyMismatch { left: self.keys(), right: other.keys() });
        }
        let mut merged = BTreeMap::new();
        for ((name, a), b) in self.0.iter().zip(other.0.values()) {
            let key = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            merged.insert(name.clone(), a.merge(b, &key)?);
        }
        Ok(Self(merged))
    }

    fn check_at(&self, prefix: &str) -> EvalResult<()> {
        for (name, acc) in &self.0 {
            let key = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            acc.check(&key)?;
        }
        Ok(())
    }

    /// Merges `update` into the running tree. An empty running tree takes
    /// `update` as is, once it is well formed; otherwise the key sets must
    /// match.
    pub fn absorb(&mut self, update: Self) -> EvalResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            update.check_at("")?;
            *self = update;
        } else {
            *self = self.merge(&update)?;
        }
        Ok(())
    }

    /// Final values flattened to `/`-joined keys.
    #[must_use]
    pub fn summarize(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut BTreeMap<String, f64>) {
        for (name, acc) in &self.0 {
            let key = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            match acc {
                Accumulator::Nested { children } => children.flatten_into(&key, out),
                other => {
                    if let Some(v) = other.compute() {
                        out.insert(key, v);
                    }
                }
            }
        }
    }
}

impl Collect for MetricTree {
    fn all_reduce(parts: Vec<Self>) -> EvalResult<Self> {
        let mut iter = parts.into_iter();
        let first = iter.next().unwrap_or_default();
        iter.try_fold(first, |acc, part| acc.merge(&part))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(mean: (f64, f64), lo: f64, errs: &[f64]) -> MetricTree {
        MetricTree::new()
            .with("accuracy", Accumulator::mean(mean.0, mean.1))
            .with("min_len", Accumulator::min(lo))
            .with(
                "decoder",
                Accumulator::nested(
                    MetricTree::new()
                        .with("errors", Accumulator::histogram(vec![0.0, 1.0, 2.0, 4.0], errs))
                        .with("words", Accumulator::sum(errs.len() as f64)),
                ),
            )
    }

    #[test]
    fn test_merge_is_associative_and_commutative() {
        let a = tree((0.5, 2.0), 3.0, &[0.5, 1.5]);
        let b = tree((1.0, 1.0), 1.0, &[3.0]);
        let c = tree((0.0, 1.0), 7.0, &[0.1, 0.2, 2.5]);

        let left = a.merge(&b).unwrap().merge(&c).unwrap().summarize();
        let right = a.merge(&b.merge(&c).unwrap()).unwrap().summarize();
        let swapped = b.merge(&a).unwrap().summarize();
        let ab = a.merge(&b).unwrap().summarize();

        for (k, v) in &left {
            assert!((v - right[k]).abs() < 1e-9, "{k}");
        }
        for (k, v) in &ab {
            assert!((v - swapped[k]).abs() < 1e-9, "{k}");
        }
        assert!((left["accuracy"] - 0.5).abs() < 1e-9);
        assert_eq!(left["min_len"], 1.0);
        assert_eq!(left["decoder/words"], 6.0);
    }

    #[test]
    fn test_key_mismatch_is_an_error() {
        let a = MetricTree::new().with("x", Accumulator::sum(1.0));
        let b = MetricTree::new().with("y", Accumulator::sum(1.0));
        match a.merge(&b) {
            Err(EvalError::KeyMismatch { left, right }) => {
                assert_eq!(left, vec!["x"]);
                assert_eq!(right, vec!["y"]);
            }
            other => panic!("expected KeyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_kind_mismatch_names_the_key() {
        let a = MetricTree::new().with("n", Accumulator::nested(MetricTree::new().with("x", Accumulator::sum(1.0))));
        let b = MetricTree::new().with("n", Accumulator::nested(MetricTree::new().with("x", Accumulator::max(1.0))));
        match a.merge(&b) {
            Err(EvalError::AccumulatorMismatch { key, .. }) => assert_eq!(key, "n/x"),
            other => panic!("expected AccumulatorMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_absorb_adopts_first_update() {
        let mut running = MetricTree::new();
        running.absorb(MetricTree::new().with("s", Accumulator::sum(2.0))).unwrap();
        running.absorb(MetricTree::new().with("s", Accumulator::sum(3.0))).unwrap();
        assert_eq!(running.summarize()["s"], 5.0);
    }

    #[test]
    fn test_histogram_buckets_and_mean() {
        let hist = Accumulator::histogram(vec![0.0, 2.0, 4.0], &[1.0, 1.0, 3.0, 9.0]);
        assert_eq!(hist, Accumulator::Histogram { edges: vec![0.0, 2.0, 4.0], counts: vec![2, 2] });
        assert_eq!(hist.compute(), Some(2.0));
        let other = Accumulator::histogram(vec![0.0, 1.0], &[]);
        assert!(hist.merge(&other, "h").is_err());
    }

    #[test]
    fn test_malformed_histogram_is_rejected_not_panicking() {
        let bad = Accumulator::Histogram { edges: vec![0.0], counts: vec![3] };
        assert_eq!(bad.compute(), None);
        assert!(MetricTree::new().with("h", bad.clone()).summarize().is_empty());

        let mut running = MetricTree::new();
        let nested = MetricTree::new().with("lens", Accumulator::nested(MetricTree::new().with("h", bad.clone())));
        match running.absorb(nested) {
            Err(EvalError::AccumulatorMismatch { key, .. }) => assert_eq!(key, "lens/h"),
            other => panic!("expected AccumulatorMismatch, got {other:?}"),
        }
        assert!(running.is_empty());

        let good = Accumulator::Histogram { edges: vec![0.0, 1.0], counts: vec![3] };
        let short = Accumulator::Histogram { edges: vec![0.0, 1.0], counts: vec![] };
        assert!(matches!(good.merge(&bad, "h"), Err(EvalError::AccumulatorMismatch { .. })));
        assert!(matches!(short.merge(&short, "h"), Err(EvalError::AccumulatorMismatch { .. })));
    }
}
