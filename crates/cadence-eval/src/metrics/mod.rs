//! Metric accumulation: running weighted means for scalars, and mergeable
//! accumulator trees for structured metrics.

mod accumulator;
mod weighted;

pub use accumulator::{Accumulator, MetricTree};
pub use weighted::{MeanMetrics, WeightedScalar, WeightedScalars};

use std::collections::BTreeMap;

/// Plain metric name to value map, as handed to summary sinks.
pub type FloatMetrics = BTreeMap<String, f64>;

/// Overlays `update` on `base`; keys present in both take `update`'s value.
#[must_use]
pub fn update_float_dict(mut base: FloatMetrics, update: FloatMetrics) -> FloatMetrics {
    base.extend(update);
    base
}

/// First value of `name` across `dicts`, in order.
#[must_use]
pub fn find_metric(dicts: &[&FloatMetrics], name: &str) -> Option<f64> {
    dicts.iter().find_map(|d| d.get(name).copied())
}
