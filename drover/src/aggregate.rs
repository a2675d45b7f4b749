use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use drover_macros::aggregate;

use crate::{
    Metric,
    metric::{OperationEvent, Outcome},
};

/// Collects raw [`Metric`] samples into a compact, mergeable representation.
///
/// Aggregates keep what a [`crate::Report`] needs to derive statistics later
/// (counts, sums, maxima) and leave the derivation itself to the report.
/// `merge` must be associative and commutative since per-task aggregates are
/// merged in no particular order.
///
/// ```rust
/// use drover::{Aggregate, Metric, macros::aggregate};
///
/// #[derive(Debug, Clone)]
/// struct Latency(u64);
/// impl Metric for Latency {}
///
/// #[aggregate]
/// struct Total {
///     count: u64,
///     sum: u128,
/// }
///
/// impl Aggregate for Total {
///     type Metric = Latency;
///
///     fn new() -> Self {
///         Self { count: 0, sum: 0 }
///     }
///
///     fn consume(&mut self, metric: &Self::Metric) {
///         self.count += 1;
///         self.sum += metric.0 as u128;
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.count += other.count;
///         self.sum += other.sum;
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    fn new() -> Self;

    /// Calls [`consume`](Self::consume) for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    fn consume(&mut self, metric: &Self::Metric);

    fn merge(&mut self, other: Self);
}

/// Raw totals for one `Actor.Operation`.
#[aggregate]
#[derive(Default)]
pub struct OperationStats {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
    pub documents: u64,
    pub bytes: u64,
    pub iterations: u64,
}

impl OperationStats {
    fn record(&mut self, event: &OperationEvent) {
        let duration = event.duration();
        self.count += 1;
        match event.outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
        }
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
        self.documents += event.documents;
        self.bytes += event.bytes;
        self.iterations += event.iterations;
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.successes += other.successes;
        self.failures += other.failures;
        self.total_duration += other.total_duration;
        self.max_duration = self.max_duration.max(other.max_duration);
        self.documents += other.documents;
        self.bytes += other.bytes;
        self.iterations += other.iterations;
    }
}

/// Per-operation totals of a whole run, keyed by `Actor.Operation`.
#[aggregate]
#[derive(Default)]
pub struct MetricsAggregate {
    pub operations: BTreeMap<String, OperationStats>,
}

impl MetricsAggregate {
    pub fn get(&self, key: &str) -> Option<&OperationStats> {
        self.operations.get(key)
    }

    pub fn total_count(&self) -> u64 {
        self.operations.values().map(|stats| stats.count).sum()
    }
}

impl Aggregate for MetricsAggregate {
    type Metric = OperationEvent;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.operations
            .entry(metric.key())
            .or_default()
            .record(metric);
    }

    fn merge(&mut self, other: Self) {
        for (key, stats) in other.operations {
            self.operations.entry(key).or_default().merge(&stats);
        }
    }
}
