use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::{Aggregate, error::BoxError};

/// Final statistics derived from an [`Aggregate`].
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Sends a [`Report`] somewhere: stdout, a file, a results database.
#[async_trait]
pub trait Reporter<A: Aggregate, R: Report<A>> {
    async fn report(&self, report: &R) -> Result<(), BoxError>;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{collections::BTreeMap, time::Duration};

    use serde::Deserialize;

    use crate::aggregate::{MetricsAggregate, OperationStats};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    pub struct OperationReport {
        pub count: u64,
        /// Percentage of operations that reported success.
        pub success_ratio: f64,
        pub average_latency: Duration,
        pub max_latency: Duration,
        pub documents: u64,
        pub bytes: u64,
    }

    impl From<&OperationStats> for OperationReport {
        fn from(stats: &OperationStats) -> Self {
            let (success_ratio, average_latency) = if stats.count == 0 {
                (0.0, Duration::ZERO)
            } else {
                (
                    stats.successes as f64 / stats.count as f64 * 100.0,
                    stats.total_duration.div_f64(stats.count as f64),
                )
            };
            Self {
                count: stats.count,
                success_ratio,
                average_latency,
                max_latency: stats.max_duration,
                documents: stats.documents,
                bytes: stats.bytes,
            }
        }
    }

    /// Per `Actor.Operation` summary of a run.
    #[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
    pub struct RunReport {
        pub operations: BTreeMap<String, OperationReport>,
    }

    impl From<MetricsAggregate> for RunReport {
        fn from(value: MetricsAggregate) -> Self {
            Self {
                operations: value
                    .operations
                    .iter()
                    .map(|(key, stats)| (key.clone(), OperationReport::from(stats)))
                    .collect(),
            }
        }
    }

    impl Report<MetricsAggregate> for RunReport {}

    pub struct StdoutReporter;

    #[async_trait]
    impl Reporter<MetricsAggregate, RunReport> for StdoutReporter {
        async fn report(&self, report: &RunReport) -> Result<(), BoxError> {
            println!("{report:#?}");
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct JsonReporter {
        pub pretty: bool,
    }

    impl JsonReporter {
        pub fn render(&self, report: &RunReport) -> Result<String, serde_json::Error> {
            if self.pretty {
                serde_json::to_string_pretty(report)
            } else {
                serde_json::to_string(report)
            }
        }
    }

    #[async_trait]
    impl Reporter<MetricsAggregate, RunReport> for JsonReporter {
        async fn report(&self, report: &RunReport) -> Result<(), BoxError> {
            println!("{}", self.render(report)?);
            Ok(())
        }
    }

}
