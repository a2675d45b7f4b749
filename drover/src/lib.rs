//! Drover: a phase-synchronized actor execution core for database workload
//! generation.
//!
//! A workload is a set of actors (units of concurrent work) driven through a
//! shared sequence of phases. Within a phase every actor runs its per-phase
//! body as often as the phase's iteration policy says; at phase boundaries all
//! actors meet at a barrier, so phase *k + 1* never starts while phase *k* work
//! is still running somewhere.
//!
//! # Architecture
//!
//! - [`WorkloadConfig`]: the TOML description of a run (actor blocks, threads,
//!   phases and their free-form parameters).
//! - [`Cast`]: the registry of actor kinds a workload may name.
//! - [`Actor`] / [`ActorKind`]: the capability an actor type implements, a
//!   constructor plus a single `run`.
//! - [`PhaseLoop`]: the per-actor driver that walks the phases in lockstep with
//!   its siblings, backed by the shared [`Orchestrator`] barrier.
//! - [`SharedStateRegistry`]: typed per-run singletons, built at most once and
//!   shared by reference.
//! - [`MetricsRegistry`]: the facade actors time their operations with; events
//!   go to a [`MetricsSink`] and can be folded into an [`Aggregate`] and turned
//!   into a [`Report`].
//! - [`Workload`] / [`WorkloadContext`]: owns all of the above, builds the actors
//!   and runs them.
//!
//! # Example
//!
//! ```rust,no_run
//! use drover::{Cast, Workload, WorkloadConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkloadConfig::from_toml_str(
//!         r#"
//!         [[Actors]]
//!         Type = "HelloWorld"
//!         Threads = 3
//!
//!         [[Actors.Phases]]
//!         Repeat = 10
//!
//!         [[Actors.Phases]]
//!         Duration = "1 second"
//!         "#,
//!     )?;
//!
//!     let summary = Workload::builder()
//!         .config(config)
//!         .cast(Cast::with_builtins())
//!         .build()
//!         .setup()?
//!         .run()
//!         .await?;
//!     println!("{} phases completed", summary.phases_completed);
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: re-exports `#[phase_config]` and `#[aggregate]`. (Enabled by default)
//! - `builtins`: the `HelloWorld` actor, `RunReport`, `StdoutReporter` and
//!   `JsonReporter`. (Enabled by default)

/// Actor trait, lifecycle and construction context
pub mod actor;
/// Built-in actors
#[cfg(feature = "builtins")]
pub mod actors;
/// Metric aggregators
pub mod aggregate;
/// Registry of actor kinds
pub mod cast;
pub mod config;
pub mod error;
/// Runs actors as tasks and collects their outcomes
pub mod executor;
/// Single metrics
pub mod metric;
/// The metrics facade and sinks
pub mod metrics;
pub mod orchestrator;
pub mod phase;
pub mod rate;
/// Reports and Reporters
pub mod report;
pub mod state;
pub mod workload;

pub use actor::{Actor, ActorContext, ActorId, ActorInstance, ActorKind, ActorState};
pub use aggregate::Aggregate;
pub use cast::Cast;
pub use config::WorkloadConfig;
pub use error::{ActorError, ConfigError, MetricsError, RunError, SetupError, StateError, SyncError};
pub use executor::RunSummary;
pub use metric::Metric;
pub use metrics::{MemorySink, MetricsRegistry, MetricsSink, Operation, OperationContext};
pub use orchestrator::Orchestrator;
pub use phase::{ActorPhase, PhaseLoop, PhaseNumber};
pub use report::{Report, Reporter};
pub use state::{SharedStateRegistry, StateKey};
pub use workload::{StopHandle, Workload, WorkloadContext};

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use drover_macros::*;
}
