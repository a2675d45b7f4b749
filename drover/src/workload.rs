//! Workload context: owns everything a run needs and starts it.
//!
//! ```rust,ignore
//! let context = Workload::builder()
//!     .config(WorkloadConfig::from_file(path)?)
//!     .cast(Cast::with_builtins())
//!     .build()
//!     .setup()?;
//! let stop = context.stop_handle();
//! let summary = context.run().await?;
//! ```
//!
//! Setup builds every actor before any of them runs. A setup failure (unknown
//! actor type, bad phase config, shared state that could not be built) fails
//! the whole workload and nothing is started.

use std::{
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    actor::{ActorContext, ActorInstance, Services},
    cast::Cast,
    config::WorkloadConfig,
    error::{ConfigError, RunError},
    executor::{self, RunSummary},
    metrics::{MemorySink, MetricsRegistry, MetricsSink},
    orchestrator::Orchestrator,
    phase::{PhaseNumber, PhaseSchedule},
    state::SharedStateRegistry,
};

#[derive(TypedBuilder)]
pub struct Workload {
    pub config: WorkloadConfig,
    #[builder(default)]
    pub cast: Cast,
    #[builder(default = Arc::new(MemorySink::new()) as Arc<dyn MetricsSink>)]
    pub sink: Arc<dyn MetricsSink>,
    /// Pre-registered shared state, e.g. factories that need outside handles.
    #[builder(default = Arc::new(SharedStateRegistry::new()))]
    pub shared_state: Arc<SharedStateRegistry>,
    /// Overrides the configuration's `Timeout`.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

impl Workload {
    /// Resolves the configuration and constructs every actor.
    pub fn setup(self) -> Result<WorkloadContext, RunError> {
        let orchestrator = Arc::new(Orchestrator::new());
        let metrics = MetricsRegistry::new(self.sink).with_phase_source(Arc::clone(&orchestrator));
        let next_id = AtomicU64::new(0);
        let mut actors = Vec::new();

        for block in &self.config.actors {
            let producer = self
                .cast
                .get(&block.actor_type)
                .ok_or_else(|| ConfigError::UnknownActorType(block.actor_type.clone()))?;
            let name = block
                .name
                .as_deref()
                .unwrap_or(producer.default_name());

            let schedule = Arc::new(PhaseSchedule::from_actor_config(name, block)?);
            if let Some(max) = schedule.max_phase() {
                orchestrator.phases_at_least_to(max);
            }

            let ctx = ActorContext::new(
                Services {
                    orchestrator: &orchestrator,
                    shared_state: &self.shared_state,
                    metrics: &metrics,
                    next_id: &next_id,
                },
                block,
                name,
                schedule,
            );
            let produced = producer
                .produce(&ctx)
                .map_err(|source| RunError::Setup {
                    actor: name.to_string(),
                    source,
                })?;
            tracing::info!("Set up {} instance(s) of actor {name}", produced.len());
            actors.extend(produced);
        }

        Ok(WorkloadContext {
            orchestrator,
            shared_state: self.shared_state,
            metrics,
            actors,
            timeout: self.timeout.or(self.config.timeout),
        })
    }
}

/// A workload that is set up and ready to run.
#[derive(Debug)]
pub struct WorkloadContext {
    orchestrator: Arc<Orchestrator>,
    shared_state: Arc<SharedStateRegistry>,
    metrics: MetricsRegistry,
    actors: Vec<ActorInstance>,
    timeout: Option<Duration>,
}

impl WorkloadContext {
    pub fn shared_state(&self) -> &Arc<SharedStateRegistry> {
        &self.shared_state
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn actors(&self) -> &[ActorInstance] {
        &self.actors
    }

    /// Number of phases in the run, across every actor block.
    pub fn phase_count(&self) -> PhaseNumber {
        self.orchestrator.max_phase().map_or(0, |max| max + 1)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.orchestrator))
    }

    /// Runs every actor to completion.
    pub async fn run(self) -> Result<RunSummary, RunError> {
        tracing::info!(
            "Starting workload: {} actors, {} phases",
            self.actors.len(),
            self.phase_count()
        );
        executor::execute(self.orchestrator, self.actors, self.timeout).await
    }
}

/// Controls a running workload from outside.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<Orchestrator>);

impl StopHandle {
    /// Orderly stop: actors finish their current iteration and exit.
    pub fn stop(&self) {
        self.0.stop();
    }

    /// Ends `UntilSignaled` iteration in `phase`.
    pub fn end_phase(&self, phase: PhaseNumber) {
        self.0.end_phase(phase);
    }

    pub fn current_phase(&self) -> PhaseNumber {
        self.0.current_phase()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::error::SetupError;

    fn config(toml: &str) -> WorkloadConfig {
        WorkloadConfig::from_toml_str(toml).unwrap()
    }

    #[test]
    fn unknown_actor_type_fails_setup() {
        let err = Workload::builder()
            .config(config("[[Actors]]\nType = \"Nobody\"\n"))
            .build()
            .setup()
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(ConfigError::UnknownActorType(ref t)) if t == "Nobody"
        ));
    }

    #[cfg(feature = "builtins")]
    #[test]
    fn setup_builds_every_thread_with_unique_ids() {
        let context = Workload::builder()
            .config(config(
                r#"
[[Actors]]
Type = "HelloWorld"
Threads = 2
[[Actors.Phases]]
Repeat = 1

[[Actors]]
Type = "HelloWorld"
Name = "Second"
Threads = 3
[[Actors.Phases]]
Phase = 2
Repeat = 1
"#,
            ))
            .cast(Cast::with_builtins())
            .build()
            .setup()
            .unwrap();

        assert_eq!(context.actors().len(), 5);
        assert_eq!(context.phase_count(), 3);
        let ids: BTreeSet<_> = context.actors().iter().map(|a| a.id()).collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(context.actors()[0].name(), "HelloWorld");
        assert_eq!(context.actors()[4].name(), "Second");
        assert_eq!(context.orchestrator.required_tokens(), 5);
    }

    #[cfg(feature = "builtins")]
    #[test]
    fn bad_phase_config_fails_setup() {
        let err = Workload::builder()
            .config(config(
                r#"
[[Actors]]
Type = "HelloWorld"
[[Actors.Phases]]
Repeat = 1
Message = 42
"#,
            ))
            .cast(Cast::with_builtins())
            .build()
            .setup()
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Setup {
                source: SetupError::Config(ConfigError::Param { phase: Some(0), .. }),
                ..
            }
        ));
    }

    #[test]
    fn builder_timeout_overrides_config() {
        let workload = Workload::builder()
            .config(config("Timeout = \"1 minute\"\n[[Actors]]\nType = \"X\"\n"))
            .timeout(Duration::from_secs(5))
            .build();
        assert_eq!(workload.timeout, Some(Duration::from_secs(5)));
        assert_eq!(workload.config.timeout, Some(Duration::from_secs(60)));
    }
}
