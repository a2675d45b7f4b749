//! Actors: the units of concurrent workload execution.
//!
//! An actor kind implements [`ActorKind`] (construction plus a default name)
//! and [`Actor`] (the single `run` entry point). The workload builds every
//! instance up front, wraps each in an [`ActorInstance`] that enforces the
//! `Constructed -> Running -> Terminated` lifecycle, and runs them all at once.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    config::ActorConfig,
    error::{ActorError, ConfigError, LifecycleError, SetupError},
    metrics::{MetricsRegistry, Operation},
    orchestrator::Orchestrator,
    phase::PhaseSchedule,
    state::SharedStateRegistry,
};

/// Unique within one workload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[async_trait]
pub trait Actor: Send {
    /// Runs the actor for the whole benchmark. Called exactly once.
    async fn run(&mut self) -> Result<(), ActorError>;
}

/// An actor type the [`crate::Cast`] knows how to build.
pub trait ActorKind: Actor + Sized + 'static {
    /// Name used when the actor block does not set `Name`.
    const DEFAULT_NAME: &'static str;

    fn build(ctx: &ActorContext<'_>, id: ActorId) -> Result<Self, SetupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActorState {
    Constructed,
    Running,
    Terminated,
}

impl ActorState {
    fn start(&mut self) -> Result<(), LifecycleError> {
        match *self {
            Self::Constructed => {
                *self = Self::Running;
                Ok(())
            }
            other => Err(LifecycleError(other)),
        }
    }

    fn terminate(&mut self) -> Result<(), LifecycleError> {
        match *self {
            Self::Running => {
                *self = Self::Terminated;
                Ok(())
            }
            other => Err(LifecycleError(other)),
        }
    }
}

/// How an actor's `run` ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Failed(ActorError),
    Panicked(String),
}

/// A constructed actor plus its identity and lifecycle state.
pub struct ActorInstance {
    name: Arc<str>,
    id: ActorId,
    state: ActorState,
    actor: Box<dyn Actor>,
}

impl fmt::Debug for ActorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorInstance")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ActorInstance {
    pub fn new(name: impl Into<Arc<str>>, id: ActorId, actor: Box<dyn Actor>) -> Self {
        Self {
            name: name.into(),
            id,
            state: ActorState::Constructed,
            actor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    /// Runs the actor to completion. A second call is a [`LifecycleError`].
    ///
    /// The instance is `Terminated` afterwards whatever the outcome, panics
    /// included.
    pub async fn run(&mut self) -> Result<RunOutcome, LifecycleError> {
        self.state.start()?;
        tracing::debug!("Actor {} ({}) running", self.name, self.id);

        let outcome = match AssertUnwindSafe(self.actor.run()).catch_unwind().await {
            Ok(Ok(())) => RunOutcome::Completed,
            Ok(Err(err)) => RunOutcome::Failed(err),
            Err(panic) => RunOutcome::Panicked(panic_message(panic.as_ref())),
        };

        self.state.terminate()?;
        tracing::debug!("Actor {} ({}) terminated", self.name, self.id);
        Ok(outcome)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The services an actor block shares.
#[derive(Debug)]
pub(crate) struct Services<'w> {
    pub orchestrator: &'w Arc<Orchestrator>,
    pub shared_state: &'w SharedStateRegistry,
    pub metrics: &'w MetricsRegistry,
    pub next_id: &'w AtomicU64,
}

/// Everything an actor sees while it is being constructed.
#[derive(Debug)]
pub struct ActorContext<'w> {
    services: Services<'w>,
    config: &'w ActorConfig,
    name: &'w str,
    schedule: Arc<PhaseSchedule>,
}

impl<'w> ActorContext<'w> {
    pub(crate) fn new(
        services: Services<'w>,
        config: &'w ActorConfig,
        name: &'w str,
        schedule: Arc<PhaseSchedule>,
    ) -> Self {
        Self {
            services,
            config,
            name,
            schedule,
        }
    }

    /// The block's `Name`, or the kind's default.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn actor_type(&self) -> &str {
        &self.config.actor_type
    }

    pub fn threads(&self) -> usize {
        self.config.threads
    }

    pub fn config(&self) -> &ActorConfig {
        self.config
    }

    /// An actor-level parameter.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.config
            .params
            .get(key)
            .cloned()
            .map(|value| value.try_into())
            .transpose()
            .map_err(|source| ConfigError::Param {
                actor: self.name.to_string(),
                phase: None,
                source,
            })
    }

    /// Like [`param`](Self::param) but the key must be present.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.param(key)?.ok_or_else(|| ConfigError::MissingParam {
            actor: self.name.to_string(),
            key: key.to_string(),
        })
    }

    pub fn shared_state(&self) -> &SharedStateRegistry {
        self.services.shared_state
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        self.services.metrics
    }

    /// Shorthand for an [`Operation`] named after this actor block.
    pub fn operation(&self, name: &str, id: ActorId) -> Operation {
        self.services.metrics.operation(self.name, name, id)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        self.services.orchestrator
    }

    pub fn phase_schedule(&self) -> &Arc<PhaseSchedule> {
        &self.schedule
    }

    /// Allocates a fresh id, for actors that spawn helpers of their own.
    pub fn next_actor_id(&self) -> ActorId {
        ActorId(self.services.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    struct Scripted(Option<Result<(), ActorError>>);

    #[async_trait]
    impl Actor for Scripted {
        async fn run(&mut self) -> Result<(), ActorError> {
            match self.0.take() {
                Some(result) => result,
                None => panic!("scripted actor has nothing left to do"),
            }
        }
    }

    fn instance(script: Option<Result<(), ActorError>>) -> ActorInstance {
        ActorInstance::new("Scripted", ActorId(1), Box::new(Scripted(script)))
    }

    #[tokio::test]
    async fn lifecycle_runs_once() {
        let mut actor = instance(Some(Ok(())));
        assert_eq!(actor.state(), ActorState::Constructed);

        assert!(matches!(actor.run().await, Ok(RunOutcome::Completed)));
        assert_eq!(actor.state(), ActorState::Terminated);

        let err = actor.run().await.unwrap_err();
        assert_eq!(err.0, ActorState::Terminated);
    }

    #[tokio::test]
    async fn failure_still_terminates() {
        let mut actor = instance(Some(Err(SyncError::Closed.into())));
        assert!(matches!(
            actor.run().await,
            Ok(RunOutcome::Failed(ActorError::Sync(SyncError::Closed)))
        ));
        assert_eq!(actor.state(), ActorState::Terminated);
    }

    #[tokio::test]
    async fn panic_is_caught() {
        let mut actor = instance(None);
        match actor.run().await {
            Ok(RunOutcome::Panicked(message)) => assert!(message.contains("nothing left")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(actor.state(), ActorState::Terminated);
    }

    #[test]
    fn id_display() {
        assert_eq!(ActorId(12).to_string(), "#12");
    }
}
