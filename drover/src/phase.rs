//! Phases and the per-actor [`PhaseLoop`].
//!
//! A [`PhaseSchedule`] is resolved once per actor block from its configuration
//! and shared by all of the block's instances. Each instance then builds its own
//! `PhaseLoop`, parsing its typed per-phase config, and drives it like this:
//!
//! ```rust,ignore
//! while let Some(mut phase) = self.phase_loop.next_phase().await? {
//!     while phase.next_iteration().await {
//!         // one unit of work, configured by `phase.config()`
//!     }
//! }
//! ```
//!
//! `next_phase` is where the actor meets its siblings: it hands back the token
//! for the phase just finished and waits at the start barrier of the next one.
//! Phases the actor did not configure are skipped transparently, but the actor
//! still takes part in their barriers.

use std::{collections::BTreeMap, ops::Deref, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::{
    actor::{ActorContext, ActorId},
    config::{ActorConfig, PhaseEntry},
    error::{ConfigError, SetupError, SyncError},
    orchestrator::{Failure, Halt, Orchestrator},
    rate::RateLimiter,
};

pub type PhaseNumber = u64;

/// How many times an actor runs its per-phase body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPolicy {
    Repeat(u64),
    Duration(Duration),
    /// Runs until both the count and the duration are reached.
    RepeatAndDuration(u64, Duration),
    /// Runs until [`Orchestrator::end_phase`] is raised for the phase.
    UntilSignaled,
    /// Runs until the phase closes. Only valid for non-blocking phases.
    Unbounded,
}

impl IterationPolicy {
    pub fn is_exhausted(
        &self,
        iterations: u64,
        elapsed: Duration,
        end_requested: impl FnOnce() -> bool,
    ) -> bool {
        match *self {
            Self::Repeat(n) => iterations >= n,
            Self::Duration(d) => elapsed >= d,
            Self::RepeatAndDuration(n, d) => iterations >= n && elapsed >= d,
            Self::UntilSignaled => end_requested(),
            Self::Unbounded => false,
        }
    }
}

#[derive(Debug)]
pub struct PhaseDefinition {
    pub number: PhaseNumber,
    pub policy: IterationPolicy,
    pub blocking: bool,
    pub nop: bool,
    pub sleep_before: Option<Duration>,
    pub sleep_after: Option<Duration>,
    pub rate: Option<Arc<RateLimiter>>,
    /// Actor-level parameters overlaid with this phase's own.
    pub params: toml::Table,
}

impl PhaseDefinition {
    fn from_entry(
        actor: &str,
        number: PhaseNumber,
        entry: &PhaseEntry,
        actor_params: &toml::Table,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPhase {
            actor: actor.to_string(),
            phase: number,
            reason: reason.to_string(),
        };

        let mut params = actor_params.clone();
        params.extend(entry.params.clone());

        if entry.nop {
            return Ok(Self::nop(number, params));
        }

        let blocking = match entry.blocking.as_deref() {
            None => true,
            Some("None") => false,
            Some(other) => {
                return Err(invalid(&format!(
                    "Blocking only accepts \"None\", got \"{other}\""
                )));
            }
        };

        let policy = match (entry.repeat, entry.duration, entry.until_signaled) {
            (Some(n), None, false) => IterationPolicy::Repeat(n),
            (None, Some(d), false) => IterationPolicy::Duration(d),
            (Some(n), Some(d), false) => IterationPolicy::RepeatAndDuration(n, d),
            (None, None, true) => IterationPolicy::UntilSignaled,
            (None, None, false) if !blocking => IterationPolicy::Unbounded,
            (None, None, false) => {
                return Err(invalid(
                    "a blocking phase needs Repeat, Duration or UntilSignaled",
                ));
            }
            (_, _, true) => {
                return Err(invalid(
                    "UntilSignaled cannot be combined with Repeat or Duration",
                ));
            }
        };

        Ok(Self {
            number,
            policy,
            blocking,
            nop: false,
            sleep_before: entry.sleep_before,
            sleep_after: entry.sleep_after,
            rate: entry.global_rate.map(|spec| Arc::new(RateLimiter::new(spec))),
            params,
        })
    }

    fn nop(number: PhaseNumber, params: toml::Table) -> Self {
        Self {
            number,
            policy: IterationPolicy::Repeat(0),
            blocking: false,
            nop: true,
            sleep_before: None,
            sleep_after: None,
            rate: None,
            params,
        }
    }
}

/// The phases one actor block configured, keyed by phase number.
#[derive(Debug, Default)]
pub struct PhaseSchedule {
    phases: BTreeMap<PhaseNumber, PhaseDefinition>,
}

impl PhaseSchedule {
    pub fn from_actor_config(actor: &str, config: &ActorConfig) -> Result<Self, ConfigError> {
        let mut phases = BTreeMap::new();
        for (index, entry) in config.phases.iter().enumerate() {
            let numbers = match &entry.phase {
                Some(selector) => selector.phases().map_err(|reason| ConfigError::InvalidPhase {
                    actor: actor.to_string(),
                    phase: index as PhaseNumber,
                    reason,
                })?,
                None => vec![index as PhaseNumber],
            };
            for number in numbers {
                if phases.contains_key(&number) {
                    return Err(ConfigError::DuplicatePhase {
                        actor: actor.to_string(),
                        phase: number,
                    });
                }
                let definition = PhaseDefinition::from_entry(actor, number, entry, &config.params)?;
                phases.insert(number, definition);
            }
        }
        Ok(Self { phases })
    }

    pub fn get(&self, phase: PhaseNumber) -> Option<&PhaseDefinition> {
        self.phases.get(&phase)
    }

    pub fn max_phase(&self) -> Option<PhaseNumber> {
        self.phases.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseDefinition> {
        self.phases.values()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// What an actor sees while building its config for one phase.
pub struct PhaseContext<'a> {
    actor: &'a ActorContext<'a>,
    definition: &'a PhaseDefinition,
}

impl<'a> PhaseContext<'a> {
    pub fn number(&self) -> PhaseNumber {
        self.definition.number
    }

    pub fn definition(&self) -> &PhaseDefinition {
        self.definition
    }

    pub fn actor(&self) -> &ActorContext<'a> {
        self.actor
    }

    /// A single parameter, falling back to the actor-level value.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.definition
            .params
            .get(key)
            .cloned()
            .map(|value| value.try_into())
            .transpose()
            .map_err(|source| self.param_error(source))
    }

    /// All parameters of this phase deserialized into `T`.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        toml::Value::Table(self.definition.params.clone())
            .try_into()
            .map_err(|source| self.param_error(source))
    }

    fn param_error(&self, source: toml::de::Error) -> ConfigError {
        ConfigError::Param {
            actor: self.actor.name().to_string(),
            phase: Some(self.definition.number),
            source,
        }
    }
}

/// Drives one actor through every phase of the run in lockstep with its
/// siblings.
pub struct PhaseLoop<C> {
    orchestrator: Arc<Orchestrator>,
    schedule: Arc<PhaseSchedule>,
    configs: BTreeMap<PhaseNumber, C>,
    actor: String,
    id: ActorId,
    next: PhaseNumber,
    pending_end: Option<PhaseNumber>,
    finished: bool,
}

impl<C> PhaseLoop<C> {
    /// Builds the loop, deserializing `C` from each configured phase.
    pub fn new(ctx: &ActorContext<'_>, id: ActorId) -> Result<Self, SetupError>
    where
        C: DeserializeOwned,
    {
        Self::with_builder(ctx, id, |phase| Ok(phase.config()?))
    }

    /// Builds the loop with a custom per-phase constructor.
    pub fn with_builder<F>(ctx: &ActorContext<'_>, id: ActorId, mut build: F) -> Result<Self, SetupError>
    where
        F: FnMut(&PhaseContext<'_>) -> Result<C, SetupError>,
    {
        let schedule = Arc::clone(ctx.phase_schedule());
        let mut configs = BTreeMap::new();
        for definition in schedule.iter().filter(|d| !d.nop) {
            let phase = PhaseContext {
                actor: ctx,
                definition,
            };
            configs.insert(definition.number, build(&phase)?);
        }

        let orchestrator = Arc::clone(ctx.orchestrator());
        orchestrator.add_required_tokens(1);

        Ok(Self {
            orchestrator,
            schedule,
            configs,
            actor: ctx.name().to_string(),
            id,
            next: 0,
            pending_end: None,
            finished: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Closes out the previous phase and waits for the next one to start.
    ///
    /// Returns `Ok(None)` once the schedule is exhausted or the run was stopped.
    pub async fn next_phase(&mut self) -> Result<Option<ActorPhase<'_, C>>, SyncError> {
        if let Some(phase) = self.pending_end.take() {
            if let Err(err) = self.orchestrator.await_phase_end(phase, true).await {
                self.finished = true;
                return Err(err);
            }
        }

        // Every block has extended the schedule by the time the run starts.
        let Some(max_phase) = self.orchestrator.max_phase() else {
            self.finished = true;
            return Ok(None);
        };

        loop {
            if self.finished {
                return Ok(None);
            }
            let number = self.next;
            if number > max_phase || !self.orchestrator.continue_running() {
                self.finished = true;
                return Ok(None);
            }

            match self.orchestrator.await_phase_start(number).await {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return Ok(None);
                }
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            }
            self.next += 1;

            let blocking = match (self.schedule.get(number), self.configs.contains_key(&number)) {
                (Some(definition), true) => Some(definition.blocking),
                _ => None,
            };

            match blocking {
                Some(true) => self.pending_end = Some(number),
                // Non-blocking and nop phases hand their token back right away.
                Some(false) | None => {
                    if let Err(err) = self.orchestrator.await_phase_end(number, false).await {
                        self.finished = true;
                        return Err(err);
                    }
                }
            }

            if let (Some(definition), Some(config)) =
                (self.schedule.get(number), self.configs.get(&number))
            {
                tracing::debug!(
                    "Actor {} ({}) entering phase {number} ({:?})",
                    self.actor,
                    self.id,
                    definition.policy
                );
                return Ok(Some(ActorPhase {
                    number,
                    definition,
                    config,
                    orchestrator: &self.orchestrator,
                    max_phase,
                    started: Instant::now(),
                    iterations: 0,
                }));
            }
        }
    }
}

impl<C> Drop for PhaseLoop<C> {
    fn drop(&mut self) {
        // An actor that leaves mid-schedule would hold its siblings at the next
        // barrier forever.
        if !self.finished
            && self.orchestrator.is_executing()
            && self.orchestrator.continue_running()
        {
            self.orchestrator.abort(Failure {
                actor: self.actor.clone(),
                id: self.id,
                phase: self.orchestrator.current_phase(),
                message: "exited before completing its phase schedule".to_string(),
            });
        }
    }
}

/// One phase as seen by one actor.
pub struct ActorPhase<'a, C> {
    number: PhaseNumber,
    definition: &'a PhaseDefinition,
    config: &'a C,
    orchestrator: &'a Orchestrator,
    max_phase: PhaseNumber,
    started: Instant,
    iterations: u64,
}

impl<'a, C> ActorPhase<'a, C> {
    pub fn number(&self) -> PhaseNumber {
        self.number
    }

    pub fn config(&self) -> &'a C {
        self.config
    }

    pub fn definition(&self) -> &'a PhaseDefinition {
        self.definition
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Waits as configured and reports whether another iteration should run.
    ///
    /// Suspends at least once before every iteration it grants, so an actor
    /// whose body never awaits still lets its siblings on the same worker run.
    pub async fn next_iteration(&mut self) -> bool {
        let mut waited = false;
        if self.iterations > 0 {
            if let Some(pause) = self.definition.sleep_after {
                tokio::time::sleep(pause).await;
                waited = true;
            }
        }
        if self.is_done() {
            return false;
        }

        if let Some(pause) = self.definition.sleep_before {
            tokio::time::sleep(pause).await;
            waited = true;
        }
        if let Some(rate) = &self.definition.rate {
            rate.acquire().await;
            waited = true;
        }
        if !waited {
            tokio::task::yield_now().await;
        }
        if self.is_halted() {
            return false;
        }

        self.iterations += 1;
        true
    }

    /// One read of the phase signal, no orchestrator lock.
    fn is_halted(&self) -> bool {
        let signal = self.orchestrator.signal();
        if signal.halt != Halt::Running || signal.phase > self.max_phase {
            return true;
        }
        !self.definition.blocking && !(signal.phase == self.number && signal.open)
    }

    fn is_done(&self) -> bool {
        self.is_halted()
            || self.definition.policy.is_exhausted(
                self.iterations,
                self.started.elapsed(),
                || self.orchestrator.phase_end_requested(self.number),
            )
    }
}

impl<C> Deref for ActorPhase<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.config
    }
}
