//! Error types for every stage of a workload run.
//!
//! Setup failures ([`ConfigError`], [`StateError`]) stop a run before any actor
//! starts. Failures during the run ([`ActorError`]) abort the orchestrator so
//! blocked siblings are released, and surface to the caller as a [`RunError`]
//! that names the actor and phase that failed. Nothing here is retried.

use std::error::Error as StdError;

use crate::{actor::ActorId, phase::PhaseNumber};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse workload configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workload defines no actors")]
    NoActors,

    #[error("unknown actor type `{0}`")]
    UnknownActorType(String),

    #[error("actor `{actor}`: Threads must be at least 1")]
    NoThreads { actor: String },

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("invalid rate `{0}`, expected `<count> per <duration>`")]
    InvalidRate(String),

    #[error("actor `{actor}` phase {phase}: {reason}")]
    InvalidPhase {
        actor: String,
        phase: PhaseNumber,
        reason: String,
    },

    #[error("actor `{actor}` defines phase {phase} more than once")]
    DuplicatePhase { actor: String, phase: PhaseNumber },

    #[error("actor `{actor}`: invalid parameter{}: {source}", phase_suffix(.phase))]
    Param {
        actor: String,
        phase: Option<PhaseNumber>,
        #[source]
        source: toml::de::Error,
    },

    #[error("actor `{actor}`: missing parameter `{key}`")]
    MissingParam { actor: String, key: String },
}

fn phase_suffix(phase: &Option<PhaseNumber>) -> String {
    match phase {
        Some(p) => format!(" in phase {p}"),
        None => String::new(),
    }
}

/// Barrier failures observed by an actor waiting on a phase boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("run aborted: {0}")]
    Aborted(String),

    #[error("orchestrator is gone")]
    Closed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics backend disconnected while recording `{operation}`")]
    Disconnected { operation: String },

    #[error("metrics backend rejected `{operation}`: {reason}")]
    Rejected { operation: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to construct shared state `{key}`: {source}")]
    Construction {
        key: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("shared state `{key}` failed to construct earlier: {reason}")]
    PreviouslyFailed { key: &'static str, reason: String },

    #[error("shared state `{key}` holds a different type than `{expected}`")]
    TypeMismatch {
        key: &'static str,
        expected: &'static str,
    },

    #[error("shared state `{key}` has no registered factory")]
    Unregistered { key: &'static str },

    #[error("shared state `{key}` is already registered")]
    AlreadyRegistered { key: &'static str },
}

/// Anything that can go wrong while constructing an actor.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Anything that can go wrong inside [`crate::Actor::run`].
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{0}")]
    Workload(#[source] BoxError),
}

impl ActorError {
    pub fn workload(err: impl Into<BoxError>) -> Self {
        Self::Workload(err.into())
    }

    /// True when this actor only failed because another one aborted the run.
    pub fn is_abort_fallout(&self) -> bool {
        matches!(self, Self::Sync(SyncError::Aborted(_)))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("actor is already {0:?}")]
pub struct LifecycleError(pub crate::actor::ActorState);

/// Run-level failure reported to whoever started the workload.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid workload: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to set up actor `{actor}`: {source}")]
    Setup {
        actor: String,
        #[source]
        source: SetupError,
    },

    #[error("actor `{actor}` ({id}) failed in phase {phase}: {source}")]
    ActorFailed {
        actor: String,
        id: ActorId,
        phase: PhaseNumber,
        #[source]
        source: ActorError,
    },

    #[error("actor `{actor}` ({id}) panicked in phase {phase}: {message}")]
    ActorPanicked {
        actor: String,
        id: ActorId,
        phase: PhaseNumber,
        message: String,
    },

    #[error("actor `{actor}` ({id}) exited in phase {phase} before completing its phase schedule")]
    ActorExited {
        actor: String,
        id: ActorId,
        phase: PhaseNumber,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("actor task could not be joined: {0}")]
    Join(#[from] tokio::task::JoinError),
}
