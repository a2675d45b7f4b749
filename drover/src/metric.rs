use std::{fmt::Debug, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::{actor::ActorId, phase::PhaseNumber};

/// Samples that are collected and processed by the framework.
pub trait Metric
where
    Self: Send + Sync + Debug + Clone,
{
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    Failure,
}

/// One finished operation, as handed to a [`crate::metrics::MetricsSink`].
#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub actor: Arc<str>,
    pub actor_id: ActorId,
    pub operation: Arc<str>,
    /// Phase in progress when the operation started, if the recorder tracks phases.
    pub phase: Option<PhaseNumber>,
    pub started: Instant,
    pub finished: Instant,
    pub outcome: Outcome,
    pub documents: u64,
    pub bytes: u64,
    pub iterations: u64,
}

impl OperationEvent {
    pub fn duration(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }

    /// `Actor.Operation`, the key events are aggregated under.
    pub fn key(&self) -> String {
        format!("{}.{}", self.actor, self.operation)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

impl Metric for OperationEvent {}
