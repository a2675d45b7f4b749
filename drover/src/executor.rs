//! Executor: runs every actor of a workload as its own task.
//!
//! # Flow
//! 1. Mark the orchestrator as executing, so a `PhaseLoop` that is dropped
//!    before finishing its schedule from now on aborts the run.
//! 2. Spawn one task per [`ActorInstance`]. Each task runs the actor exactly
//!    once and tears it down right away, so its phase loop hands back its
//!    barrier token as soon as the actor returns.
//! 3. A task whose actor failed or panicked aborts the orchestrator, releasing
//!    every sibling still waiting on a barrier. Siblings then fail with
//!    [`SyncError::Aborted`](crate::error::SyncError::Aborted), which is
//!    fallout and never reported as the cause.
//! 4. Join all tasks, racing them against the optional run timeout. When the
//!    timeout fires the run is stopped in order and the tasks are still joined.
//! 5. The first recorded failure, if any, becomes the [`RunError`].

use std::{pin::pin, sync::Arc, time::Duration};

use futures::future::join_all;
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    actor::{ActorId, ActorInstance, ActorState, RunOutcome},
    error::{LifecycleError, RunError},
    orchestrator::{Failure, Orchestrator},
    phase::PhaseNumber,
};

/// Terminal state of one actor after the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorSummary {
    pub name: String,
    pub id: ActorId,
    pub state: ActorState,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub actors: Vec<ActorSummary>,
    /// Number of phases that closed.
    pub phases_completed: PhaseNumber,
    /// Whether the run ended through an orderly stop rather than by exhausting
    /// every phase.
    pub stopped: bool,
    pub elapsed: Duration,
}

/// What one actor task hands back.
#[derive(Debug)]
pub struct Finished {
    pub summary: ActorSummary,
    pub result: Result<RunOutcome, LifecycleError>,
}

/// Spawn one Tokio task per actor.
pub fn spawn_actors(
    orchestrator: &Arc<Orchestrator>,
    actors: Vec<ActorInstance>,
) -> Vec<JoinHandle<Finished>> {
    actors
        .into_iter()
        .map(|mut actor| {
            let orchestrator = Arc::clone(orchestrator);
            tokio::spawn(async move {
                let result = actor.run().await;
                let summary = ActorSummary {
                    name: actor.name().to_string(),
                    id: actor.id(),
                    state: actor.state(),
                };

                let message = match &result {
                    Ok(RunOutcome::Failed(err))
                        if !err.is_abort_fallout() || !orchestrator.is_aborted() =>
                    {
                        Some(err.to_string())
                    }
                    Ok(RunOutcome::Panicked(message)) => Some(format!("panicked: {message}")),
                    _ => None,
                };
                if let Some(message) = message {
                    orchestrator.abort(Failure {
                        actor: summary.name.clone(),
                        id: summary.id,
                        phase: orchestrator.current_phase(),
                        message,
                    });
                }

                // Tear down before reporting back so an unfinished phase loop
                // releases its siblings now rather than after the join.
                drop(actor);
                Finished { summary, result }
            })
        })
        .collect()
}

/// Runs `actors` to completion and reports how the run ended.
pub async fn execute(
    orchestrator: Arc<Orchestrator>,
    actors: Vec<ActorInstance>,
    timeout: Option<Duration>,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    orchestrator.begin_execution();

    tracing::info!("Spawning {} actors...", actors.len());
    let handles = spawn_actors(&orchestrator, actors);

    tracing::info!("Running now!");
    let mut all = pin!(join_all(handles));
    let joined = match timeout {
        Some(limit) => {
            let raced = tokio::time::timeout(limit, all.as_mut()).await;
            match raced {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!("Run timed out after {limit:?}, stopping");
                    orchestrator.stop();
                    all.await
                }
            }
        }
        None => all.await,
    };

    tracing::info!("Collecting actor outcomes...");
    let mut finished = Vec::with_capacity(joined.len());
    for result in joined {
        finished.push(result?);
    }

    if let Some(failure) = orchestrator.failure() {
        return Err(root_cause(failure, finished));
    }

    let mut actors = Vec::with_capacity(finished.len());
    for Finished { summary, result } in finished {
        result?;
        actors.push(summary);
    }

    let summary = RunSummary {
        actors,
        phases_completed: orchestrator.current_phase(),
        stopped: orchestrator.is_stopped(),
        elapsed: started.elapsed(),
    };
    tracing::info!(
        "Done running workload: {} phases in {:?}{}",
        summary.phases_completed,
        summary.elapsed,
        if summary.stopped { " (stopped)" } else { "" }
    );
    Ok(summary)
}

/// Pairs the failure that aborted the run with the outcome of the actor that
/// caused it.
fn root_cause(failure: Failure, finished: Vec<Finished>) -> RunError {
    let Failure {
        actor, id, phase, ..
    } = failure;
    let outcome = finished
        .into_iter()
        .find(|f| f.summary.id == id)
        .map(|f| f.result);

    match outcome {
        Some(Ok(RunOutcome::Failed(source))) => RunError::ActorFailed {
            actor,
            id,
            phase,
            source,
        },
        Some(Ok(RunOutcome::Panicked(message))) => RunError::ActorPanicked {
            actor,
            id,
            phase,
            message,
        },
        Some(Err(err)) => RunError::Lifecycle(err),
        Some(Ok(RunOutcome::Completed)) | None => RunError::ActorExited { actor, id, phase },
    }
}
