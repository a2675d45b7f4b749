//! Orchestrator: the phase barrier every [`crate::PhaseLoop`] synchronizes on.
//!
//! Phases are numbered globally `0..=max` across the whole workload. Every
//! participant (one per actor that owns a `PhaseLoop`) holds one token and takes
//! part in every phase, even the ones it has nothing to do in.
//!
//! # Protocol for phase `k`
//! 1. **Start.** Each participant calls [`Orchestrator::await_phase_start`]. When
//!    the last required token arrives the phase opens and everybody is released.
//! 2. **Work.** Blocking participants run their iterations. Non-blocking
//!    participants hand their token back immediately (via `await_phase_end(k,
//!    false)`) and keep iterating while the phase stays open.
//! 3. **End.** Blocking participants call `await_phase_end(k, true)` and wait.
//!    Once every token has been handed back the phase closes and the phase
//!    counter advances to `k + 1`.
//!
//! # Halting
//! - [`Orchestrator::abort`] records the first failure and releases every waiter
//!   with [`SyncError::Aborted`]. Nobody is left blocked on a barrier that can no
//!   longer complete.
//! - [`Orchestrator::stop`] is the orderly run-level stop: waiters are released
//!   without an error and loops end after their current iteration.
//!
//! The observable state (phase, open/closed, halt) is broadcast through a
//! [`tokio::sync::watch`] channel. Waiters re-check the latest value, so a change
//! published between deciding to wait and starting to wait is never lost.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{actor::ActorId, error::SyncError, phase::PhaseNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Running,
    Stopped,
    Aborted,
}

/// Snapshot broadcast to every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSignal {
    pub phase: PhaseNumber,
    pub open: bool,
    pub halt: Halt,
}

/// The failure that aborted a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub actor: String,
    pub id: ActorId,
    pub phase: PhaseNumber,
    pub message: String,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "actor `{}` ({}) failed in phase {}: {}",
            self.actor, self.id, self.phase, self.message
        )
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    required: usize,
    arrived: usize,
    outstanding: usize,
    max_phase: Option<PhaseNumber>,
    executing: bool,
    end_requested: BTreeSet<PhaseNumber>,
    failure: Option<Failure>,
}

#[derive(Debug)]
pub struct Orchestrator {
    state: Mutex<BarrierState>,
    signal: watch::Sender<PhaseSignal>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(PhaseSignal {
            phase: 0,
            open: false,
            halt: Halt::Running,
        });
        Self {
            state: Mutex::new(BarrierState::default()),
            signal,
        }
    }

    /// Registers participants. Called once per `PhaseLoop` at construction.
    pub fn add_required_tokens(&self, tokens: usize) {
        self.state.lock().required += tokens;
    }

    pub fn required_tokens(&self) -> usize {
        self.state.lock().required
    }

    /// Makes sure the run lasts at least until `phase`.
    pub fn phases_at_least_to(&self, phase: PhaseNumber) {
        let mut state = self.state.lock();
        state.max_phase = Some(state.max_phase.map_or(phase, |max| max.max(phase)));
    }

    /// Last phase of the run, `None` when no actor configured any phase.
    pub fn max_phase(&self) -> Option<PhaseNumber> {
        self.state.lock().max_phase
    }

    pub fn signal(&self) -> PhaseSignal {
        *self.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PhaseSignal> {
        self.signal.subscribe()
    }

    /// The phase in progress, or the next one to start. Equal to the number of
    /// phases that have closed.
    pub fn current_phase(&self) -> PhaseNumber {
        self.signal.borrow().phase
    }

    pub fn is_phase_open(&self, phase: PhaseNumber) -> bool {
        let signal = self.signal();
        signal.phase == phase && signal.open && signal.halt == Halt::Running
    }

    /// False once the run was stopped or aborted, or every phase has closed.
    pub fn continue_running(&self) -> bool {
        let signal = self.signal();
        signal.halt == Halt::Running
            && self
                .max_phase()
                .is_some_and(|max| signal.phase <= max)
    }

    pub fn is_stopped(&self) -> bool {
        self.signal().halt == Halt::Stopped
    }

    pub fn is_aborted(&self) -> bool {
        self.signal().halt == Halt::Aborted
    }

    pub fn failure(&self) -> Option<Failure> {
        self.state.lock().failure.clone()
    }

    /// Marks the start of execution. Loops dropped before this point were never
    /// run and do not abort anything.
    pub(crate) fn begin_execution(&self) {
        self.state.lock().executing = true;
    }

    pub fn is_executing(&self) -> bool {
        self.state.lock().executing
    }

    /// Raises the external signal that ends `UntilSignaled` iteration in `phase`.
    pub fn end_phase(&self, phase: PhaseNumber) {
        tracing::info!("End of phase {phase} requested");
        self.state.lock().end_requested.insert(phase);
    }

    pub fn phase_end_requested(&self, phase: PhaseNumber) -> bool {
        self.state.lock().end_requested.contains(&phase)
    }

    /// Orderly stop: every actor finishes its current iteration and its loop ends.
    pub fn stop(&self) {
        let _state = self.state.lock();
        let changed = self.signal.send_if_modified(|signal| {
            if signal.halt == Halt::Running {
                signal.halt = Halt::Stopped;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("Stop requested, actors will finish their current iteration");
        }
    }

    /// Fails the run. Only the first failure is kept; every waiter is released.
    pub fn abort(&self, failure: Failure) {
        let mut state = self.state.lock();
        if state.failure.is_some() {
            tracing::debug!("Ignoring secondary failure: {failure}");
            return;
        }
        tracing::error!("Aborting run: {failure}");
        state.failure = Some(failure);
        self.signal.send_modify(|signal| signal.halt = Halt::Aborted);
    }

    /// Arrives at the start barrier of `phase`.
    ///
    /// Returns `Ok(true)` once the phase is open, `Ok(false)` if the run was
    /// stopped before it opened.
    pub async fn await_phase_start(&self, phase: PhaseNumber) -> Result<bool, SyncError> {
        // Participants with nothing to do in the previous phase may get here
        // before it closed.
        let signal = self
            .wait_until(|s| s.halt != Halt::Running || (s.phase == phase && !s.open))
            .await?;
        if signal.halt != Halt::Running {
            return self.halt_result(signal.halt);
        }

        let halt = {
            let mut state = self.state.lock();
            let halt = self.signal().halt;
            if halt == Halt::Running {
                state.arrived += 1;
                if state.arrived >= state.required {
                    state.arrived = 0;
                    state.outstanding = state.required;
                    self.signal.send_modify(|s| s.open = true);
                    tracing::info!("Phase {phase} started");
                    return Ok(true);
                }
            }
            halt
        };
        if halt != Halt::Running {
            return self.halt_result(halt);
        }

        let signal = self
            .wait_until(|s| s.halt != Halt::Running || (s.phase == phase && s.open))
            .await?;
        self.halt_result(signal.halt)
    }

    /// Hands back this participant's token for `phase`.
    ///
    /// With `block`, waits until every other token is back and the phase has
    /// closed. Returns whether more phases follow.
    pub async fn await_phase_end(&self, phase: PhaseNumber, block: bool) -> Result<bool, SyncError> {
        let halt = {
            let mut state = self.state.lock();
            let halt = self.signal().halt;
            if halt == Halt::Running {
                state.outstanding = state.outstanding.saturating_sub(1);
                if state.outstanding == 0 {
                    self.signal.send_modify(|s| {
                        s.phase = phase + 1;
                        s.open = false;
                    });
                    tracing::info!("Phase {phase} ended");
                    return Ok(state.max_phase.is_some_and(|max| phase < max));
                }
            }
            halt
        };
        if halt != Halt::Running {
            return self.halt_result(halt).map(|_| false);
        }

        if block {
            let signal = self
                .wait_until(|s| s.halt != Halt::Running || s.phase > phase)
                .await?;
            if signal.halt != Halt::Running {
                return self.halt_result(signal.halt).map(|_| false);
            }
        }
        Ok(self.max_phase().is_some_and(|max| phase < max))
    }

    async fn wait_until(
        &self,
        condition: impl FnMut(&PhaseSignal) -> bool,
    ) -> Result<PhaseSignal, SyncError> {
        let mut rx = self.signal.subscribe();
        let signal = rx.wait_for(condition).await.map_err(|_| SyncError::Closed)?;
        Ok(*signal)
    }

    fn halt_result(&self, halt: Halt) -> Result<bool, SyncError> {
        match halt {
            Halt::Running => Ok(true),
            Halt::Stopped => Ok(false),
            Halt::Aborted => {
                let reason = self
                    .state
                    .lock()
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown failure".to_string());
                Err(SyncError::Aborted(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    fn orchestrator(tokens: usize, max_phase: PhaseNumber) -> Arc<Orchestrator> {
        let o = Orchestrator::new();
        o.add_required_tokens(tokens);
        o.phases_at_least_to(max_phase);
        Arc::new(o)
    }

    fn failure(actor: &str) -> Failure {
        Failure {
            actor: actor.to_string(),
            id: ActorId(7),
            phase: 0,
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn single_participant_runs_through_phases() {
        let o = orchestrator(1, 1);
        assert!(o.continue_running());

        assert!(o.await_phase_start(0).await.unwrap());
        assert!(o.is_phase_open(0));
        assert!(o.await_phase_end(0, true).await.unwrap());
        assert_eq!(o.current_phase(), 1);

        assert!(o.await_phase_start(1).await.unwrap());
        assert!(!o.await_phase_end(1, true).await.unwrap());
        assert_eq!(o.current_phase(), 2);
        assert!(!o.continue_running());
    }

    #[tokio::test]
    async fn start_waits_for_every_participant() {
        let o = orchestrator(2, 0);
        let first = tokio::spawn({
            let o = o.clone();
            async move { o.await_phase_start(0).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        assert!(!o.signal().open);

        assert!(o.await_phase_start(0).await.unwrap());
        assert!(first.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn blocking_end_waits_for_the_last_token() {
        let o = orchestrator(2, 1);
        let (a, b) = tokio::join!(o.await_phase_start(0), o.await_phase_start(0));
        assert!(a.unwrap() && b.unwrap());

        let early = tokio::spawn({
            let o = o.clone();
            async move { o.await_phase_end(0, true).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!early.is_finished());
        assert_eq!(o.current_phase(), 0);

        assert!(o.await_phase_end(0, true).await.unwrap());
        assert!(early.await.unwrap().unwrap());
        assert_eq!(o.current_phase(), 1);
    }

    #[tokio::test]
    async fn non_blocking_end_returns_immediately() {
        let o = orchestrator(2, 0);
        let (a, b) = tokio::join!(o.await_phase_start(0), o.await_phase_start(0));
        assert!(a.unwrap() && b.unwrap());

        o.await_phase_end(0, false).await.unwrap();
        assert!(o.is_phase_open(0));

        o.await_phase_end(0, true).await.unwrap();
        assert!(!o.is_phase_open(0));
    }

    #[tokio::test]
    async fn early_arrival_waits_for_previous_phase_to_close() {
        let o = orchestrator(2, 1);
        let (a, b) = tokio::join!(o.await_phase_start(0), o.await_phase_start(0));
        assert!(a.unwrap() && b.unwrap());
        o.await_phase_end(0, false).await.unwrap();

        let next = tokio::spawn({
            let o = o.clone();
            async move { o.await_phase_start(1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!next.is_finished());

        o.await_phase_end(0, true).await.unwrap();
        assert!(o.await_phase_start(1).await.unwrap());
        assert!(next.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn abort_releases_waiters_with_error() {
        let o = orchestrator(3, 0);
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let o = o.clone();
                tokio::spawn(async move { o.await_phase_start(0).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        o.abort(failure("Broken"));
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, SyncError::Aborted(ref msg) if msg.contains("Broken")));
        }
        assert!(o.is_aborted());
        assert!(!o.continue_running());
    }

    #[tokio::test]
    async fn only_first_failure_is_kept() {
        let o = orchestrator(1, 0);
        o.abort(failure("First"));
        o.abort(failure("Second"));
        assert_eq!(o.failure().unwrap().actor, "First");
    }

    #[tokio::test]
    async fn stop_releases_waiters_without_error() {
        let o = orchestrator(2, 0);
        let waiter = tokio::spawn({
            let o = o.clone();
            async move { o.await_phase_start(0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        o.stop();
        assert!(!waiter.await.unwrap().unwrap());
        assert!(o.is_stopped());
        assert!(!o.continue_running());
    }

    #[tokio::test]
    async fn stop_after_abort_keeps_abort() {
        let o = orchestrator(1, 0);
        o.abort(failure("Broken"));
        o.stop();
        assert!(o.is_aborted());
    }

    #[test]
    fn phase_end_signal_is_per_phase() {
        let o = Orchestrator::new();
        o.end_phase(2);
        assert!(o.phase_end_requested(2));
        assert!(!o.phase_end_requested(1));
    }

    #[test]
    fn max_phase_only_grows() {
        let o = Orchestrator::new();
        assert_eq!(o.max_phase(), None);
        assert!(!o.continue_running());
        o.phases_at_least_to(3);
        o.phases_at_least_to(1);
        assert_eq!(o.max_phase(), Some(3));
    }
}
