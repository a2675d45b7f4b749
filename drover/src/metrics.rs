//! Metrics facade handed to actors.
//!
//! An actor asks the [`MetricsRegistry`] for an [`Operation`] once, at
//! construction, and then times each unit of work with it:
//!
//! ```rust,ignore
//! let mut ctx = self.operation.start();
//! // ... work ...
//! ctx.add_documents(1);
//! ctx.success()?;
//! ```
//!
//! Reporting ends the context and forwards one [`OperationEvent`] to the
//! [`MetricsSink`]. Sink failures are returned to the actor, never dropped.

use std::{fmt::Debug, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::{
    Aggregate,
    actor::ActorId,
    aggregate::MetricsAggregate,
    error::MetricsError,
    metric::{OperationEvent, Outcome},
    orchestrator::Orchestrator,
    phase::PhaseNumber,
};

/// Where finished operations go.
pub trait MetricsSink: Send + Sync + Debug {
    fn record(&self, event: OperationEvent) -> Result<(), MetricsError>;
}

#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    sink: Arc<dyn MetricsSink>,
    phases: Option<Arc<Orchestrator>>,
}

impl MetricsRegistry {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink, phases: None }
    }

    /// Stamps every event with the phase in progress when it started.
    pub fn with_phase_source(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.phases = Some(orchestrator);
        self
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    pub fn operation(&self, actor: &str, name: &str, id: ActorId) -> Operation {
        Operation {
            actor: Arc::from(actor),
            name: Arc::from(name),
            id,
            registry: self.clone(),
        }
    }
}

/// A named operation scoped to one actor instance.
#[derive(Debug, Clone)]
pub struct Operation {
    actor: Arc<str>,
    name: Arc<str>,
    id: ActorId,
    registry: MetricsRegistry,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn start(&self) -> OperationContext<'_> {
        OperationContext {
            operation: self,
            phase: self.registry.phases.as_ref().map(|o| o.current_phase()),
            started: Instant::now(),
            documents: 0,
            bytes: 0,
            iterations: 0,
            reported: false,
        }
    }
}

/// One timed unit of work in progress.
#[derive(Debug)]
#[must_use = "an operation must be reported with success(), failure() or discard()"]
pub struct OperationContext<'a> {
    operation: &'a Operation,
    phase: Option<PhaseNumber>,
    started: Instant,
    documents: u64,
    bytes: u64,
    iterations: u64,
    reported: bool,
}

impl OperationContext<'_> {
    pub fn add_documents(&mut self, n: u64) {
        self.documents += n;
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
    }

    pub fn add_iterations(&mut self, n: u64) {
        self.iterations += n;
    }

    pub fn success(self) -> Result<(), MetricsError> {
        self.report(Outcome::Success)
    }

    pub fn failure(self) -> Result<(), MetricsError> {
        self.report(Outcome::Failure)
    }

    /// Drops the measurement without recording anything.
    pub fn discard(mut self) {
        self.reported = true;
    }

    fn report(mut self, outcome: Outcome) -> Result<(), MetricsError> {
        self.reported = true;
        let op = self.operation;
        op.registry.sink.record(OperationEvent {
            actor: Arc::clone(&op.actor),
            actor_id: op.id,
            operation: Arc::clone(&op.name),
            phase: self.phase,
            started: self.started,
            finished: Instant::now(),
            outcome,
            documents: self.documents,
            bytes: self.bytes,
            iterations: self.iterations,
        })
    }
}

impl Drop for OperationContext<'_> {
    fn drop(&mut self) {
        if !self.reported {
            tracing::warn!(
                "Operation {}.{} ({}) was never reported",
                self.operation.actor,
                self.operation.name,
                self.operation.id
            );
        }
    }
}

/// Keeps every event in memory. Used for single-process runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<OperationEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn aggregate(&self) -> MetricsAggregate {
        let mut agg = MetricsAggregate::new();
        agg.aggregate(&self.events.lock());
        agg
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, event: OperationEvent) -> Result<(), MetricsError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Streams events to a background aggregator task.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl ChannelSink {
    /// Spawns the aggregator. Its handle resolves once every clone of the sink
    /// has been dropped.
    pub fn spawn(batch_size: usize) -> (Self, JoinHandle<MetricsAggregate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(aggregator_task::<MetricsAggregate>(rx, batch_size.max(1)));
        (Self { tx }, handle)
    }
}

impl MetricsSink for ChannelSink {
    fn record(&self, event: OperationEvent) -> Result<(), MetricsError> {
        self.tx
            .send(event)
            .map_err(|err| MetricsError::Disconnected {
                operation: err.0.key(),
            })
    }
}

/// Tokio task for batched metric aggregation.
pub async fn aggregator_task<A: Aggregate>(
    mut rx: mpsc::UnboundedReceiver<A::Metric>,
    batch_size: usize,
) -> A {
    let mut agg = A::new();
    let mut batch = Vec::with_capacity(batch_size);

    // Receive the first metric or end the loop once every sender is dropped
    while let Some(metric) = rx.recv().await {
        batch.push(metric);

        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(metric) => batch.push(metric),
                Err(_) => break,
            }
        }

        agg.aggregate(&batch);
        batch.clear();
    }
    tracing::debug!("Metrics aggregator drained");
    agg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(sink: Arc<dyn MetricsSink>) -> MetricsRegistry {
        MetricsRegistry::new(sink)
    }

    #[tokio::test(start_paused = true)]
    async fn success_records_one_event() {
        let sink = Arc::new(MemorySink::new());
        let op = registry(sink.clone()).operation("HelloWorld", "hello", ActorId(3));

        let mut ctx = op.start();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ctx.add_documents(1);
        ctx.add_bytes(13);
        ctx.success().unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.key(), "HelloWorld.hello");
        assert_eq!(event.actor_id, ActorId(3));
        assert_eq!(event.outcome, Outcome::Success);
        assert_eq!(event.documents, 1);
        assert_eq!(event.bytes, 13);
        assert_eq!(event.duration(), std::time::Duration::from_millis(5));
        assert_eq!(event.phase, None);
    }

    #[tokio::test]
    async fn failure_and_discard() {
        let sink = Arc::new(MemorySink::new());
        let op = registry(sink.clone()).operation("A", "op", ActorId(0));

        op.start().failure().unwrap();
        op.start().discard();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn events_carry_current_phase() {
        let orchestrator = Arc::new(Orchestrator::new());
        orchestrator.add_required_tokens(1);
        orchestrator.phases_at_least_to(1);
        let sink = Arc::new(MemorySink::new());
        let op = registry(sink.clone())
            .with_phase_source(orchestrator.clone())
            .operation("A", "op", ActorId(0));

        orchestrator.await_phase_start(0).await.unwrap();
        op.start().success().unwrap();
        orchestrator.await_phase_end(0, true).await.unwrap();
        orchestrator.await_phase_start(1).await.unwrap();
        op.start().success().unwrap();

        let phases: Vec<_> = sink.events().iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![Some(0), Some(1)]);
    }

    #[tokio::test]
    async fn channel_sink_aggregates_in_background() {
        let (sink, handle) = ChannelSink::spawn(4);
        let sink: Arc<dyn MetricsSink> = Arc::new(sink);
        let op = registry(sink.clone()).operation("A", "op", ActorId(0));
        for _ in 0..10 {
            op.start().success().unwrap();
        }
        drop(op);
        drop(sink);

        let agg = handle.await.unwrap();
        assert_eq!(agg.get("A.op").unwrap().count, 10);
    }

    #[tokio::test]
    async fn disconnected_sink_is_an_error() {
        let (sink, handle) = ChannelSink::spawn(1);
        handle.abort();
        let _ = handle.await;

        let op = registry(Arc::new(sink)).operation("A", "op", ActorId(0));
        let err = op.start().success().unwrap_err();
        assert!(matches!(err, MetricsError::Disconnected { ref operation } if operation == "A.op"));
    }
}
