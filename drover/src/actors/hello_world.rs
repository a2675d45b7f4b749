use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use async_trait::async_trait;
use drover_macros::phase_config;

use crate::{
    actor::{Actor, ActorContext, ActorId, ActorKind},
    error::{ActorError, SetupError},
    metrics::Operation,
    phase::PhaseLoop,
    state::StateKey,
};

/// Shared by every HelloWorld instance of a run.
pub static HELLO_WORLD_COUNTER: StateKey<AtomicI64> = StateKey::new("HelloWorldCounter");

#[phase_config]
pub struct HelloWorldPhase {
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "Hello, World!".to_string()
}

/// Smoke-test actor for the framework itself.
///
/// Every iteration times one `hello` operation, bumps the shared
/// [`HELLO_WORLD_COUNTER`] and records the message as one document.
pub struct HelloWorld {
    id: ActorId,
    operation: Operation,
    phase_loop: PhaseLoop<HelloWorldPhase>,
    counter: Arc<AtomicI64>,
}

impl HelloWorld {
    pub fn counter(&self) -> &Arc<AtomicI64> {
        &self.counter
    }
}

impl ActorKind for HelloWorld {
    const DEFAULT_NAME: &'static str = "HelloWorld";

    fn build(ctx: &ActorContext<'_>, id: ActorId) -> Result<Self, SetupError> {
        Ok(Self {
            id,
            operation: ctx.operation("hello", id),
            phase_loop: PhaseLoop::new(ctx, id)?,
            counter: ctx.shared_state().get_or_default(&HELLO_WORLD_COUNTER)?,
        })
    }
}

#[async_trait]
impl Actor for HelloWorld {
    async fn run(&mut self) -> Result<(), ActorError> {
        while let Some(mut phase) = self.phase_loop.next_phase().await? {
            while phase.next_iteration().await {
                let mut ctx = self.operation.start();
                tracing::debug!("{} ({}): {}", self.operation.actor(), self.id, phase.message);
                self.counter.fetch_add(1, Ordering::SeqCst);
                ctx.add_documents(1);
                ctx.add_bytes(phase.message.len() as u64);
                ctx.success()?;
            }
        }
        Ok(())
    }
}
