//! The cast: every actor kind a workload may name in `Type`.

use std::{collections::BTreeMap, fmt, marker::PhantomData, sync::Arc};

use crate::{
    actor::{ActorContext, ActorInstance, ActorKind},
    error::SetupError,
};

/// Builds all instances of one actor block.
pub trait ActorProducer: Send + Sync {
    fn default_name(&self) -> &'static str;

    /// One instance per `Threads`, each with a fresh id.
    fn produce(&self, ctx: &ActorContext<'_>) -> Result<Vec<ActorInstance>, SetupError>;
}

/// Builds `Threads` instances of `A` through [`ActorKind::build`].
pub struct DefaultActorProducer<A>(PhantomData<fn() -> A>);

impl<A> Default for DefaultActorProducer<A> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<A: ActorKind> ActorProducer for DefaultActorProducer<A> {
    fn default_name(&self) -> &'static str {
        A::DEFAULT_NAME
    }

    fn produce(&self, ctx: &ActorContext<'_>) -> Result<Vec<ActorInstance>, SetupError> {
        (0..ctx.threads())
            .map(|_| {
                let id = ctx.next_actor_id();
                let actor = A::build(ctx, id)?;
                Ok(ActorInstance::new(ctx.name(), id, Box::new(actor)))
            })
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct Cast {
    producers: BTreeMap<String, Arc<dyn ActorProducer>>,
}

impl fmt::Debug for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.producers.keys()).finish()
    }
}

impl Cast {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cast with the actors that ship with the crate.
    #[cfg(feature = "builtins")]
    pub fn with_builtins() -> Self {
        Self::new().register::<crate::actors::HelloWorld>()
    }

    /// Registers `A` under its `DEFAULT_NAME`.
    pub fn register<A: ActorKind>(self) -> Self {
        self.register_producer(A::DEFAULT_NAME, DefaultActorProducer::<A>::default())
    }

    pub fn register_producer(
        mut self,
        type_name: impl Into<String>,
        producer: impl ActorProducer + 'static,
    ) -> Self {
        let type_name = type_name.into();
        if self
            .producers
            .insert(type_name.clone(), Arc::new(producer))
            .is_some()
        {
            tracing::warn!("Actor type `{type_name}` registered twice, keeping the latest");
        }
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn ActorProducer>> {
        self.producers.get(type_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.producers.keys().map(String::as_str)
    }
}
