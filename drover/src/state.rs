//! Shared state between actors.
//!
//! Values are addressed by a typed [`StateKey`] and constructed lazily, at most
//! once, by whichever actor asks first. Everybody else gets the same
//! `Arc<T>`. A construction failure is remembered: later lookups of the key fail
//! with [`StateError::PreviouslyFailed`] instead of retrying.
//!
//! ```rust,ignore
//! static COUNTER: StateKey<AtomicI64> = StateKey::new("HelloWorldCounter");
//!
//! let counter = ctx.shared_state().get_or_default(&COUNTER)?;
//! counter.fetch_add(1, Ordering::Relaxed);
//! ```
//!
//! The value's own synchronization is the caller's business; the registry only
//! guards construction.

use std::{
    any::{Any, type_name},
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::error::{BoxError, StateError};

type Shared = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn FnOnce() -> Result<Shared, BoxError> + Send>;

pub struct StateKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey<{}>({})", type_name::<T>(), self.name)
    }
}

enum Slot {
    Empty,
    Ready(Shared),
    Failed(String),
}

struct Entry {
    factory: Mutex<Option<Factory>>,
    slot: Mutex<Slot>,
}

impl Entry {
    fn empty(factory: Option<Factory>) -> Arc<Self> {
        Arc::new(Self {
            factory: Mutex::new(factory),
            slot: Mutex::new(Slot::Empty),
        })
    }
}

#[derive(Default)]
pub struct SharedStateRegistry {
    entries: Mutex<HashMap<&'static str, Arc<Entry>>>,
}

impl fmt::Debug for SharedStateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("SharedStateRegistry")
            .field("keys", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SharedStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers how the value for `key` is built. The factory runs on first
    /// [`get`](Self::get).
    pub fn register<T, F>(&self, key: &StateKey<T>, factory: F) -> Result<(), StateError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(key.name) {
            return Err(StateError::AlreadyRegistered { key: key.name });
        }
        let factory: Factory = Box::new(move || factory().map(|value| Arc::new(value) as Shared));
        entries.insert(key.name, Entry::empty(Some(factory)));
        Ok(())
    }

    /// The value for a key registered up front.
    pub fn get<T>(&self, key: &StateKey<T>) -> Result<Arc<T>, StateError>
    where
        T: Send + Sync + 'static,
    {
        let entry = self
            .entries
            .lock()
            .get(key.name)
            .cloned()
            .ok_or(StateError::Unregistered { key: key.name })?;
        Self::resolve(key, &entry, || {
            entry
                .factory
                .lock()
                .take()
                .ok_or(StateError::Unregistered { key: key.name })
                .and_then(|factory| {
                    factory().map_err(|source| StateError::Construction {
                        key: key.name,
                        source,
                    })
                })
        })
    }

    /// The value for `key`, built with `init` if nobody did so yet.
    pub fn get_or_init<T, F>(&self, key: &StateKey<T>, init: F) -> Result<Arc<T>, StateError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError>,
    {
        let entry = Arc::clone(
            self.entries
                .lock()
                .entry(key.name)
                .or_insert_with(|| Entry::empty(None)),
        );
        Self::resolve(key, &entry, || {
            // A registered factory takes precedence over the caller's.
            let pending = entry.factory.lock().take();
            let built = match pending {
                Some(factory) => factory(),
                None => init().map(|value| Arc::new(value) as Shared),
            };
            built.map_err(|source| StateError::Construction {
                key: key.name,
                source,
            })
        })
    }

    pub fn get_or_default<T>(&self, key: &StateKey<T>) -> Result<Arc<T>, StateError>
    where
        T: Default + Send + Sync + 'static,
    {
        self.get_or_init(key, || Ok(T::default()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Builds the slot under its lock so concurrent callers wait for the one
    /// construction instead of racing it.
    fn resolve<T>(
        key: &StateKey<T>,
        entry: &Entry,
        build: impl FnOnce() -> Result<Shared, StateError>,
    ) -> Result<Arc<T>, StateError>
    where
        T: Send + Sync + 'static,
    {
        let mut slot = entry.slot.lock();
        let shared = match &*slot {
            Slot::Ready(shared) => Arc::clone(shared),
            Slot::Failed(reason) => {
                return Err(StateError::PreviouslyFailed {
                    key: key.name,
                    reason: reason.clone(),
                });
            }
            Slot::Empty => match build() {
                Ok(shared) => {
                    tracing::debug!("Constructed shared state `{}`", key.name);
                    *slot = Slot::Ready(Arc::clone(&shared));
                    shared
                }
                Err(err) => {
                    if let StateError::Construction { .. } = err {
                        tracing::warn!("{err}");
                        *slot = Slot::Failed(err.to_string());
                    }
                    return Err(err);
                }
            },
        };
        shared.downcast::<T>().map_err(|_| StateError::TypeMismatch {
            key: key.name,
            expected: type_name::<T>(),
        })
    }
}
