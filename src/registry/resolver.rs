//! Controller instance resolution.
//!
//! The registry stores only the controller's `TypeId`; an [`InstanceResolver`]
//! turns it into an instance for each invocation. [`Instances`] is the
//! built-in resolver: shared singletons and per-call factories keyed by type.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::handler::Instance;

/// Produces controller instances on demand.
///
/// Returning `None` makes the call fail with `ControllerUnavailable`.
pub trait InstanceResolver: Send + Sync {
    fn resolve(&self, owner: TypeId) -> Option<Instance>;
}

type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;

#[derive(Clone)]
enum Source {
    Shared(Instance),
    Factory(Factory),
}

/// Type-keyed controller instances.
///
/// # Example
///
/// ```
/// use amqp_rpc::Instances;
/// use std::sync::Arc;
///
/// struct Clock;
/// struct Counter;
///
/// let instances = Instances::new();
/// instances.insert(Arc::new(Clock));
/// instances.insert_factory(|| Arc::new(Counter));
///
/// assert!(instances.get::<Clock>().is_some());
/// ```
#[derive(Default)]
pub struct Instances {
    sources: RwLock<HashMap<TypeId, Source>>,
}

impl Instances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one instance of `C` across all calls.
    pub fn insert<C: Send + Sync + 'static>(&self, instance: Arc<C>) {
        self.set(TypeId::of::<C>(), Source::Shared(instance));
    }

    /// Build a fresh `C` for every call.
    pub fn insert_factory<C, F>(&self, factory: F)
    where
        C: Send + Sync + 'static,
        F: Fn() -> Arc<C> + Send + Sync + 'static,
    {
        // ---
        let factory: Factory = Arc::new(move || factory() as Instance);
        self.set(TypeId::of::<C>(), Source::Factory(factory));
    }

    /// Forget how to build `C`. Later calls fail as unavailable.
    pub fn remove<C: 'static>(&self) -> bool {
        // ---
        let mut sources = match self.sources.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources.remove(&TypeId::of::<C>()).is_some()
    }

    /// Resolve `C` the same way an invocation would.
    pub fn get<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.resolve(TypeId::of::<C>())?.downcast::<C>().ok()
    }

    fn set(&self, owner: TypeId, source: Source) {
        // ---
        let mut sources = match self.sources.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources.insert(owner, source);
    }
}

impl InstanceResolver for Instances {
    fn resolve(&self, owner: TypeId) -> Option<Instance> {
        // ---
        let source = {
            let sources = match self.sources.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sources.get(&owner).cloned()?
        };
        // Factories run outside the lock.
        match source {
            Source::Shared(instance) => Some(instance),
            Source::Factory(factory) => Some(factory()),
        }
    }
}

/// Resolves exactly one shared instance.
pub(crate) struct Singleton(pub(crate) Instance);

impl InstanceResolver for Singleton {
    fn resolve(&self, owner: TypeId) -> Option<Instance> {
        // ---
        if self.0.as_ref().type_id() == owner {
            Some(self.0.clone())
        } else {
            None
        }
    }
}
