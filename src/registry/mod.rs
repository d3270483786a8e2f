//! Method Registry.
//!
//! Maps a method name to the [`MethodRegistration`] that can serve it: the
//! owning controller type, whether it takes a parameter, the resolver that
//! produces the controller instance, and the erased invocation function.
//!
//! Names are unique across the whole registry. Registering a controller is
//! all-or-nothing: if any of its names collides, nothing is registered.

mod handler;
mod resolver;

use bytes::Bytes;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    // ---
    log_debug,
    log_info,
    Result,
    RpcError,
};

pub use handler::{Controller, Instance, MethodSet};
pub use resolver::{InstanceResolver, Instances};

pub(crate) use resolver::Singleton;

use handler::Invoker;

/// Everything needed to serve one method name.
pub struct MethodRegistration {
    name: String,
    owner: TypeId,
    owner_name: &'static str,
    takes_param: bool,
    resolver: Arc<dyn InstanceResolver>,
    invoker: Invoker,
}

impl MethodRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name of the controller that owns the method.
    pub fn owner_name(&self) -> &'static str {
        self.owner_name
    }

    pub fn takes_param(&self) -> bool {
        self.takes_param
    }

    /// Resolve the controller and run the method on `body`.
    pub async fn invoke(&self, body: Bytes) -> Result<Bytes> {
        // ---
        let instance = self
            .resolver
            .resolve(self.owner)
            .ok_or(RpcError::ControllerUnavailable(self.owner_name))?;
        (self.invoker)(instance, body).await
    }
}

/// Name → method table shared by a server and its dispatch tasks.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<MethodRegistration>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of controller `C`.
    ///
    /// Returns the registered names in declaration order.
    ///
    /// # Errors
    ///
    /// - [`RpcError::DuplicateRegistration`] if a name is already registered
    ///   or declared twice by `C`
    /// - [`RpcError::Config`] for an empty method name
    pub fn register<C: Controller>(&self, resolver: Arc<dyn InstanceResolver>) -> Result<Vec<String>> {
        // ---
        let mut set = MethodSet::<C>::new();
        C::methods(&mut set);
        let entries = set.into_entries();

        let mut methods = self.write();

        let mut names = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.name.is_empty() {
                return Err(RpcError::Config(format!(
                    "{}: method name must not be empty",
                    type_name::<C>()
                )));
            }
            if methods.contains_key(&entry.name) || names.contains(&entry.name) {
                return Err(RpcError::DuplicateRegistration(entry.name.clone()));
            }
            names.push(entry.name.clone());
        }

        for entry in entries {
            log_debug!("registered {} -> {}", entry.name, type_name::<C>());
            let registration = MethodRegistration {
                name: entry.name.clone(),
                owner: TypeId::of::<C>(),
                owner_name: type_name::<C>(),
                takes_param: entry.takes_param,
                resolver: resolver.clone(),
                invoker: entry.invoker,
            };
            methods.insert(entry.name, Arc::new(registration));
        }

        log_info!("registered {} method(s) of {}", names.len(), type_name::<C>());
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodRegistration>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Look up `name` and invoke it.
    ///
    /// # Errors
    ///
    /// - [`RpcError::UnknownMethod`] if nothing is registered under `name`
    /// - [`RpcError::ControllerUnavailable`] if the resolver has no instance
    /// - [`RpcError::Serialization`] if the parameter or result fails to encode
    /// - whatever the method itself returns
    pub async fn invoke(&self, name: &str, body: Bytes) -> Result<Bytes> {
        // ---
        let registration = self
            .get(name)
            .ok_or_else(|| RpcError::UnknownMethod(name.to_string()))?;
        registration.invoke(body).await
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<MethodRegistration>>> {
        match self.methods.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<MethodRegistration>>> {
        match self.methods.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::{json, Value};

    struct Echo;

    impl Controller for Echo {
        fn methods(methods: &mut MethodSet<Self>) {
            // ---
            methods
                .method("Echo", |_c: Arc<Echo>, v: Value| async move { Ok(v) })
                .method_no_params("Nothing", |_c: Arc<Echo>| async move { Ok(()) });
        }
    }

    struct Clash;

    impl Controller for Clash {
        fn methods(methods: &mut MethodSet<Self>) {
            // ---
            methods
                .method_no_params("Fresh", |_c: Arc<Clash>| async move { Ok(1) })
                .method_no_params("Echo", |_c: Arc<Clash>| async move { Ok(2) });
        }
    }

    struct Twice;

    impl Controller for Twice {
        fn methods(methods: &mut MethodSet<Self>) {
            // ---
            methods
                .method_no_params("Same", |_c: Arc<Twice>| async move { Ok(1) })
                .method_no_params("Same", |_c: Arc<Twice>| async move { Ok(2) });
        }
    }

    fn resolver() -> Arc<dyn InstanceResolver> {
        // ---
        let instances = Instances::new();
        instances.insert(Arc::new(Echo));
        instances.insert(Arc::new(Clash));
        Arc::new(instances)
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        // ---
        let registry = MethodRegistry::new();
        let names = registry.register::<Echo>(resolver()).unwrap();
        assert_eq!(names, vec!["Echo", "Nothing"]);

        let out = registry
            .invoke("Echo", Bytes::from_static(br#"{"x":1}"#))
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value, json!({"x": 1}));

        assert!(registry.invoke("Nothing", Bytes::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        // ---
        let registry = MethodRegistry::new();
        let err = registry.invoke("Missing", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::UnknownMethod(name) if name == "Missing"));
    }

    #[test]
    fn test_collision_registers_nothing() {
        // ---
        let registry = MethodRegistry::new();
        registry.register::<Echo>(resolver()).unwrap();

        let err = registry.register::<Clash>(resolver()).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateRegistration(name) if name == "Echo"));
        assert!(!registry.contains("Fresh"));
        assert_eq!(registry.names(), vec!["Echo", "Nothing"]);
    }

    #[test]
    fn test_duplicate_within_controller() {
        // ---
        let registry = MethodRegistry::new();
        assert!(matches!(
            registry.register::<Twice>(resolver()),
            Err(RpcError::DuplicateRegistration(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_instance() {
        // ---
        let registry = MethodRegistry::new();
        registry.register::<Echo>(Arc::new(Instances::new())).unwrap();

        let err = registry.invoke("Nothing", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::ControllerUnavailable(_)));

        let registration = registry.get("Echo").unwrap();
        assert!(registration.takes_param());
        assert!(registration.owner_name().ends_with("Echo"));
    }
}
