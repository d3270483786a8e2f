//! Type-erased controller methods.
//!
//! A controller method is an async function of the controller instance and an
//! optional decoded parameter. To keep methods of different controllers and
//! parameter types in one table they are wrapped into an [`Invoker`] that
//! takes the instance as `Arc<dyn Any>` and the parameter as raw bytes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use crate::codec;
use crate::{Result, RpcError};

/// A resolved controller instance, erased to `Any`.
pub type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Type-erased async method.
///
/// Wrapped in Arc for cheap cloning into dispatch tasks.
pub(crate) type Invoker = Arc<dyn Fn(Instance, Bytes) -> BoxFuture<Bytes> + Send + Sync>;

/// A set of methods exposed by a controller type.
///
/// Implement this for each controller. Method names are the routing keys
/// clients call; they must be unique across everything registered with one
/// server.
///
/// # Example
///
/// ```
/// use amqp_rpc::{Controller, MethodSet, Result};
/// use std::sync::Arc;
///
/// struct Math;
///
/// impl Math {
///     async fn add(&self, (a, b): (i64, i64)) -> Result<i64> {
///         Ok(a + b)
///     }
/// }
///
/// impl Controller for Math {
///     fn methods(methods: &mut MethodSet<Self>) {
///         methods.method("Add", |math: Arc<Math>, args: (i64, i64)| async move {
///             math.add(args).await
///         });
///     }
/// }
/// ```
pub trait Controller: Send + Sync + Sized + 'static {
    fn methods(methods: &mut MethodSet<Self>);
}

pub(crate) struct MethodEntry {
    pub(crate) name: String,
    pub(crate) takes_param: bool,
    pub(crate) invoker: Invoker,
}

/// Collects the methods of controller `C`.
pub struct MethodSet<C> {
    entries: Vec<MethodEntry>,
    _owner: PhantomData<fn() -> C>,
}

impl<C> MethodSet<C>
where
    C: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            _owner: PhantomData,
        }
    }

    pub(crate) fn into_entries(self) -> Vec<MethodEntry> {
        self.entries
    }

    /// Expose a method taking one JSON-decoded parameter.
    pub fn method<P, R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<C>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        // ---
        let f = Arc::new(f);
        let invoker: Invoker = Arc::new(move |instance: Instance, body: Bytes| {
            let f = f.clone();
            Box::pin(async move {
                let controller = downcast::<C>(instance)?;
                let param: P = codec::decode(&body)?;
                let result = f(controller, param).await?;
                codec::encode_result(&result)
            }) as BoxFuture<Bytes>
        });

        self.entries.push(MethodEntry {
            name: name.to_string(),
            takes_param: true,
            invoker,
        });
        self
    }

    /// Expose a method without parameters. Any request body is ignored.
    pub fn method_no_params<R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        R: Serialize + Send + 'static,
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        // ---
        let f = Arc::new(f);
        let invoker: Invoker = Arc::new(move |instance: Instance, _body: Bytes| {
            let f = f.clone();
            Box::pin(async move {
                let controller = downcast::<C>(instance)?;
                let result = f(controller).await?;
                codec::encode_result(&result)
            }) as BoxFuture<Bytes>
        });

        self.entries.push(MethodEntry {
            name: name.to_string(),
            takes_param: false,
            invoker,
        });
        self
    }
}

fn downcast<C: Send + Sync + 'static>(instance: Instance) -> Result<Arc<C>> {
    instance
        .downcast::<C>()
        .map_err(|_| RpcError::ControllerUnavailable(type_name::<C>()))
}
