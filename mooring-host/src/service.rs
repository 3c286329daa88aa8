//! Service instances and the method registry
//!
//! A plugin's service is an arbitrary stateful value. Its callable surface
//! is declared once, when the instance is bound: [`ServiceBuilder`] maps
//! method names to typed closures, rejecting duplicates at registration
//! time. The result is a [`BoundService`] that dispatches by name on opaque
//! payloads, which is the only unit of invocation every executor variant
//! understands.
//!
//! Dynamic loading of plugin code is not this crate's business. The seam is
//! [`ServiceFactory`]: given a service type name, a [`FactoryRegistry`]
//! produces a constructor from descriptor to bound instance. Host
//! applications register their factories at startup.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use mooring_api::{Payload, PayloadError, ServiceDescriptor, TaskError};

use crate::fsres::NodeContext;

/// Errors raised while declaring a service's methods
#[derive(Debug, Error)]
pub enum BindError {
    #[error("method `{0}` is registered twice")]
    DuplicateMethod(String),
}

/// Errors raised when constructing a service instance; these fail fast at
/// executor creation and are never deferred into a future
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no factory registered for service type `{0}`")]
    UnknownServiceType(String),

    #[error("a factory for service type `{0}` is already registered")]
    DuplicateServiceType(String),

    #[error("plugin module not found: {0}")]
    MissingModule(std::path::PathBuf),

    #[error("invalid constructor arguments: {0}")]
    CtorArgs(#[from] PayloadError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("cannot start executor worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("service construction failed: {0}")]
    Ctor(#[source] TaskError),
}

type Method =
    Box<dyn Fn(&mut dyn Any, &NodeContext, Payload) -> Result<Payload, TaskError> + Send + Sync>;

/// Declares the callable surface of a service of concrete type `S`
pub struct ServiceBuilder<S> {
    methods: HashMap<String, Method>,
    _marker: std::marker::PhantomData<fn(S)>,
}

impl<S: Send + 'static> ServiceBuilder<S> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Register a method that does not touch node state
    pub fn method<A, R, F>(self, name: &str, f: F) -> Result<Self, BindError>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut S, A) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        self.method_with_node(name, move |service, _node, args| f(service, args))
    }

    /// Register a method that needs the node context, e.g. to resolve
    /// filesystem resources
    pub fn method_with_node<A, R, F>(mut self, name: &str, f: F) -> Result<Self, BindError>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut S, &NodeContext, A) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        if self.methods.contains_key(name) {
            return Err(BindError::DuplicateMethod(name.to_string()));
        }

        let method_name = name.to_string();
        let erased: Method = Box::new(move |instance, node, args| {
            let instance = instance
                .downcast_mut::<S>()
                .ok_or_else(|| TaskError::new("service instance type mismatch"))?;
            let args: A = args.decode().map_err(|e| {
                TaskError::new(format!("invalid arguments for `{method_name}`: {e}"))
            })?;
            let value = f(instance, node, args)?;
            Payload::encode(&value)
                .map_err(|e| TaskError::new(format!("unencodable result from `{method_name}`: {e}")))
        });

        self.methods.insert(name.to_string(), erased);
        Ok(self)
    }

    /// Bind the method table to a live instance
    pub fn bind(self, instance: S, node: Arc<NodeContext>) -> BoundService {
        BoundService {
            instance: Box::new(instance),
            methods: self.methods,
            node,
        }
    }
}

impl<S: Send + 'static> Default for ServiceBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// One live service instance plus its validated method table
pub struct BoundService {
    instance: Box<dyn Any + Send>,
    methods: HashMap<String, Method>,
    node: Arc<NodeContext>,
}

impl BoundService {
    /// Dispatch a method by name. An unknown name is a task error, captured
    /// like any other failure inside the method.
    pub fn invoke(&mut self, method: &str, args: Payload) -> Result<Payload, TaskError> {
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| TaskError::new(format!("service has no method `{method}`")))?;
        f(self.instance.as_mut(), &self.node, args)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

/// Builds a service instance from its descriptor
pub trait ServiceFactory: Send + Sync {
    fn build(
        &self,
        descriptor: &ServiceDescriptor,
        node: &Arc<NodeContext>,
    ) -> Result<BoundService, BuildError>;
}

impl<F> ServiceFactory for F
where
    F: Fn(&ServiceDescriptor, &Arc<NodeContext>) -> Result<BoundService, BuildError>
        + Send
        + Sync,
{
    fn build(
        &self,
        descriptor: &ServiceDescriptor,
        node: &Arc<NodeContext>,
    ) -> Result<BoundService, BuildError> {
        self(descriptor, node)
    }
}

/// Thread-safe map from service type name to factory
#[derive(Default)]
pub struct FactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ServiceFactory>>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        service_type: impl Into<String>,
        factory: impl ServiceFactory + 'static,
    ) -> Result<(), BuildError> {
        let service_type = service_type.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&service_type) {
            return Err(BuildError::DuplicateServiceType(service_type));
        }
        tracing::debug!(service_type = %service_type, "service factory registered");
        factories.insert(service_type, Arc::new(factory));
        Ok(())
    }

    /// Construct a service. Validates the descriptor first: unknown service
    /// types and missing plugin modules fail here, before any worker exists.
    pub fn build(
        &self,
        descriptor: &ServiceDescriptor,
        node: &Arc<NodeContext>,
    ) -> Result<BoundService, BuildError> {
        let factory = self
            .factories
            .read()
            .get(descriptor.service_type())
            .cloned()
            .ok_or_else(|| BuildError::UnknownServiceType(descriptor.service_type().to_string()))?;

        let module_path = descriptor.module_path();
        if !module_path.exists() {
            return Err(BuildError::MissingModule(module_path));
        }

        factory.build(descriptor, node)
    }
}
