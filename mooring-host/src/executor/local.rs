//! In-process executor
//!
//! Runs methods synchronously on the calling thread. `submit` is `run` with
//! the outcome wrapped in an [`ImmediateFuture`]; nothing here is deferred.

use std::sync::Arc;

use parking_lot::Mutex;

use mooring_api::{Payload, ServiceDescriptor};

use crate::executor::{CallError, ServiceExecutor};
use crate::fsres::NodeContext;
use crate::future::{ImmediateFuture, TaskFuture};
use crate::service::{BoundService, BuildError, FactoryRegistry};

pub struct LocalServiceExecutor {
    service: Mutex<BoundService>,
}

impl LocalServiceExecutor {
    /// Construct the service instance eagerly; a bad descriptor fails here,
    /// never inside a future.
    pub fn new(
        registry: &FactoryRegistry,
        descriptor: &ServiceDescriptor,
        node: Arc<NodeContext>,
    ) -> Result<Self, BuildError> {
        let service = registry.build(descriptor, &node)?;
        tracing::debug!(service_type = descriptor.service_type(), "local executor ready");
        Ok(Self {
            service: Mutex::new(service),
        })
    }
}

impl ServiceExecutor for LocalServiceExecutor {
    fn run(&self, method: &str, args: Payload) -> Result<Payload, CallError> {
        self.service
            .lock()
            .invoke(method, args)
            .map_err(CallError::Task)
    }

    fn submit(&self, method: &str, args: Payload) -> Result<Box<dyn TaskFuture>, CallError> {
        let outcome = self.service.lock().invoke(method, args);
        Ok(Box::new(ImmediateFuture::new(outcome)))
    }
}
