//! Worker-thread executor
//!
//! The service instance moves into a dedicated single worker thread at
//! construction; every call is a job on that worker's queue, so access to
//! the instance is strictly serialized.

use std::sync::Arc;

use mooring_api::{Payload, ServiceDescriptor};

use crate::executor::{CallError, ServiceExecutor};
use crate::fsres::NodeContext;
use crate::future::{PooledFuture, Slot, TaskFuture};
use crate::pool::Worker;
use crate::service::{BoundService, BuildError, FactoryRegistry};

pub struct ThreadedServiceExecutor {
    worker: Worker<BoundService>,
}

impl ThreadedServiceExecutor {
    pub fn new(
        registry: &FactoryRegistry,
        descriptor: &ServiceDescriptor,
        node: Arc<NodeContext>,
    ) -> Result<Self, BuildError> {
        let service = registry.build(descriptor, &node)?;
        let worker = Worker::spawn("mooring-threaded-executor", service)?;
        tracing::debug!(service_type = descriptor.service_type(), "threaded executor ready");
        Ok(Self { worker })
    }
}

impl ServiceExecutor for ThreadedServiceExecutor {
    fn run(&self, method: &str, args: Payload) -> Result<Payload, CallError> {
        // The queue keeps this serialized with submitted work; waiting on
        // the slot blocks just like an inline call would.
        let future = self.submit(method, args)?;
        Ok(future.result(None)?)
    }

    fn submit(&self, method: &str, args: Payload) -> Result<Box<dyn TaskFuture>, CallError> {
        let slot = Slot::new();
        let completion = Arc::clone(&slot);
        let method = method.to_string();
        self.worker.execute(move |service| {
            completion.complete(service.invoke(&method, args));
        })?;
        Ok(Box::new(PooledFuture::new(slot)))
    }
}
