//! mooring-host: service executors for plugin-provided services
//!
//! This crate runs plugin services behind a uniform call/submit interface.
//! A service can execute inline, on a dedicated worker thread, in a worker
//! process, or on a remote node over TCP; callers pick the placement and
//! keep the same code.

pub mod archive;
pub mod demo;
pub mod executor;
pub mod fsres;
pub mod future;
mod pool;
pub mod server;
pub mod service;

pub use executor::{
    CallError, LocalServiceExecutor, ProcessServiceExecutor, RemoteServiceExecutor,
    ServiceExecutor, ServiceExecutorExt, ThreadedServiceExecutor,
};
pub use fsres::{FilesystemGateway, FilesystemResource, NodeContext};
pub use future::{TaskFuture, WaitError};
pub use pool::WorkerGone;
pub use server::{RemoteExecutionServer, ServerHandle};
pub use service::{BoundService, FactoryRegistry, ServiceBuilder, ServiceFactory};
pub use mooring_api::{
    NodeId, Payload, PayloadError, PluginDescriptor, ServiceDescriptor, TaskError, TaskId,
    TaskOutcome, TaskResult, MODULE_FILE_PROPERTY,
};
