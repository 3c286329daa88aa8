//! Reference services used by the shipped binaries and the integration
//! tests. Hosts embedding this crate register their own factories instead.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mooring_api::{ServiceDescriptor, TaskError};

use crate::fsres::{FilesystemResource, NodeContext};
use crate::service::{BoundService, BuildError, FactoryRegistry, ServiceBuilder};

/// Service type name of the echo service
pub const ECHO_SERVICE: &str = "echo";

/// A small stateful service exercising every dispatch shape: plain calls,
/// failures, slow calls, and filesystem resource access.
struct EchoService {
    prefix: String,
    count: u64,
}

fn echo_factory(
    descriptor: &ServiceDescriptor,
    node: &Arc<NodeContext>,
) -> Result<BoundService, BuildError> {
    let prefix: Option<String> = descriptor.ctor_args().decode()?;
    let service = EchoService {
        prefix: prefix.unwrap_or_default(),
        count: 0,
    };

    Ok(ServiceBuilder::<EchoService>::new()
        .method("echo", |svc: &mut EchoService, text: String| {
            Ok(format!("{}{}", svc.prefix, text))
        })?
        .method("add", |_: &mut EchoService, (a, b): (i64, i64)| Ok(a + b))?
        .method("count", |svc: &mut EchoService, (): ()| {
            svc.count += 1;
            Ok(svc.count)
        })?
        .method("fail", |_: &mut EchoService, message: String| {
            Err::<(), _>(TaskError::new(message))
        })?
        .method(
            "sleep_echo",
            |_: &mut EchoService, (millis, text): (u64, String)| {
                thread::sleep(Duration::from_millis(millis));
                Ok(text)
            },
        )?
        .method_with_node(
            "read_text",
            |_: &mut EchoService, node: &NodeContext, resource: FilesystemResource| {
                let path = resource
                    .access(node)
                    .map_err(|e| TaskError::new(e.to_string()))?;
                std::fs::read_to_string(&path).map_err(|e| {
                    TaskError::new(format!("cannot read {}: {e}", path.display()))
                })
            },
        )?
        .bind(service, Arc::clone(node)))
}

pub fn register_demo_services(registry: &FactoryRegistry) -> Result<(), BuildError> {
    registry.register(ECHO_SERVICE, echo_factory)
}
