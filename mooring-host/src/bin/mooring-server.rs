//! Standalone remote execution server with the demo services registered.
//!
//! Usage: mooring-server [listen-addr]

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use mooring_host::demo;
use mooring_host::server::RemoteExecutionServer;
use mooring_host::service::FactoryRegistry;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4567".to_string());

    let registry = Arc::new(FactoryRegistry::new());
    demo::register_demo_services(&registry)?;

    let scratch = std::env::temp_dir().join(format!("mooring-server-{}", std::process::id()));
    let server = RemoteExecutionServer::bind(addr.as_str(), registry, scratch)?;
    server.run()?;
    Ok(())
}
