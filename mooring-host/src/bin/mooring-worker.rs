//! Worker-process entry point for [`ProcessServiceExecutor`], with the demo
//! services registered. Logs go to stderr; stdout carries the protocol.

use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use mooring_host::demo;
use mooring_host::executor::run_worker;
use mooring_host::fsres::NodeContext;
use mooring_host::service::FactoryRegistry;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let registry = FactoryRegistry::new();
    demo::register_demo_services(&registry)?;

    let scratch = std::env::temp_dir().join(format!("mooring-worker-{}", std::process::id()));
    let node = Arc::new(NodeContext::new(scratch));

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_worker(&registry, node, &mut stdin.lock(), &mut stdout.lock())?;
    Ok(())
}
