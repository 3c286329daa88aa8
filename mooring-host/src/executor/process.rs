//! Worker-process executor
//!
//! Same contract as the threaded variant, but the single worker is a child
//! process. Arguments and results cross the process boundary as framed
//! MessagePack over the child's stdio. The child embeds its own factory
//! registry and runs [`run_worker`]; the `mooring-worker` binary is the
//! reference embedding.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mooring_api::wire::{read_frame, write_frame, FrameError};
use mooring_api::{Payload, ServiceDescriptor, TaskError, TaskOutcome};

use crate::executor::{CallError, ServiceExecutor};
use crate::fsres::NodeContext;
use crate::future::{PooledFuture, Slot, TaskFuture};
use crate::pool::Worker;
use crate::service::FactoryRegistry;

/// Host-to-worker messages
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Construct the service; must be the first message
    Init { descriptor: ServiceDescriptor },

    /// Invoke a method on the constructed service
    Call { method: String, args: Payload },

    /// Drain and exit
    Shutdown,
}

/// Worker-to-host messages
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Service constructed
    Ready,

    /// Outcome of one `Call`
    Outcome(TaskOutcome),

    /// The worker cannot continue
    Fatal { message: String },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("cannot spawn worker process `{program}`: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker process has no stdio pipes")]
    MissingPipes,

    #[error("worker rejected the service: {message}")]
    Init { message: String },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("cannot start executor worker: {0}")]
    WorkerThread(#[source] io::Error),
}

/// The parent's handle on the child's stdio, owned by the I/O worker thread
struct ChildLink {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ChildLink {
    fn call(&mut self, method: &str, args: Payload) -> TaskOutcome {
        let request = WorkerRequest::Call {
            method: method.to_string(),
            args,
        };
        if let Err(e) = write_frame(&mut self.stdin, &request) {
            return Err(TaskError::new(format!("worker request failed: {e}")));
        }
        match read_frame::<WorkerResponse>(&mut self.stdout) {
            Ok(WorkerResponse::Outcome(outcome)) => outcome,
            Ok(WorkerResponse::Fatal { message }) => {
                Err(TaskError::new(format!("worker failed: {message}")))
            }
            Ok(WorkerResponse::Ready) => {
                Err(TaskError::new("worker answered out of protocol"))
            }
            Err(e) => Err(TaskError::new(format!("worker response failed: {e}"))),
        }
    }
}

pub struct ProcessServiceExecutor {
    worker: Worker<ChildLink>,
}

impl ProcessServiceExecutor {
    /// Spawn `program` as the worker process and construct the service in
    /// it. Construction failures surface here, before any task exists.
    pub fn new(program: impl Into<PathBuf>, descriptor: &ServiceDescriptor) -> Result<Self, ProcessError> {
        let program = program.into();
        let mut child = Command::new(&program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or(ProcessError::MissingPipes)?;
        let mut stdout = child.stdout.take().ok_or(ProcessError::MissingPipes)?;

        write_frame(
            &mut stdin,
            &WorkerRequest::Init {
                descriptor: descriptor.clone(),
            },
        )?;
        match read_frame::<WorkerResponse>(&mut stdout)? {
            WorkerResponse::Ready => {}
            WorkerResponse::Fatal { message } => {
                let _ = child.wait();
                return Err(ProcessError::Init { message });
            }
            WorkerResponse::Outcome(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::Init {
                    message: "worker answered out of protocol".into(),
                });
            }
        }

        tracing::debug!(
            service_type = descriptor.service_type(),
            program = %program.display(),
            "process executor ready"
        );

        let link = ChildLink {
            child,
            stdin,
            stdout,
        };
        let worker =
            Worker::spawn("mooring-process-executor", link).map_err(ProcessError::WorkerThread)?;
        Ok(Self { worker })
    }
}

impl ServiceExecutor for ProcessServiceExecutor {
    fn run(&self, method: &str, args: Payload) -> Result<Payload, CallError> {
        let future = self.submit(method, args)?;
        Ok(future.result(None)?)
    }

    fn submit(&self, method: &str, args: Payload) -> Result<Box<dyn TaskFuture>, CallError> {
        let slot = Slot::new();
        let completion = Arc::clone(&slot);
        let method = method.to_string();
        self.worker.execute(move |link| {
            completion.complete(link.call(&method, args));
        })?;
        Ok(Box::new(PooledFuture::new(slot)))
    }
}

impl Drop for ProcessServiceExecutor {
    fn drop(&mut self) {
        // Queued behind any in-flight calls; the worker thread joins after
        // the channel closes.
        let _ = self.worker.execute(|link| {
            let _ = write_frame(&mut link.stdin, &WorkerRequest::Shutdown);
            let _ = link.child.wait();
        });
    }
}

/// Worker-process main loop: serve framed requests on the given streams
/// until `Shutdown` or EOF.
///
/// Embeddings call this from `main` with their own factory registry after
/// setting up logging on stderr; stdout belongs to the protocol.
pub fn run_worker(
    registry: &FactoryRegistry,
    node: Arc<NodeContext>,
    input: &mut impl Read,
    output: &mut impl Write,
) -> Result<(), FrameError> {
    let mut service = None;

    loop {
        let request: WorkerRequest = match read_frame(input) {
            Ok(request) => request,
            Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        match request {
            WorkerRequest::Init { descriptor } => match registry.build(&descriptor, &node) {
                Ok(bound) => {
                    tracing::debug!(service_type = descriptor.service_type(), "worker service ready");
                    service = Some(bound);
                    write_frame(output, &WorkerResponse::Ready)?;
                }
                Err(e) => {
                    write_frame(
                        output,
                        &WorkerResponse::Fatal {
                            message: e.to_string(),
                        },
                    )?;
                    return Ok(());
                }
            },
            WorkerRequest::Call { method, args } => match service.as_mut() {
                Some(bound) => {
                    let outcome = bound.invoke(&method, args);
                    write_frame(output, &WorkerResponse::Outcome(outcome))?;
                }
                None => {
                    write_frame(
                        output,
                        &WorkerResponse::Fatal {
                            message: "call before init".into(),
                        },
                    )?;
                    return Ok(());
                }
            },
            WorkerRequest::Shutdown => break,
        }
    }

    Ok(())
}
