//! Remote execution server
//!
//! Accepts one session per connection. A session owns everything the remote
//! protocol needs: the service instance on its single worker, the batched
//! result buffer, a filesystem gateway registry, and a scratch directory for
//! the transferred plugin tree. Nothing outlives the connection; a client
//! that never polls leaves results buffered only until its session ends.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use mooring_api::wire::{read_frame, write_frame, Request, Response};
use mooring_api::{TaskId, TaskOutcome, TaskResult};

use crate::archive;
use crate::fsres::NodeContext;
use crate::future::Slot;
use crate::pool::Worker;
use crate::service::{BoundService, FactoryRegistry};

/// The batched result buffer: written by the worker, drained by polls.
///
/// This is the only structure in the protocol mutated by multiple actors;
/// one lock/condvar pair guards it. The drain is atomic under the lock, so
/// no result is delivered twice and none added concurrently is lost; it
/// rides the same batch.
struct ResultBuffer {
    results: Mutex<HashMap<TaskId, TaskOutcome>>,
    ready: Condvar,
}

impl ResultBuffer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        })
    }

    fn insert(&self, id: TaskId, outcome: TaskOutcome) {
        let mut results = self.results.lock();
        results.insert(id, outcome);
        self.ready.notify_all();
    }

    /// Block until `id` is buffered, then drain and return everything
    /// buffered at that moment.
    fn drain_containing(&self, id: TaskId) -> Vec<TaskResult> {
        let mut results = self.results.lock();
        while !results.contains_key(&id) {
            self.ready.wait(&mut results);
        }
        results
            .drain()
            .map(|(id, outcome)| TaskResult { id, outcome })
            .collect()
    }
}

/// Server half of the remote task protocol
pub struct RemoteExecutionServer {
    listener: TcpListener,
    addr: SocketAddr,
    registry: Arc<FactoryRegistry>,
    scratch_root: PathBuf,
}

/// Keeps a spawned server alive; dropping it stops the accept loop
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl RemoteExecutionServer {
    pub fn bind(
        addr: impl ToSocketAddrs,
        registry: Arc<FactoryRegistry>,
        scratch_root: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            registry,
            scratch_root: scratch_root.into(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the process exits; used by the standalone binary
    pub fn run(self) -> io::Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        accept_loop(self.listener, self.registry, self.scratch_root, shutdown);
        Ok(())
    }

    /// Serve on a background thread
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let addr = self.addr;
        let thread = thread::Builder::new()
            .name("mooring-server-accept".into())
            .spawn(move || {
                accept_loop(self.listener, self.registry, self.scratch_root, flag);
            })?;
        Ok(ServerHandle {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }
}

fn accept_loop(
    listener: TcpListener,
    registry: Arc<FactoryRegistry>,
    scratch_root: PathBuf,
    shutdown: Arc<AtomicBool>,
) {
    tracing::info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "remote execution server listening");
    let session_counter = AtomicU64::new(0);

    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let session_id = session_counter.fetch_add(1, Ordering::SeqCst);
        let session_dir = scratch_root.join(format!("session-{session_id}"));
        let registry = Arc::clone(&registry);

        let spawned = thread::Builder::new()
            .name(format!("mooring-session-{session_id}"))
            .spawn(move || {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default();
                tracing::info!(session = session_id, %peer, "session opened");
                ServerSession::new(stream, registry, session_dir).serve();
                tracing::info!(session = session_id, "session closed");
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "cannot spawn session thread");
        }
    }
}

/// Per-connection protocol state
struct ServerSession {
    stream: TcpStream,
    registry: Arc<FactoryRegistry>,
    session_dir: PathBuf,
    node: Arc<NodeContext>,
    buffer: Arc<ResultBuffer>,
    worker: Option<Worker<BoundService>>,
    plugin_dir: Option<PathBuf>,
    /// Ids submitted but not yet delivered; polling any other id is fatal
    pending: HashSet<TaskId>,
}

impl ServerSession {
    fn new(stream: TcpStream, registry: Arc<FactoryRegistry>, session_dir: PathBuf) -> Self {
        let node = Arc::new(NodeContext::new(&session_dir));
        Self {
            stream,
            registry,
            session_dir,
            node,
            buffer: ResultBuffer::new(),
            worker: None,
            plugin_dir: None,
            pending: HashSet::new(),
        }
    }

    fn serve(mut self) {
        loop {
            let request: Request = match read_frame(&mut self.stream) {
                Ok(request) => request,
                Err(_) => break, // peer closed; session state drops with us
            };

            match self.handle(request) {
                Ok(None) => {}
                Ok(Some(response)) => {
                    if write_frame(&mut self.stream, &response).is_err() {
                        break;
                    }
                }
                Err(message) => {
                    // Protocol errors are fatal to the session, not retried.
                    tracing::warn!(%message, "fatal protocol error");
                    let _ = write_frame(&mut self.stream, &Response::Fatal { message });
                    break;
                }
            }
        }
    }

    /// Ok(None) means fire-and-forget; Err is fatal to the session
    fn handle(&mut self, request: Request) -> Result<Option<Response>, String> {
        match request {
            Request::RegisterFilesystemAccess { node, gateway } => {
                self.node
                    .register_gateway(node, gateway)
                    .map_err(|e| e.to_string())?;
                Ok(Some(Response::Ack))
            }

            Request::CopyPlugin { archive } => {
                let plugin_dir = self.session_dir.join("plugin");
                archive::decode_tree(&archive, &plugin_dir, true).map_err(|e| e.to_string())?;
                tracing::debug!(dir = %plugin_dir.display(), "plugin tree materialized");
                self.plugin_dir = Some(plugin_dir);
                Ok(Some(Response::Ack))
            }

            Request::InitService { descriptor } => {
                let plugin_dir = self
                    .plugin_dir
                    .clone()
                    .ok_or("plugin was not copied before init")?;
                // The descriptor still points at the client's filesystem.
                let descriptor = descriptor.rebased(plugin_dir);
                let service = self
                    .registry
                    .build(&descriptor, &self.node)
                    .map_err(|e| e.to_string())?;
                tracing::info!(
                    service_type = descriptor.service_type(),
                    methods = ?service.method_names(),
                    "service instantiated"
                );
                let worker = Worker::spawn("mooring-session-worker", service)
                    .map_err(|e| e.to_string())?;
                self.worker = Some(worker);
                Ok(Some(Response::Ack))
            }

            Request::CallFunc { method, args } => {
                let worker = self.worker.as_ref().ok_or("service not initialized")?;
                let slot = Slot::new();
                let completion = Arc::clone(&slot);
                worker
                    .execute(move |service| {
                        completion.complete(service.invoke(&method, args));
                    })
                    .map_err(|e| e.to_string())?;
                // Queued behind submitted tasks, like every call into the
                // single instance.
                let outcome = slot.wait(None).map_err(|e| e.to_string())?;
                Ok(Some(Response::CallResult(outcome)))
            }

            Request::SubmitFunc { id, method, args } => {
                let worker = self.worker.as_ref().ok_or("service not initialized")?;
                if !self.pending.insert(id) {
                    return Err(format!("task id {id} reused"));
                }
                let buffer = Arc::clone(&self.buffer);
                worker
                    .execute(move |service| {
                        let outcome = service.invoke(&method, args);
                        tracing::debug!(task = id, failed = outcome.is_err(), "task finished");
                        buffer.insert(id, outcome);
                    })
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }

            Request::GetResults { id } => {
                if !self.pending.contains(&id) {
                    return Err(format!("unknown task id {id}"));
                }
                let batch = self.buffer.drain_containing(id);
                for result in &batch {
                    self.pending.remove(&result.id);
                }
                tracing::debug!(task = id, batch = batch.len(), "result batch drained");
                Ok(Some(Response::Results(batch)))
            }
        }
    }
}
