//! Remote executor: client side of the remote task protocol
//!
//! Session setup registers this node's filesystem gateway, ships the plugin
//! directory, and instructs the server to construct the service. After
//! that, `run` is one round trip per call and `submit` is fire-and-forget:
//! results come back in batches, so waiting for one task delivers every
//! other task that finished in the meantime for free.
//!
//! One TCP connection carries the whole session, so at most one request is
//! in flight at a time. A bounded wait that expires leaves the server's poll
//! response owed on the wire; the session consumes it before the next
//! request.

use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use mooring_api::wire::{read_frame, write_frame, FrameError, Request, Response};
use mooring_api::{Payload, ServiceDescriptor, TaskId, TaskResult};

use crate::archive::{self, ArchiveError, DEFAULT_IGNORE_PATTERNS};
use crate::executor::{CallError, ServiceExecutor};
use crate::fsres::{FilesystemGateway, NodeContext};
use crate::future::{RemoteFuture, RemoteWaiter, Slot, TaskFuture, WaitError};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot connect to remote execution server: {0}")]
    Connect(#[source] io::Error),

    #[error("cannot start filesystem gateway: {0}")]
    Gateway(#[source] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("server rejected session setup: {message}")]
    Rejected { message: String },

    #[error("protocol violation: {0}")]
    Protocol(String),
}

struct Connection {
    stream: TcpStream,
    /// True while the server owes us a `Results` response from a poll whose
    /// bounded wait expired
    poll_outstanding: bool,
}

impl Connection {
    fn send(&mut self, request: &Request) -> Result<(), FrameError> {
        write_frame(&mut self.stream, request)
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Response, FrameError> {
        self.stream.set_read_timeout(timeout)?;
        let response = read_frame(&mut self.stream);
        let _ = self.stream.set_read_timeout(None);
        response
    }

    fn request(&mut self, request: &Request) -> Result<Response, FrameError> {
        self.send(request)?;
        self.receive(None)
    }
}

struct Session {
    conn: Mutex<Connection>,
    futures: Mutex<HashMap<TaskId, Arc<Slot>>>,
    next_id: AtomicU64,
}

impl Session {
    /// Hand each result of a batch to its tracked future; results for
    /// untracked ids are dropped.
    fn distribute(&self, batch: Vec<TaskResult>) {
        let mut futures = self.futures.lock();
        for result in batch {
            match futures.remove(&result.id) {
                Some(slot) => slot.complete(result.outcome),
                None => {
                    tracing::warn!(task = result.id, "dropping result for untracked task");
                }
            }
        }
    }

    fn is_tracked(&self, id: TaskId) -> bool {
        self.futures.lock().contains_key(&id)
    }

    /// Read the `Results` response the server owes us, if any, and
    /// distribute it. Must run before sending any further request.
    fn drain_owed(
        &self,
        conn: &mut Connection,
        timeout: Option<Duration>,
    ) -> Result<(), WaitError> {
        if !conn.poll_outstanding {
            return Ok(());
        }
        match conn.receive(timeout) {
            Ok(Response::Results(batch)) => {
                conn.poll_outstanding = false;
                self.distribute(batch);
                Ok(())
            }
            Ok(Response::Fatal { message }) => Err(WaitError::Session(message)),
            Ok(other) => Err(WaitError::Session(format!(
                "unexpected response to a result poll: {other:?}"
            ))),
            Err(e) if e.is_timeout() => Err(WaitError::Timeout),
            Err(e) => Err(WaitError::Session(e.to_string())),
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, WaitError> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let left = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(WaitError::Timeout)?;
            Ok(Some(left))
        }
    }
}

impl RemoteWaiter for Session {
    fn wait_for(&self, id: TaskId, timeout: Option<Duration>) -> Result<(), WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.conn.lock();

        // A batch owed from an expired earlier wait may already carry this id.
        self.drain_owed(&mut conn, remaining(deadline)?)?;
        if !self.is_tracked(id) {
            return Ok(());
        }

        conn.send(&Request::GetResults { id })
            .map_err(|e| WaitError::Session(e.to_string()))?;
        conn.poll_outstanding = true;
        // The server answers once `id` is buffered, with everything buffered
        // at that moment; on success the batch is guaranteed to deliver it.
        self.drain_owed(&mut conn, remaining(deadline)?)
    }
}

/// Executor whose service instance lives on a remote node
///
/// Useful when the service needs resources the local node lacks, or when it
/// benefits from physical proximity to some other system.
pub struct RemoteServiceExecutor {
    session: Arc<Session>,
    // Serves cross-node pulls for resources this node owns; lives exactly as
    // long as the session that registered it.
    _gateway: FilesystemGateway,
}

impl RemoteServiceExecutor {
    /// Open a session: register filesystem access, transfer the plugin tree,
    /// construct the service remotely. Any rejection fails here.
    pub fn connect(
        addr: impl ToSocketAddrs,
        descriptor: &ServiceDescriptor,
        node: &NodeContext,
    ) -> Result<Self, RemoteError> {
        let stream = TcpStream::connect(addr).map_err(RemoteError::Connect)?;
        let gateway = FilesystemGateway::serve().map_err(RemoteError::Gateway)?;

        let mut conn = Connection {
            stream,
            poll_outstanding: false,
        };

        expect_ack(conn.request(&Request::RegisterFilesystemAccess {
            node: node.id(),
            gateway: gateway.addr().to_string(),
        })?)?;

        let ignore = archive::compile_patterns(DEFAULT_IGNORE_PATTERNS)?;
        let archive = archive::encode_tree(descriptor.plugin_dir(), None, Some(&ignore))?;
        expect_ack(conn.request(&Request::CopyPlugin { archive })?)?;

        expect_ack(conn.request(&Request::InitService {
            descriptor: descriptor.clone(),
        })?)?;

        tracing::info!(
            service_type = descriptor.service_type(),
            "remote session established"
        );

        Ok(Self {
            session: Arc::new(Session {
                conn: Mutex::new(conn),
                futures: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
            _gateway: gateway,
        })
    }
}

fn expect_ack(response: Response) -> Result<(), RemoteError> {
    match response {
        Response::Ack => Ok(()),
        Response::Fatal { message } => Err(RemoteError::Rejected { message }),
        other => Err(RemoteError::Protocol(format!(
            "expected an ack, got {other:?}"
        ))),
    }
}

impl ServiceExecutor for RemoteServiceExecutor {
    fn run(&self, method: &str, args: Payload) -> Result<Payload, CallError> {
        let mut conn = self.session.conn.lock();
        self.session
            .drain_owed(&mut conn, None)
            .map_err(CallError::from)?;

        conn.send(&Request::CallFunc {
            method: method.to_string(),
            args,
        })?;
        match conn.receive(None)? {
            Response::CallResult(outcome) => outcome.map_err(CallError::Task),
            Response::Fatal { message } => Err(CallError::Protocol(message)),
            other => Err(CallError::Protocol(format!(
                "unexpected response to a call: {other:?}"
            ))),
        }
    }

    fn submit(&self, method: &str, args: Payload) -> Result<Box<dyn TaskFuture>, CallError> {
        let id = self.session.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Slot::new();
        self.session.futures.lock().insert(id, Arc::clone(&slot));

        let sent = {
            let mut conn = self.session.conn.lock();
            conn.send(&Request::SubmitFunc {
                id,
                method: method.to_string(),
                args,
            })
        };
        if let Err(e) = sent {
            self.session.futures.lock().remove(&id);
            return Err(e.into());
        }

        tracing::debug!(task = id, method, "task submitted");
        Ok(Box::new(RemoteFuture::new(
            id,
            slot,
            Arc::clone(&self.session) as Arc<dyn RemoteWaiter>,
        )))
    }
}
