//! Cross-node filesystem resources
//!
//! A [`FilesystemResource`] is a path reference tagged with the node that
//! created it. Accessing it on the owning node is a no-op; accessing it
//! anywhere else pulls the file or directory through the owner's filesystem
//! gateway and materializes it in a local scratch directory. Resolution
//! happens at most once per instance; later accesses return the cached path.
//!
//! Gateway registrations live in a [`NodeContext`] owned by the session that
//! created them, so concurrent sessions cannot leak registrations into each
//! other.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mooring_api::wire::{read_frame, write_frame, FrameError, GatewayRequest, GatewayResponse};
use mooring_api::NodeId;

use crate::archive::{self, ArchiveError, DEFAULT_IGNORE_PATTERNS};

#[derive(Debug, Error)]
pub enum FsAccessError {
    #[error("no filesystem gateway registered for node {0}")]
    UnknownOwner(NodeId),

    #[error("a filesystem gateway for node {0} is already registered")]
    AlreadyRegistered(NodeId),

    #[error("resource path has no final component: {0}")]
    InvalidPath(PathBuf),

    #[error("gateway connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("gateway refused the pull: {message}")]
    Refused { message: String },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Per-session node state: own identity, gateway registry, scratch space
#[derive(Debug)]
pub struct NodeContext {
    id: NodeId,
    scratch_root: PathBuf,
    gateways: RwLock<HashMap<NodeId, String>>,
}

impl NodeContext {
    /// A context for the current process
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self::with_id(NodeId::local(), scratch_root)
    }

    /// A context with an explicit id; used to model foreign nodes in tests
    pub fn with_id(id: NodeId, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            scratch_root: scratch_root.into(),
            gateways: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Record where `node`'s filesystem gateway listens. Registering the
    /// same node twice is a fatal configuration error.
    pub fn register_gateway(
        &self,
        node: NodeId,
        addr: impl Into<String>,
    ) -> Result<(), FsAccessError> {
        let mut gateways = self.gateways.write();
        if gateways.contains_key(&node) {
            return Err(FsAccessError::AlreadyRegistered(node));
        }
        let addr = addr.into();
        tracing::debug!(%node, %addr, "filesystem gateway registered");
        gateways.insert(node, addr);
        Ok(())
    }

    fn gateway_for(&self, node: NodeId) -> Option<String> {
        self.gateways.read().get(&node).cloned()
    }

    /// Scratch directory for one logical resource. Deterministic per
    /// (owner, path) so a re-resolution of the same logical resource
    /// overwrites instead of accumulating.
    fn scratch_dir(&self, owner: NodeId, path: &Path) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        owner.hash(&mut hasher);
        path.hash(&mut hasher);
        self.scratch_root.join(format!("fetch-{:016x}", hasher.finish()))
    }
}

/// A path reference that may need cross-node materialization before use
#[derive(Debug, Serialize, Deserialize)]
pub struct FilesystemResource {
    owner: NodeId,
    path: PathBuf,
    #[serde(skip)]
    resolved: Mutex<Option<PathBuf>>,
}

impl Clone for FilesystemResource {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            path: self.path.clone(),
            resolved: Mutex::new(self.resolved.lock().clone()),
        }
    }
}

impl FilesystemResource {
    /// Wrap a path that lives on the current node
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_owner(NodeId::local(), path)
    }

    /// Wrap a path owned by an explicit node
    pub fn with_owner(owner: NodeId, path: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            path: path.into(),
            resolved: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve to a node-local path, pulling content from the owner's
    /// gateway on first access if the resource lives elsewhere.
    pub fn access(&self, node: &NodeContext) -> Result<PathBuf, FsAccessError> {
        let mut resolved = self.resolved.lock();
        if let Some(path) = resolved.as_ref() {
            return Ok(path.clone());
        }

        let local = if self.owner == node.id() {
            self.path.clone()
        } else {
            self.fetch(node)?
        };

        *resolved = Some(local.clone());
        Ok(local)
    }

    fn fetch(&self, node: &NodeContext) -> Result<PathBuf, FsAccessError> {
        let gateway = node
            .gateway_for(self.owner)
            .ok_or(FsAccessError::UnknownOwner(self.owner))?;
        let name = self
            .path
            .file_name()
            .ok_or_else(|| FsAccessError::InvalidPath(self.path.clone()))?
            .to_os_string();

        tracing::debug!(owner = %self.owner, path = %self.path.display(), %gateway, "pulling remote resource");

        let mut stream = TcpStream::connect(&gateway).map_err(FsAccessError::Connect)?;
        write_frame(
            &mut stream,
            &GatewayRequest::FetchPath {
                path: self.path.clone(),
            },
        )?;

        let bytes = match read_frame::<GatewayResponse>(&mut stream)? {
            GatewayResponse::Tree(bytes) => bytes,
            GatewayResponse::Error { message } => {
                return Err(FsAccessError::Refused { message })
            }
        };

        // Wipe-then-decode keeps repeated pulls of the same logical resource
        // from accumulating stale artifacts.
        let scratch = node.scratch_dir(self.owner, &self.path);
        archive::decode_tree(&bytes, &scratch, true)?;

        Ok(scratch.join(name))
    }
}

/// Serves pull requests for paths that live on this node
///
/// One gateway runs per remote session on the client side; its address is
/// registered with the server during session setup.
pub struct FilesystemGateway {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

impl FilesystemGateway {
    /// Bind an ephemeral listener and serve pulls in the background
    pub fn serve() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("mooring-fs-gateway".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let _ = thread::Builder::new()
                                .name("mooring-fs-gateway-conn".into())
                                .spawn(move || serve_connection(stream));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "gateway accept failed");
                        }
                    }
                }
            })?;

        tracing::debug!(%addr, "filesystem gateway listening");
        Ok(Self { addr, shutdown })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FilesystemGateway {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        let _ = TcpStream::connect(self.addr);
    }
}

fn serve_connection(mut stream: TcpStream) {
    loop {
        let request: GatewayRequest = match read_frame(&mut stream) {
            Ok(request) => request,
            Err(_) => break, // peer closed or garbage; either way we are done
        };

        let GatewayRequest::FetchPath { path } = request;
        let response = match encode_path(&path) {
            Ok(bytes) => GatewayResponse::Tree(bytes),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "gateway pull failed");
                GatewayResponse::Error {
                    message: e.to_string(),
                }
            }
        };

        if write_frame(&mut stream, &response).is_err() {
            break;
        }
    }
}

/// Encode the file or directory at `path` as a tree rooted at its parent,
/// whitelisted down to the object itself.
fn encode_path(path: &Path) -> Result<Vec<u8>, FsAccessError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsAccessError::InvalidPath(path.to_path_buf()))?;
    let name = path
        .file_name()
        .ok_or_else(|| FsAccessError::InvalidPath(path.to_path_buf()))?;

    let whitelist = HashSet::from([PathBuf::from(name)]);
    let ignore = archive::compile_patterns(DEFAULT_IGNORE_PATTERNS)?;
    Ok(archive::encode_tree(parent, Some(&whitelist), Some(&ignore))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn local_resource_resolves_to_its_own_path() {
        let scratch = TempDir::new().unwrap();
        let node = NodeContext::new(scratch.path());

        let resource = FilesystemResource::new("/data/somewhere.txt");
        let first = resource.access(&node).unwrap();
        let second = resource.access(&node).unwrap();

        assert_eq!(first, PathBuf::from("/data/somewhere.txt"));
        assert_eq!(first, second);
        // No scratch artifacts for local resources.
        assert!(fs::read_dir(scratch.path()).unwrap().next().is_none());
    }

    #[test]
    fn duplicate_gateway_registration_is_fatal() {
        let node = NodeContext::new("/tmp/unused");
        let other = NodeId::random();

        node.register_gateway(other, "127.0.0.1:1").unwrap();
        let result = node.register_gateway(other, "127.0.0.1:2");
        assert!(matches!(result, Err(FsAccessError::AlreadyRegistered(_))));
    }

    #[test]
    fn unknown_owner_fails_without_network() {
        let scratch = TempDir::new().unwrap();
        let node = NodeContext::new(scratch.path());

        let resource = FilesystemResource::with_owner(NodeId::random(), "/elsewhere/file");
        let result = resource.access(&node);
        assert!(matches!(result, Err(FsAccessError::UnknownOwner(_))));
    }

    #[test]
    fn remote_file_is_pulled_once_and_cached() {
        // The "remote" side: a directory served by a gateway in this process.
        let remote_dir = TempDir::new().unwrap();
        fs::write(remote_dir.path().join("payload.txt"), "over the wire").unwrap();
        let gateway = FilesystemGateway::serve().unwrap();

        // The "local" side: a context with a different node id that knows the
        // gateway address of the owner.
        let owner = NodeId::random();
        let scratch = TempDir::new().unwrap();
        let node = NodeContext::with_id(NodeId::random(), scratch.path());
        node.register_gateway(owner, gateway.addr().to_string())
            .unwrap();

        let resource =
            FilesystemResource::with_owner(owner, remote_dir.path().join("payload.txt"));

        let local = resource.access(&node).unwrap();
        assert_eq!(fs::read_to_string(&local).unwrap(), "over the wire");
        assert!(local.starts_with(scratch.path()));

        // Second access returns the cache even if the scratch copy is gone.
        fs::remove_file(&local).unwrap();
        let again = resource.access(&node).unwrap();
        assert_eq!(again, local);
    }

    #[test]
    fn remote_pull_wipes_stale_scratch_contents() {
        let remote_dir = TempDir::new().unwrap();
        fs::create_dir(remote_dir.path().join("bundle")).unwrap();
        fs::write(remote_dir.path().join("bundle/current.txt"), "v2").unwrap();
        let gateway = FilesystemGateway::serve().unwrap();

        let owner = NodeId::random();
        let scratch = TempDir::new().unwrap();
        let node = NodeContext::with_id(NodeId::random(), scratch.path());
        node.register_gateway(owner, gateway.addr().to_string())
            .unwrap();

        let logical_path = remote_dir.path().join("bundle");

        // Pre-populate the deterministic scratch location with a stale file.
        let stale_dir = node.scratch_dir(owner, &logical_path);
        fs::create_dir_all(&stale_dir).unwrap();
        fs::write(stale_dir.join("stale.txt"), "v1").unwrap();

        let resource = FilesystemResource::with_owner(owner, &logical_path);
        let local = resource.access(&node).unwrap();

        assert_eq!(fs::read_to_string(local.join("current.txt")).unwrap(), "v2");
        assert!(!stale_dir.join("stale.txt").exists());
    }
}
