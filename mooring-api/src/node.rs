//! Node identity
//!
//! Every process that can own filesystem resources gets one random id for
//! its lifetime. The id travels with serialized filesystem resources so the
//! receiving side knows where the underlying path actually lives.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the process (node) a filesystem path is local to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

static LOCAL_NODE: OnceLock<NodeId> = OnceLock::new();

impl NodeId {
    /// The id of the current process, fixed on first use
    pub fn local() -> Self {
        *LOCAL_NODE.get_or_init(|| NodeId(Uuid::new_v4()))
    }

    /// A fresh id distinct from every other, including the local one.
    /// Used to model foreign nodes in tests.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
