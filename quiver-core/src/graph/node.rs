//! Graph Nodes
//!
//! This module defines the identity and kind of the nodes that live in the
//! reactive graph. A node is described once (by an atom or action handle) and
//! may own one cache per context.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Unique identifier for a node in the reactive graph.
///
/// Ids are process-wide, so the same handle keeps its id in every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the reactive graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A source cell holding a writable value.
    /// It has no dependencies, only dependents.
    Mutable,

    /// A derived cell. Its state is produced by a pure computer from the
    /// dependencies it read during its latest run.
    Computed,

    /// An event cell. Its state is the list of calls made within the current
    /// transaction.
    Action,
}

impl NodeKind {
    /// Whether nodes of this kind accept direct writes.
    pub fn is_writable(&self) -> bool {
        matches!(self, NodeKind::Mutable)
    }

    /// Prefix used when generating display names.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            NodeKind::Mutable => "atom",
            NodeKind::Computed => "computed",
            NodeKind::Action => "action",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn only_mutable_nodes_are_writable() {
        assert!(NodeKind::Mutable.is_writable());
        assert!(!NodeKind::Computed.is_writable());
        assert!(!NodeKind::Action.is_writable());
    }

    #[test]
    fn node_id_display() {
        assert_eq!(NodeId::from(7).to_string(), "#7");
    }
}
