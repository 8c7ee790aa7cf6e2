//! Per-context caches ("patches").
//!
//! A patch is the snapshot a context keeps for one node: its current state,
//! the dependencies read by its latest computation, the dependents currently
//! linked to it and the external listeners attached to it.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use super::node::NodeId;
use crate::reactive::{Cause, Proto};

/// Type-erased node state.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Erased listener callback.
pub(crate) type ListenerFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifier of an external listener attached with `Ctx::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A dependency read during a computation, with the version and state seen.
#[derive(Clone)]
pub(crate) struct Pub {
    pub proto: Arc<Proto>,
    pub version: u64,
    pub state: Value,
    /// Transaction the read happened in. Action reads are only comparable
    /// within one transaction.
    pub tx_id: u64,
}

impl Pub {
    pub fn id(&self) -> NodeId {
        self.proto.id
    }
}

/// Pub lists rarely exceed a handful of entries.
pub(crate) type Pubs = SmallVec<[Pub; 4]>;

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub callback: ListenerFn,
    /// Version this listener was last called with.
    pub seen: u64,
}

#[derive(Clone)]
pub(crate) struct Patch {
    pub proto: Arc<Proto>,
    pub state: Value,
    pub version: u64,
    pub pubs: Pubs,
    pub subs: IndexSet<NodeId>,
    pub listeners: IndexMap<ListenerId, ListenerEntry>,
    pub cause: Arc<Cause>,
    /// Epoch at which a computed patch was last validated against its pubs.
    pub checked_epoch: u64,
    /// Version handed to update hooks.
    pub hooked_version: u64,
    /// Transaction whose calls an action patch holds.
    pub tx_id: u64,
    /// Action calls already handed to call hooks in `tx_id`.
    pub hooked_calls: usize,
    /// Params of the latest action call, kept across transactions for retry.
    pub last_params: Option<Value>,
}

impl Patch {
    pub fn new(proto: Arc<Proto>, state: Value, version: u64, cause: Arc<Cause>) -> Self {
        Self {
            proto,
            state,
            version,
            pubs: Pubs::new(),
            subs: IndexSet::new(),
            listeners: IndexMap::new(),
            cause,
            checked_epoch: 0,
            hooked_version: version,
            tx_id: 0,
            hooked_calls: 0,
            last_params: None,
        }
    }

    /// An atom is connected iff something observes it: a linked dependent
    /// or a direct listener.
    pub fn is_connected(&self) -> bool {
        !self.subs.is_empty() || !self.listeners.is_empty()
    }

    pub fn pub_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.pubs.iter().map(Pub::id)
    }
}
