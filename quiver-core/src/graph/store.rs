//! Cache store and transaction records.
//!
//! The store owns every patch of one context together with the in-flight
//! transaction. All patch mutations made while a transaction is open go
//! through [`Store::patch_mut`], [`Store::insert`] or [`Store::remove`], which
//! journal the previous patch so a failed segment can be rolled back.
//!
//! Whatever a rollback discards is handed back as [`Discarded`] and released
//! by the caller once the store is unlocked, since dropping user closures may
//! re-enter the context.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::node::NodeId;
use super::patch::{ListenerId, Patch};
use super::scheduler::{EffectQueue, Job, QueueMark};
use crate::reactive::{AbortController, Cause, Cleanup, PatchInfo};

/// A live resource acquired by a connect hook.
pub(crate) struct Connection {
    pub controller: AbortController,
    pub cleanup: Option<Cleanup>,
}

/// Receives the caches touched by each committed transaction.
pub(crate) type LogFn = Arc<dyn Fn(&[PatchInfo]) + Send + Sync>;

/// Store state outside the patch map that a rollback must undo.
#[derive(Debug, Clone, Copy)]
enum SideEntry {
    /// A connection was pushed for this node.
    Connection(NodeId),
    /// The first cause of this node was registered.
    Init(NodeId),
}

/// One coalesced unit of work.
pub(crate) struct Transaction {
    pub id: u64,
    journal: Vec<(NodeId, Option<Patch>)>,
    side: Vec<SideEntry>,
    /// Changed nodes whose dependents have not been walked yet.
    pub pending: VecDeque<NodeId>,
    /// Changed nodes in causal order.
    pub log: IndexSet<NodeId>,
    /// Nodes whose cache was created or changed, in order.
    pub touched: IndexSet<NodeId>,
    pub effects: EffectQueue,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            journal: Vec::new(),
            side: Vec::new(),
            pending: VecDeque::new(),
            log: IndexSet::new(),
            touched: IndexSet::new(),
            effects: EffectQueue::default(),
        }
    }
}

/// Transaction state recorded when a nested entry point starts.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Savepoint {
    journal: usize,
    side: usize,
    pending: usize,
    log: usize,
    touched: usize,
    effects: QueueMark,
}

/// What a rollback removed from the store.
#[must_use = "discarded state must be released outside the store lock"]
#[derive(Default)]
pub(crate) struct Discarded {
    jobs: Vec<Job>,
    patches: Vec<Patch>,
    connections: Vec<Connection>,
    causes: Vec<Arc<Cause>>,
    transaction: Option<Transaction>,
}

impl Discarded {
    pub fn jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Abort the connections acquired by the rolled back work, run their
    /// cleanups newest first and drop the rest. Call with the store unlocked.
    pub fn release(self, reason: &str) {
        let Self {
            jobs,
            patches,
            connections,
            causes,
            transaction,
        } = self;
        for connection in &connections {
            connection.controller.abort(reason.to_string());
        }
        for connection in connections.into_iter().rev() {
            if let Some(cleanup) = connection.cleanup {
                cleanup();
            }
        }
        drop(jobs);
        drop(transaction);
        drop(patches);
        drop(causes);
    }
}

#[derive(Default)]
pub(crate) struct Store {
    patches: HashMap<NodeId, Patch>,
    connections: HashMap<NodeId, Vec<Connection>>,
    /// First cause seen by each node, for `is_init`.
    initialized: HashMap<NodeId, Arc<Cause>>,
    pub tx: Option<Transaction>,
    /// Advances on every source write and every rollback.
    pub epoch: u64,
    last_version: u64,
    last_tx: u64,
    /// Computed nodes whose computer is running, innermost last.
    pub computing: Vec<NodeId>,
    /// Late jobs of closed transactions, in FIFO order.
    pub late: Vec<Job>,
    /// Set while some call is running late jobs.
    pub draining_late: bool,
    pub flush_scheduled: bool,
    pub log_listeners: IndexMap<ListenerId, LogFn>,
}

impl Store {
    pub fn get(&self, id: NodeId) -> Option<&Patch> {
        self.patches.get(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: NodeId) -> bool {
        self.patches.contains_key(&id)
    }

    /// Mutable access to a patch, journaling its previous contents.
    pub fn patch_mut(&mut self, id: NodeId) -> Option<&mut Patch> {
        let patch = self.patches.get_mut(&id)?;
        if let Some(tx) = self.tx.as_mut() {
            tx.journal.push((id, Some(patch.clone())));
        }
        Some(patch)
    }

    /// Store a patch. A patch it replaces outside a transaction is returned
    /// for the caller to drop unlocked.
    #[must_use]
    pub fn insert(&mut self, patch: Patch) -> Option<Patch> {
        let id = patch.proto.id;
        let previous = self.patches.insert(id, patch);
        match self.tx.as_mut() {
            Some(tx) => {
                tx.journal.push((id, previous));
                tx.touched.insert(id);
                None
            }
            None => previous,
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Patch> {
        let removed = self.patches.remove(&id)?;
        if let Some(tx) = self.tx.as_mut() {
            tx.journal.push((id, Some(removed.clone())));
        }
        Some(removed)
    }

    pub fn add_connection(&mut self, id: NodeId, connection: Connection) {
        self.connections.entry(id).or_default().push(connection);
        if let Some(tx) = self.tx.as_mut() {
            tx.side.push(SideEntry::Connection(id));
        }
    }

    pub fn take_connections(&mut self, id: NodeId) -> Vec<Connection> {
        self.connections.remove(&id).unwrap_or_default()
    }

    /// Register `cause` as the first cause of `id` unless one is known.
    /// Returns the registered cause.
    pub fn first_cause(&mut self, id: NodeId, cause: &Arc<Cause>) -> Arc<Cause> {
        if let Some(first) = self.initialized.get(&id) {
            return Arc::clone(first);
        }
        self.initialized.insert(id, Arc::clone(cause));
        if let Some(tx) = self.tx.as_mut() {
            tx.side.push(SideEntry::Init(id));
        }
        Arc::clone(cause)
    }

    pub fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    pub fn tx_id(&self) -> u64 {
        self.tx.as_ref().map_or(0, |tx| tx.id)
    }

    #[cfg(test)]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Open a fresh transaction. The caller checked none is active.
    pub fn begin(&mut self) -> u64 {
        self.last_tx += 1;
        self.tx = Some(Transaction::new(self.last_tx));
        self.last_tx
    }

    /// Close the transaction. The caller drops it once unlocked.
    #[must_use]
    pub fn finish(&mut self) -> Option<Transaction> {
        self.tx.take()
    }

    pub fn savepoint(&self) -> Option<Savepoint> {
        self.tx.as_ref().map(|tx| Savepoint {
            journal: tx.journal.len(),
            side: tx.side.len(),
            pending: tx.pending.len(),
            log: tx.log.len(),
            touched: tx.touched.len(),
            effects: tx.effects.mark(),
        })
    }

    /// Restore every patch touched since `savepoint` and undo the connections
    /// and registrations made after it.
    pub fn rollback_to(&mut self, savepoint: Savepoint) -> Discarded {
        let mut discarded = Discarded::default();
        let Some(tx) = self.tx.as_mut() else {
            return discarded;
        };
        while tx.journal.len() > savepoint.journal {
            let Some((id, previous)) = tx.journal.pop() else {
                break;
            };
            let displaced = match previous {
                Some(patch) => self.patches.insert(id, patch),
                None => self.patches.remove(&id),
            };
            discarded.patches.extend(displaced);
        }
        while tx.side.len() > savepoint.side {
            match tx.side.pop() {
                Some(SideEntry::Connection(id)) => {
                    if let Some(list) = self.connections.get_mut(&id) {
                        discarded.connections.extend(list.pop());
                        if list.is_empty() {
                            self.connections.remove(&id);
                        }
                    }
                }
                Some(SideEntry::Init(id)) => discarded.causes.extend(self.initialized.remove(&id)),
                None => break,
            }
        }
        tx.pending.truncate(savepoint.pending);
        tx.log.truncate(savepoint.log);
        tx.touched.truncate(savepoint.touched);
        discarded.jobs = tx.effects.truncate(savepoint.effects);
        self.epoch += 1;
        discarded
    }

    /// Roll the whole transaction back and close it.
    pub fn abort_transaction(&mut self) -> Discarded {
        let mut discarded = self.rollback_to(Savepoint::default());
        discarded.transaction = self.tx.take();
        discarded
    }

    /// Record a state change of `id` for propagation and notification.
    pub fn record_change(&mut self, id: NodeId) {
        if let Some(tx) = self.tx.as_mut() {
            tx.log.insert(id);
            tx.touched.insert(id);
            tx.pending.push_back(id);
        }
    }

    pub fn pop_pending(&mut self) -> Option<NodeId> {
        self.tx.as_mut()?.pending.pop_front()
    }

    pub fn log(&self) -> Vec<NodeId> {
        self.tx
            .as_ref()
            .map(|tx| tx.log.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::patch::Patch;
    use crate::reactive::{AbortController, Atom, Cause};
    use std::sync::Arc;

    fn patch_of(atom: &Atom<i32>, value: i32, version: u64) -> Patch {
        Patch::new(atom.proto_arc(), Arc::new(value), version, Cause::detached("test"))
    }

    fn state(store: &Store, id: NodeId) -> Option<i32> {
        store
            .get(id)
            .and_then(|patch| patch.state.downcast_ref::<i32>().copied())
    }

    #[test]
    fn rollback_restores_previous_patches() {
        let a = Atom::new(0);
        let b = Atom::new(0);
        let mut store = Store::default();

        store.begin();
        let _ = store.insert(patch_of(&a, 1, 1));
        let savepoint = store.savepoint().unwrap();

        let _ = store.insert(patch_of(&a, 2, 2));
        let _ = store.insert(patch_of(&b, 5, 3));
        store.record_change(a.id());
        assert_eq!(state(&store, a.id()), Some(2));

        let discarded = store.rollback_to(savepoint);
        assert_eq!(discarded.jobs(), 0);
        discarded.release("test");
        assert_eq!(state(&store, a.id()), Some(1));
        assert!(!store.contains(b.id()));
        assert!(store.log().is_empty());
    }

    #[test]
    fn abort_transaction_discards_everything() {
        let a = Atom::new(0);
        let mut store = Store::default();
        let epoch = store.epoch;

        store.begin();
        let _ = store.insert(patch_of(&a, 1, 1));
        if let Some(patch) = store.patch_mut(a.id()) {
            patch.version = 9;
        }
        store.abort_transaction().release("test");

        assert!(!store.contains(a.id()));
        assert!(!store.in_transaction());
        assert!(store.epoch > epoch);
    }

    #[test]
    fn versions_and_transactions_are_monotonic() {
        let mut store = Store::default();
        let v1 = store.next_version();
        let v2 = store.next_version();
        assert!(v2 > v1);

        let t1 = store.begin();
        drop(store.finish());
        let t2 = store.begin();
        assert!(t2 > t1);
        assert_eq!(store.tx_id(), t2);
    }

    #[test]
    fn rollback_hands_back_connections_and_first_causes() {
        let a = Atom::new(0);
        let mut store = Store::default();
        let cause = Cause::detached("first");

        store.begin();
        let kept = AbortController::new();
        store.add_connection(
            a.id(),
            Connection {
                controller: kept.clone(),
                cleanup: None,
            },
        );
        let savepoint = store.savepoint().unwrap();

        let dropped = AbortController::new();
        store.add_connection(
            a.id(),
            Connection {
                controller: dropped.clone(),
                cleanup: None,
            },
        );
        assert!(Arc::ptr_eq(&store.first_cause(a.id(), &cause), &cause));

        let discarded = store.rollback_to(savepoint);
        assert_eq!(discarded.connections(), 1);
        discarded.release("rolled back");
        assert!(dropped.is_aborted());
        assert!(!kept.is_aborted());

        let other = Cause::detached("second");
        assert!(Arc::ptr_eq(&store.first_cause(a.id(), &other), &other));
        assert_eq!(store.take_connections(a.id()).len(), 1);
    }

    #[test]
    fn touched_tracks_created_and_changed_caches() {
        let a = Atom::new(0);
        let b = Atom::new(0);
        let mut store = Store::default();

        store.begin();
        let _ = store.insert(patch_of(&a, 0, 1));
        let savepoint = store.savepoint().unwrap();
        let _ = store.insert(patch_of(&b, 0, 2));
        store.record_change(a.id());
        store.rollback_to(savepoint).release("test");

        let tx = store.finish().unwrap();
        assert_eq!(tx.touched.iter().copied().collect::<Vec<_>>(), vec![a.id()]);
    }
}
