//! Reactive Context
//!
//! A [`Ctx`] is one isolated instance of the reactive graph. It owns the
//! caches (patches) of every atom and action used with it, the in-flight
//! transaction and the effect queues. Handles are shared between contexts;
//! caches never are.
//!
//! # Scopes
//!
//! A `Ctx` value is a cheap handle: an `Arc` to the shared graph plus a
//! *scope* describing who is acting. The engine derives scoped contexts for
//! computers (with a dependency frame, which enables [`Ctx::spy`]), for action
//! handlers and hooks (with their cause) and for connect hooks (with the
//! connection's abort controller). Every derived context talks to the same
//! graph.
//!
//! # Threading
//!
//! `Ctx` is `Send + Sync`. Transactions are serialized by a re-entrant gate:
//! calls made from hooks and listeners on the transaction's own thread join
//! it, other threads wait for it to close.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use serde::Serialize;

use super::abort::{AbortController, Cause};
use super::atom::{Proto, Readable};
use super::effects::Tracker;
use super::subscription::Subscription;
use super::tracking::SpyFrame;
use crate::config::CtxConfig;
use crate::error::{ReactiveError, Result};
use crate::graph::{Connection, ListenerFn, ListenerId, NodeId, NodeKind, Patch, Pub, Store, Value};

pub(crate) struct CtxInner {
    pub id: u64,
    pub config: CtxConfig,
    /// Serializes transactions; re-entrant for the owning thread.
    pub gate: ReentrantMutex<()>,
    pub store: Mutex<Store>,
    pub root: Arc<Cause>,
}

/// Who is acting through a context handle.
#[derive(Clone)]
pub(crate) struct Scope {
    pub cause: Arc<Cause>,
    /// Present while a computer runs.
    pub spy: Option<Arc<Mutex<SpyFrame>>>,
    /// Present inside connect hooks.
    pub connected: Option<Arc<Proto>>,
    /// Present under `take_nested`.
    pub tracker: Option<Arc<Tracker>>,
}

impl Scope {
    fn root(cause: &Arc<Cause>) -> Self {
        Self {
            cause: Arc::clone(cause),
            spy: None,
            connected: None,
            tracker: None,
        }
    }
}

/// Serializable view of one cache, for tests and tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchInfo {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub version: u64,
    pub pubs: Vec<NodeId>,
    pub subs: Vec<NodeId>,
    pub listeners: usize,
    pub connected: bool,
    /// Name of the cause that produced the current state.
    pub cause: String,
}

impl PatchInfo {
    pub(crate) fn of(patch: &Patch) -> Self {
        Self {
            id: patch.proto.id,
            name: patch.proto.name.to_string(),
            kind: patch.proto.kind,
            version: patch.version,
            pubs: patch.pub_ids().collect(),
            subs: patch.subs.iter().copied().collect(),
            listeners: patch.listeners.len(),
            connected: patch.is_connected(),
            cause: patch.cause.name().to_string(),
        }
    }
}

/// An isolated reactive graph.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use quiver_core::{Atom, Ctx};
///
/// let ctx = Ctx::new();
/// let a = Atom::new(0);
/// let b = Atom::computed({
///     let a = a.clone();
///     move |ctx, _| Ok(ctx.spy(&a)? * 2)
/// });
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let _sub = ctx.subscribe(&b, move |value| sink.lock().unwrap().push(*value)).unwrap();
///
/// a.set(&ctx, 1).unwrap();
/// assert_eq!(*seen.lock().unwrap(), vec![0, 2]);
/// ```
#[derive(Clone)]
pub struct Ctx {
    pub(crate) inner: Arc<CtxInner>,
    pub(crate) scope: Scope,
}

impl Ctx {
    pub fn new() -> Self {
        Self::with_config(CtxConfig::default())
    }

    pub fn with_config(config: CtxConfig) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = Cause::root(id);
        let scope = Scope::root(&root);
        Self {
            inner: Arc::new(CtxInner {
                id,
                config,
                gate: ReentrantMutex::new(()),
                store: Mutex::new(Store::default()),
                root,
            }),
            scope,
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &CtxConfig {
        &self.inner.config
    }

    /// Read the current state of `target`, computing it if needed.
    ///
    /// Inside a computation this does not record a dependency; use
    /// [`Ctx::spy`] for that.
    pub fn get<R: Readable>(&self, target: &R) -> Result<R::State> {
        self.transact(|ctx| {
            let snapshot = ctx.actualize(target.proto())?;
            R::decode(target.proto(), &snapshot.state)
        })
    }

    /// Read `target` and record it as a dependency of the running computation.
    pub fn spy<R: Readable>(&self, target: &R) -> Result<R::State> {
        self.track(target, None::<fn(&R::State, Option<&R::State>)>)
    }

    /// Like [`Ctx::spy`], and run `on_change(next, prev)` when the state
    /// differs from what the previous run of this computation read.
    ///
    /// On the first run `prev` is `None`.
    pub fn spy_with<R, F>(&self, target: &R, on_change: F) -> Result<R::State>
    where
        R: Readable,
        F: FnOnce(&R::State, Option<&R::State>),
    {
        self.track(target, Some(on_change))
    }

    fn track<R, F>(&self, target: &R, on_change: Option<F>) -> Result<R::State>
    where
        R: Readable,
        F: FnOnce(&R::State, Option<&R::State>),
    {
        let proto = target.proto();
        let frame = self
            .scope
            .spy
            .as_ref()
            .ok_or_else(|| ReactiveError::SpyOutsideComputation {
                atom: proto.name.to_string(),
            })?;

        let previous = {
            let frame = frame.lock();
            if frame.is_closed() {
                return Err(ReactiveError::SpyOutsideComputation {
                    atom: proto.name.to_string(),
                });
            }
            if frame.owner().id == proto.id {
                return Err(ReactiveError::failed(format!("`{}` spies itself", proto.name)));
            }
            frame.previous(proto.id).cloned()
        };

        let snapshot = self.actualize(proto)?;
        let tx_id = self.store().tx_id();
        let earlier = previous
            .as_ref()
            .filter(|read| read.tx_id == tx_id)
            .map(|read| read.state.clone());
        let state = R::decode_spied(proto, &snapshot.state, earlier.as_ref())?;

        frame.lock().record(Pub {
            proto: Arc::clone(proto),
            version: snapshot.version,
            state: snapshot.state,
            tx_id,
        });

        if let Some(on_change) = on_change {
            match previous {
                Some(read) if read.version == snapshot.version => {}
                Some(read) => {
                    let prev = R::decode(proto, &read.state).ok();
                    on_change(&state, prev.as_ref());
                }
                None => on_change(&state, None),
            }
        }
        Ok(state)
    }

    /// Attach `listener` to `target`.
    ///
    /// The listener is called right away with the current state and then once
    /// per transaction in which the state changed. The first subscription
    /// connects `target` and, transitively, its dependencies.
    pub fn subscribe<R, F>(&self, target: &R, listener: F) -> Result<Subscription>
    where
        R: Readable,
        F: Fn(&R::State) + Send + Sync + 'static,
    {
        let proto = Arc::clone(target.proto());
        let decoder = Arc::clone(&proto);
        let callback: ListenerFn = Arc::new(move |value: &Value| match R::decode(&decoder, value) {
            Ok(state) => listener(&state),
            Err(error) => tracing::warn!(atom = %decoder.name, %error, "listener skipped"),
        });
        let id = ListenerId::new();
        self.transact(|ctx| ctx.attach_listener(&proto, id, callback))?;
        Ok(Subscription::new(self.root(), proto, id))
    }

    /// Attach `listener` to the transaction log.
    ///
    /// After every committed transaction that created or changed caches, the
    /// listener receives a snapshot of each of them in the order they were
    /// first touched. Rolled back transactions are not reported. Listeners run
    /// after the store is released and before late effects.
    pub fn subscribe_log<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[PatchInfo]) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.store().log_listeners.insert(id, Arc::new(listener));
        Subscription::log(self.root(), id)
    }

    /// The cause of whatever is acting through this handle.
    pub fn cause(&self) -> Arc<Cause> {
        Arc::clone(&self.scope.cause)
    }

    /// The nearest cancellation scope up the cause chain.
    pub fn controller(&self) -> Option<AbortController> {
        self.scope.cause.controller()
    }

    /// Inside a connect hook (or work it started): whether the hooked atom is
    /// still connected. `false` anywhere else.
    pub fn still_connected(&self) -> bool {
        let Some(proto) = &self.scope.connected else {
            return false;
        };
        if self.controller().is_some_and(|controller| controller.is_aborted()) {
            return false;
        }
        self.is_connected_id(proto.id)
    }

    /// Whether `target` currently has an observer in this context.
    pub fn is_connected<R: Readable>(&self, target: &R) -> bool {
        self.is_connected_id(target.id())
    }

    fn is_connected_id(&self, id: NodeId) -> bool {
        self.store().get(id).is_some_and(Patch::is_connected)
    }

    /// Snapshot of the cache of `target`, without computing it.
    pub fn inspect<R: Readable>(&self, target: &R) -> Option<PatchInfo> {
        self.store().get(target.id()).map(PatchInfo::of)
    }

    /// Drop the cache of a disconnected `target`. The next read starts over
    /// from its initial state. Returns `false` if there was no cache or the
    /// node is still connected.
    pub fn evict<R: Readable>(&self, target: &R) -> Result<bool> {
        let id = target.id();
        self.transact(|ctx| {
            let removed = {
                let mut store = ctx.store();
                let removable = store.get(id).is_some_and(|patch| !patch.is_connected());
                if removable {
                    store.remove(id)
                } else {
                    None
                }
            };
            Ok(removed.is_some())
        })
    }

    /// Number of caches currently held.
    pub fn cache_len(&self) -> usize {
        self.store().patch_count()
    }

    // -----------------------------------------------------------------------
    // Crate internals
    // -----------------------------------------------------------------------

    pub(crate) fn store(&self) -> MutexGuard<'_, Store> {
        self.inner.store.lock()
    }

    pub(crate) fn derive(&self, scope: Scope) -> Ctx {
        Ctx {
            inner: Arc::clone(&self.inner),
            scope,
        }
    }

    /// The unscoped handle.
    pub(crate) fn root(&self) -> Ctx {
        self.derive(Scope::root(&self.inner.root))
    }

    pub(crate) fn with_cause(&self, cause: Arc<Cause>) -> Ctx {
        self.derive(Scope {
            cause,
            spy: None,
            connected: self.scope.connected.clone(),
            tracker: self.scope.tracker.clone(),
        })
    }

    /// Context for work caused by `proto` acting from this scope.
    pub(crate) fn caused_by(&self, proto: &Proto) -> Ctx {
        self.with_cause(Cause::child(&self.scope.cause, proto.id, &proto.name))
    }

    pub(crate) fn connection_scope(&self, proto: &Arc<Proto>, cause: Arc<Cause>) -> Ctx {
        self.derive(Scope {
            cause,
            spy: None,
            connected: Some(Arc::clone(proto)),
            tracker: None,
        })
    }

    pub(crate) fn patch_cause(&self, proto: &Proto) -> Arc<Cause> {
        self.store()
            .get(proto.id)
            .map_or_else(|| Arc::clone(&self.inner.root), |patch| Arc::clone(&patch.cause))
    }

    pub(crate) fn add_connection(&self, id: NodeId, connection: Connection) {
        self.store().add_connection(id, connection);
    }

    pub(crate) fn take_connections(&self, id: NodeId) -> Vec<Connection> {
        self.store().take_connections(id)
    }

    pub(crate) fn first_cause(&self, id: NodeId, cause: &Arc<Cause>) -> Arc<Cause> {
        self.store().first_cause(id, cause)
    }

    pub(crate) fn detach_log_listener(&self, id: ListenerId) -> bool {
        let removed = self.store().log_listeners.shift_remove(&id);
        removed.is_some()
    }

    pub(crate) fn last_params(&self, proto: &Proto) -> Option<Value> {
        self.store()
            .get(proto.id)
            .and_then(|patch| patch.last_params.clone())
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("id", &self.inner.id)
            .field("cause", &self.scope.cause.name())
            .field("computing", &self.scope.spy.is_some())
            .finish()
    }
}
