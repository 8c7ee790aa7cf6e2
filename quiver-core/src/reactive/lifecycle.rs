//! Connect/Disconnect Lifecycle
//!
//! Hooks are registered on a handle and shared by every context the handle is
//! used in. They fire per context:
//!
//! - **connect** when the atom gains its first observer, direct or through a
//!   connected computed atom. The hook runs with a context whose cause carries
//!   a fresh [`AbortController`] and may return a [`Cleanup`].
//! - **disconnect** when the last observer goes away. The connect scopes are
//!   aborted first, then cleanups run in reverse acquisition order, then the
//!   disconnect hooks.
//! - **update** after every committed state change.
//!
//! Connect and disconnect hooks run as near effects of the transaction that
//! caused the transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::abort::{AbortController, Cause};
use super::atom::{Proto, Readable};
use super::context::Ctx;
use crate::graph::{Connection, Value};

/// Releases what a connect hook acquired.
pub type Cleanup = Box<dyn FnOnce() + Send>;

pub(crate) type ConnectHook = Arc<dyn Fn(&Ctx) -> Option<Cleanup> + Send + Sync>;
pub(crate) type DisconnectHook = Arc<dyn Fn(&Ctx) + Send + Sync>;
pub(crate) type UpdateHook = Arc<dyn Fn(&Ctx, &Value) + Send + Sync>;
/// Receives the action state and the index of the call.
pub(crate) type CallHook = Arc<dyn Fn(&Ctx, &Value, usize) + Send + Sync>;

/// Handle returned by hook registration, used with [`remove_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Observer registry attached to a node descriptor.
#[derive(Default)]
pub(crate) struct HookRegistry {
    connect: RwLock<IndexMap<HookId, ConnectHook>>,
    disconnect: RwLock<IndexMap<HookId, DisconnectHook>>,
    update: RwLock<IndexMap<HookId, UpdateHook>>,
    call: RwLock<IndexMap<HookId, CallHook>>,
}

impl HookRegistry {
    pub fn add_connect(&self, hook: ConnectHook) -> HookId {
        let id = HookId::new();
        self.connect.write().insert(id, hook);
        id
    }

    pub fn add_disconnect(&self, hook: DisconnectHook) -> HookId {
        let id = HookId::new();
        self.disconnect.write().insert(id, hook);
        id
    }

    pub fn add_update(&self, hook: UpdateHook) -> HookId {
        let id = HookId::new();
        self.update.write().insert(id, hook);
        id
    }

    pub fn add_call(&self, hook: CallHook) -> HookId {
        let id = HookId::new();
        self.call.write().insert(id, hook);
        id
    }

    pub fn remove(&self, id: HookId) -> bool {
        self.connect.write().shift_remove(&id).is_some()
            || self.disconnect.write().shift_remove(&id).is_some()
            || self.update.write().shift_remove(&id).is_some()
            || self.call.write().shift_remove(&id).is_some()
    }

    // Snapshots are taken so hooks can register or remove hooks while running.

    pub fn connect_hooks(&self) -> Vec<ConnectHook> {
        self.connect.read().values().cloned().collect()
    }

    pub fn disconnect_hooks(&self) -> Vec<DisconnectHook> {
        self.disconnect.read().values().cloned().collect()
    }

    pub fn update_hooks(&self) -> Vec<UpdateHook> {
        self.update.read().values().cloned().collect()
    }

    pub fn call_hooks(&self) -> Vec<CallHook> {
        self.call.read().values().cloned().collect()
    }

    pub fn has_update_or_call(&self) -> bool {
        !self.update.read().is_empty() || !self.call.read().is_empty()
    }
}

/// Run `hook` every time `target` becomes connected in a context.
///
/// The hook's context exposes the connection's controller through
/// [`Ctx::controller`] and answers [`Ctx::still_connected`]. A returned
/// cleanup runs on disconnect.
pub fn on_connect<R, F>(target: &R, hook: F) -> HookId
where
    R: Readable,
    F: Fn(&Ctx) -> Option<Cleanup> + Send + Sync + 'static,
{
    target.proto().hooks.add_connect(Arc::new(hook))
}

/// Run `hook` every time `target` loses its last observer in a context.
pub fn on_disconnect<R, F>(target: &R, hook: F) -> HookId
where
    R: Readable,
    F: Fn(&Ctx) + Send + Sync + 'static,
{
    target.proto().hooks.add_disconnect(Arc::new(hook))
}

/// Run `hook` with the new state after every committed change of `target`.
///
/// Hooks of a producer run before the hooks of its consumers.
pub fn on_update<R, F>(target: &R, hook: F) -> HookId
where
    R: Readable,
    F: Fn(&Ctx, &R::State) + Send + Sync + 'static,
{
    let proto = Arc::clone(target.proto());
    let decoder = Arc::clone(&proto);
    proto.hooks.add_update(Arc::new(move |ctx: &Ctx, value: &Value| {
        match R::decode(&decoder, value) {
            Ok(state) => hook(ctx, &state),
            Err(error) => tracing::warn!(atom = %decoder.name, %error, "update hook skipped"),
        }
    }))
}

/// Unregister a hook. Returns `false` if it was already removed.
pub fn remove_hook<R: Readable>(target: &R, id: HookId) -> bool {
    target.proto().hooks.remove(id)
}

/// Whether the computation or action call acting through `ctx` is the first
/// one of its node in this context.
///
/// Every call from the same run answers the same. A run that is rolled back
/// does not count. `false` outside computations and action calls.
pub fn is_init(ctx: &Ctx) -> bool {
    let cause = ctx.cause();
    let Some(node) = cause.node() else {
        return false;
    };
    Arc::ptr_eq(&ctx.first_cause(node, &cause), &cause)
}

// ---------------------------------------------------------------------------
// Job bodies, queued as near effects by the transaction engine
// ---------------------------------------------------------------------------

pub(crate) fn run_connect(ctx: &Ctx, proto: &Arc<Proto>) {
    let hooks = proto.hooks.connect_hooks();
    tracing::debug!(ctx = ctx.id(), atom = %proto.name, hooks = hooks.len(), "connected");
    if hooks.is_empty() {
        return;
    }

    let origin = ctx.patch_cause(proto);
    for hook in hooks {
        let controller = AbortController::new();
        let cause = Cause::scope(&origin, format!("connect {}", proto.name), controller.clone());
        let scoped = ctx.connection_scope(proto, cause);
        let cleanup = hook(&scoped);
        ctx.add_connection(proto.id, Connection { controller, cleanup });
    }
}

pub(crate) fn run_disconnect(ctx: &Ctx, proto: &Arc<Proto>) {
    tracing::debug!(ctx = ctx.id(), atom = %proto.name, "disconnected");
    let connections = ctx.take_connections(proto.id);
    let reason = format!("disconnect {}", proto.name);
    for connection in &connections {
        connection.controller.abort(reason.clone());
    }
    for connection in connections.into_iter().rev() {
        if let Some(cleanup) = connection.cleanup {
            cleanup();
        }
    }

    let hooks = proto.hooks.disconnect_hooks();
    if hooks.is_empty() {
        return;
    }
    let scoped = ctx.caused_by(proto);
    for hook in hooks {
        hook(&scoped);
    }
}
