//! Cause chain and cancellation.
//!
//! Every patch and every derived context carries a [`Cause`]: the causal
//! predecessor that produced it. Causes form a chain ending at the context's
//! root. Some causes (connect hook scopes) carry an [`AbortController`]; the
//! nearest one up the chain is the cancellation scope of any work started
//! from there, so async continuations never thread a token by hand.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use super::context::Ctx;
use crate::graph::NodeId;

/// Chains longer than this are compacted onto their cancellation anchor.
const MAX_CAUSE_DEPTH: usize = 128;

/// Cancellation outcome, distinct from computation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("aborted: {reason}")]
pub struct AbortError {
    reason: Arc<str>,
}

impl AbortError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: Arc::from(reason.into()),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

type AbortListener = Box<dyn FnOnce(AbortError) + Send>;

#[derive(Default)]
struct AbortInner {
    reason: Mutex<Option<AbortError>>,
    listeners: Mutex<Vec<AbortListener>>,
    notify: Notify,
}

/// A one-shot cancellation switch shared by everything started in its scope.
///
/// Aborting does not stop synchronous code. Async effects observe it at their
/// next suspension point and resolve with [`AbortError`].
#[derive(Clone, Default)]
pub struct AbortController {
    inner: Arc<AbortInner>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort with `reason`. Returns `false` if it was already aborted.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let error = AbortError::new(reason);
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(error.clone());
        }

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        self.inner.notify.notify_waiters();
        for listener in listeners {
            listener(error.clone());
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<AbortError> {
        self.inner.reason.lock().clone()
    }

    pub fn throw_if_aborted(&self) -> Result<(), AbortError> {
        match self.reason() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Run `listener` when this controller aborts, or right away if it
    /// already has.
    pub fn on_abort(&self, listener: impl FnOnce(AbortError) + Send + 'static) {
        let mut listeners = self.inner.listeners.lock();
        match self.reason() {
            Some(error) => {
                drop(listeners);
                listener(error);
            }
            None => listeners.push(Box::new(listener)),
        }
    }

    /// Resolve once the controller is aborted.
    pub async fn aborted(&self) -> AbortError {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(error) = self.reason() {
                return error;
            }
            notified.await;
        }
    }

    pub fn same_as(&self, other: &AbortController) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// One link of a causal chain.
pub struct Cause {
    ctx_id: u64,
    node: Option<NodeId>,
    name: Arc<str>,
    parent: Option<Arc<Cause>>,
    controller: Option<AbortController>,
    depth: usize,
}

impl Cause {
    pub(crate) fn root(ctx_id: u64) -> Arc<Self> {
        Arc::new(Self {
            ctx_id,
            node: None,
            name: Arc::from("root"),
            parent: None,
            controller: None,
            depth: 0,
        })
    }

    /// A root that belongs to no context.
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Arc<Self> {
        Arc::new(Self {
            ctx_id: 0,
            node: None,
            name: Arc::from(name),
            parent: None,
            controller: None,
            depth: 0,
        })
    }

    pub(crate) fn child(parent: &Arc<Cause>, node: NodeId, name: &Arc<str>) -> Arc<Self> {
        Self::link(parent, Some(node), Arc::clone(name), None)
    }

    /// A cancellation scope below `parent`.
    pub(crate) fn scope(parent: &Arc<Cause>, name: String, controller: AbortController) -> Arc<Self> {
        Self::link(parent, None, Arc::from(name), Some(controller))
    }

    fn link(
        parent: &Arc<Cause>,
        node: Option<NodeId>,
        name: Arc<str>,
        controller: Option<AbortController>,
    ) -> Arc<Self> {
        let parent = if parent.depth >= MAX_CAUSE_DEPTH {
            parent.anchor()
        } else {
            Arc::clone(parent)
        };
        Arc::new(Self {
            ctx_id: parent.ctx_id,
            node,
            name,
            depth: parent.depth + 1,
            parent: Some(parent),
            controller,
        })
    }

    /// Nearest ancestor (or self) carrying a controller, else the root.
    fn anchor(self: &Arc<Self>) -> Arc<Cause> {
        let mut current = self;
        while current.controller.is_none() {
            match &current.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Arc::clone(current)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn parent(&self) -> Option<&Arc<Cause>> {
        self.parent.as_ref()
    }

    pub fn ctx_id(&self) -> u64 {
        self.ctx_id
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// This link followed by its ancestors.
    pub fn chain(&self) -> impl Iterator<Item = &Cause> {
        std::iter::successors(Some(self), |cause| cause.parent.as_deref())
    }

    /// The active cancellation scope for work caused by this link.
    pub fn controller(&self) -> Option<AbortController> {
        self.chain().find_map(|cause| cause.controller.clone())
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.chain().map(Cause::name).collect();
        f.debug_struct("Cause")
            .field("ctx", &self.ctx_id)
            .field("chain", &names)
            .finish()
    }
}

/// Attach `listener` to the cancellation scope of `ctx`.
///
/// Fires immediately when the scope is already aborted. Returns `false` when
/// `ctx` has no cancellation scope, in which case `listener` is dropped.
pub fn on_ctx_abort(ctx: &Ctx, listener: impl FnOnce(AbortError) + Send + 'static) -> bool {
    match ctx.controller() {
        Some(controller) => {
            controller.on_abort(listener);
            true
        }
        None => false,
    }
}
