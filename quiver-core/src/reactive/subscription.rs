//! Subscription guard.

use std::fmt;
use std::sync::Arc;

use super::atom::Proto;
use super::context::Ctx;
use crate::error::Result;
use crate::graph::ListenerId;

/// What a subscription listens to.
enum Target {
    Atom(Arc<Proto>),
    Log,
}

/// A listener attached with [`Ctx::subscribe`] or [`Ctx::subscribe_log`].
///
/// Dropping the guard unsubscribes. The last unsubscribe of an atom
/// disconnects it and every dependency nothing else observes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    ctx: Ctx,
    target: Target,
    id: Option<ListenerId>,
}

impl Subscription {
    pub(crate) fn new(ctx: Ctx, proto: Arc<Proto>, id: ListenerId) -> Self {
        Self {
            ctx,
            target: Target::Atom(proto),
            id: Some(id),
        }
    }

    pub(crate) fn log(ctx: Ctx, id: ListenerId) -> Self {
        Self {
            ctx,
            target: Target::Log,
            id: Some(id),
        }
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        self.id
    }

    /// Remove the listener now, reporting failures that `Drop` can only log.
    pub fn unsubscribe(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self.remove(id),
            None => Ok(()),
        }
    }

    /// Keep the listener attached for the lifetime of the context.
    pub fn detach(mut self) {
        self.id = None;
    }

    fn remove(&self, id: ListenerId) -> Result<()> {
        match &self.target {
            Target::Atom(proto) => self.ctx.detach_listener(proto, id).map(|_| ()),
            Target::Log => {
                self.ctx.detach_log_listener(id);
                Ok(())
            }
        }
    }

    fn target_name(&self) -> &str {
        match &self.target {
            Target::Atom(proto) => proto.name(),
            Target::Log => "log",
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(error) = self.remove(id) {
                tracing::warn!(subscription = %self.target_name(), %error, "failed to unsubscribe");
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("ctx", &self.ctx.id())
            .field("target", &self.target_name())
            .field("active", &self.id.is_some())
            .finish()
    }
}
