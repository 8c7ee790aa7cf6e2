//! Dependency Tracking
//!
//! Two pieces of bookkeeping support `spy`:
//!
//! - A [`SpyFrame`] is owned by one running computation. Every `spy` appends
//!   the dependency it read; when the computation finishes, the collected list
//!   replaces the cache's previous pubs.
//!
//! - A thread-local stack of active context ids. Entering a context pushes its
//!   id; entering a *different* context while one is active on the same thread
//!   is rejected, so no computation ever reads caches of two graphs.

use std::cell::RefCell;
use std::sync::Arc;

use super::atom::Proto;
use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, Pub, Pubs};

thread_local! {
    static ACTIVE: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the active context when dropped.
pub(crate) struct ActiveGuard {
    ctx_id: u64,
}

impl ActiveGuard {
    /// Mark `ctx_id` active on this thread.
    ///
    /// Re-entering the context on top of the stack is allowed.
    pub fn enter(ctx_id: u64) -> Result<Self> {
        ACTIVE.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(&active) if active != ctx_id => Err(ReactiveError::CrossContext {
                    active,
                    entered: ctx_id,
                }),
                _ => {
                    stack.push(ctx_id);
                    Ok(Self { ctx_id })
                }
            }
        })
    }

    /// Id of the innermost active context, if any.
    #[cfg(test)]
    pub fn current() -> Option<u64> {
        ACTIVE.with(|stack| stack.borrow().last().copied())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.ctx_id), "active context stack mismatch");
        });
    }
}

/// Dependencies collected by one run of a computer.
pub(crate) struct SpyFrame {
    owner: Arc<Proto>,
    /// Pubs of the previous successful run, used for change detection.
    previous: Pubs,
    next: Pubs,
    /// Set once the computer has returned.
    closed: bool,
}

impl SpyFrame {
    pub fn new(owner: Arc<Proto>, previous: Pubs) -> Self {
        Self {
            owner,
            previous,
            next: Pubs::new(),
            closed: false,
        }
    }

    /// Stop accepting reads. Contexts the computer kept past its return see
    /// the frame as gone.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn owner(&self) -> &Arc<Proto> {
        &self.owner
    }

    /// What the previous run read from `id`.
    pub fn previous(&self, id: NodeId) -> Option<&Pub> {
        self.previous.iter().find(|pub_| pub_.id() == id)
    }

    /// Append a dependency unless this run already read it.
    pub fn record(&mut self, dependency: Pub) -> bool {
        if self.next.iter().any(|pub_| pub_.id() == dependency.id()) {
            return false;
        }
        self.next.push(dependency);
        true
    }

    pub fn recorded(&self) -> Pubs {
        self.next.clone()
    }

    pub fn finish(self) -> Pubs {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Atom;

    #[test]
    fn nested_enter_of_the_same_context_is_allowed() {
        let outer = ActiveGuard::enter(7).unwrap();
        let inner = ActiveGuard::enter(7).unwrap();
        assert_eq!(ActiveGuard::current(), Some(7));
        drop(inner);
        drop(outer);
        assert_eq!(ActiveGuard::current(), None);
    }

    #[test]
    fn entering_another_context_is_rejected() {
        let _outer = ActiveGuard::enter(1).unwrap();
        let err = ActiveGuard::enter(2).err().unwrap();
        assert!(matches!(err, ReactiveError::CrossContext { active: 1, entered: 2 }));
        assert_eq!(ActiveGuard::current(), Some(1));
    }

    #[test]
    fn frame_deduplicates_reads() {
        let owner = Atom::computed(|_, _| Ok(0)).proto_arc();
        let dep = Atom::new(1);
        let read = Pub {
            proto: dep.proto_arc(),
            version: 1,
            state: Arc::new(1),
            tx_id: 1,
        };

        let mut frame = SpyFrame::new(owner, Pubs::new());
        assert!(frame.record(read.clone()));
        assert!(!frame.record(read));
        assert_eq!(frame.finish().len(), 1);
    }

    #[test]
    fn closed_frame_reports_closed() {
        let owner = Atom::computed(|_, _| Ok(0)).proto_arc();
        let mut frame = SpyFrame::new(owner, Pubs::new());
        assert!(!frame.is_closed());
        frame.close();
        assert!(frame.is_closed());
    }
}
