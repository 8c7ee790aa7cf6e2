//! Effect Scheduler
//!
//! Side effects scheduled during a transaction are not run inline. They wait
//! in one of two FIFO queues until the transaction commits:
//!
//! 1. **Near** effects are flushed synchronously as part of the commit, after
//!    hooks and listeners of the same round. Writes they perform extend the
//!    running transaction. Connect and disconnect hooks are near effects.
//!
//! 2. **Late** effects run once the transaction has closed, according to the
//!    context's [`LateEffects`](crate::LateEffects) mode. Writes they perform
//!    open new transactions.
//!
//! Each queue keeps insertion order. Rolling a transaction segment back
//! truncates the queues to their length at the segment start, which drops the
//! jobs scheduled by the failed segment.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordering class of a scheduled effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Flushed synchronously right after the commit (persistence writes,
    /// lifecycle hooks).
    #[default]
    Near,

    /// Deferred until the transaction has closed (UI-visible effects).
    Late,
}

/// A queued unit of work. Dropping a job without running it signals its
/// waiter that the effect was dropped.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// The pair of FIFO queues owned by a transaction.
#[derive(Default)]
pub(crate) struct EffectQueue {
    near: VecDeque<Job>,
    late: VecDeque<Job>,
}

/// Queue lengths recorded at a savepoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueMark {
    near: usize,
    late: usize,
}

impl EffectQueue {
    pub fn push(&mut self, priority: Priority, job: Job) {
        match priority {
            Priority::Near => self.near.push_back(job),
            Priority::Late => self.late.push_back(job),
        }
    }

    /// Take every near job queued so far, in FIFO order.
    pub fn drain_near(&mut self) -> Vec<Job> {
        self.near.drain(..).collect()
    }

    /// Take every late job queued so far, in FIFO order.
    pub fn drain_late(&mut self) -> Vec<Job> {
        self.late.drain(..).collect()
    }

    #[cfg(test)]
    pub fn has_near(&self) -> bool {
        !self.near.is_empty()
    }

    pub fn mark(&self) -> QueueMark {
        QueueMark {
            near: self.near.len(),
            late: self.late.len(),
        }
    }

    /// Remove the jobs queued after `mark` and hand them back, so the caller
    /// can drop them outside its locks.
    pub fn truncate(&mut self, mark: QueueMark) -> Vec<Job> {
        let near = self.near.split_off(mark.near.min(self.near.len()));
        let late = self.late.split_off(mark.late.min(self.late.len()));
        near.into_iter().chain(late).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.near.len() + self.late.len()
    }
}

impl fmt::Debug for EffectQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectQueue")
            .field("near", &self.near.len())
            .field("late", &self.late.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Job {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(label))
    }

    #[test]
    fn queues_are_fifo_within_class() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = EffectQueue::default();

        queue.push(Priority::Late, recorder(&log, "late-1"));
        queue.push(Priority::Near, recorder(&log, "near-1"));
        queue.push(Priority::Near, recorder(&log, "near-2"));
        queue.push(Priority::Late, recorder(&log, "late-2"));

        for job in queue.drain_near() {
            job();
        }
        for job in queue.drain_late() {
            job();
        }

        assert_eq!(*log.lock().unwrap(), vec!["near-1", "near-2", "late-1", "late-2"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn truncate_drops_jobs_after_mark() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = EffectQueue::default();

        queue.push(Priority::Near, recorder(&log, "kept"));
        let mark = queue.mark();
        queue.push(Priority::Near, recorder(&log, "dropped"));
        queue.push(Priority::Late, recorder(&log, "dropped-late"));

        let dropped = queue.truncate(mark);
        assert_eq!(dropped.len(), 2);
        drop(dropped);
        assert_eq!(queue.len(), 1);
        assert!(queue.has_near());

        for job in queue.drain_near() {
            job();
        }
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    #[test]
    fn near_is_the_default_priority() {
        assert_eq!(Priority::default(), Priority::Near);
        assert!(Priority::Near < Priority::Late);
    }
}
