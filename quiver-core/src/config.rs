//! Context configuration.

use serde::{Deserialize, Serialize};

/// How late effects are executed once their transaction has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateEffects {
    /// Run before the entry point that opened the transaction returns.
    #[default]
    Immediate,

    /// Keep queued until [`Ctx::flush_late`](crate::Ctx::flush_late).
    Deferred,

    /// Flush from a tokio task after yielding once, batching the late effects
    /// of every transaction that closes before the task runs. Behaves like
    /// `Immediate` outside a runtime.
    Spawn,
}

/// Tunables of a [`Ctx`](crate::Ctx).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtxConfig {
    /// Maximum number of commit rounds (hooks, listeners, near effects) a
    /// single transaction may run before it fails as diverged.
    pub max_commit_rounds: usize,

    /// Execution mode of late effects.
    pub late_effects: LateEffects,

    /// Maximum number of late-effect batches one drain may run. Late effects
    /// scheduled by a late effect form the next batch.
    pub max_late_rounds: usize,
}

impl Default for CtxConfig {
    fn default() -> Self {
        Self {
            max_commit_rounds: 100,
            late_effects: LateEffects::Immediate,
            max_late_rounds: 100_000,
        }
    }
}

impl CtxConfig {
    pub fn with_max_commit_rounds(mut self, rounds: usize) -> Self {
        self.max_commit_rounds = rounds;
        self
    }

    pub fn with_late_effects(mut self, mode: LateEffects) -> Self {
        self.late_effects = mode;
        self
    }

    pub fn with_max_late_rounds(mut self, rounds: usize) -> Self {
        self.max_late_rounds = rounds;
        self
    }
}
