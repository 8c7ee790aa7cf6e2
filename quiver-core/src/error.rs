//! Error types for the reactive engine.

use thiserror::Error;

use crate::reactive::AbortError;

/// Errors raised by contexts, atoms, actions and scheduled effects.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// `spy` was called on a context that is not running a computation.
    #[error("`spy` of `{atom}` called outside of a computation")]
    SpyOutsideComputation { atom: String },

    /// A write targeted a derived atom.
    #[error("`{atom}` is derived and cannot be written")]
    ReadOnly { atom: String },

    /// A context was entered while another context's transaction is running
    /// on the same thread.
    #[error("context {entered} entered during a transaction of context {active}")]
    CrossContext { active: u64, entered: u64 },

    /// `retry` was called on an action that was never called in this context.
    #[error("action `{action}` has no cached call params to retry")]
    NoRetryParams { action: String },

    /// Commit kept producing new work past the configured bound.
    #[error("recomputation diverged: commit of `{atom}` exceeded {rounds} rounds")]
    Diverged { atom: String, rounds: usize },

    /// A computed atom reached itself again while it was being computed.
    #[error("dependency cycle through `{atom}`")]
    Cycle { atom: String },

    /// A cached state did not have the type its handle declares.
    #[error("state of `{atom}` has an unexpected type")]
    TypeMismatch { atom: String },

    /// A user computation, handler or effect failed.
    #[error("{message}")]
    Failed { message: String },

    /// The work was cancelled through its abort scope.
    #[error(transparent)]
    Aborted(#[from] AbortError),

    /// A scheduled effect was dropped before it ran, usually because the
    /// transaction that scheduled it was rolled back.
    #[error("scheduled effect was dropped before it ran")]
    EffectDropped,

    /// An async effect was scheduled outside of a tokio runtime.
    #[error("no tokio runtime available to run `{effect}`")]
    NoRuntime { effect: String },
}

impl ReactiveError {
    /// Build a user-level failure from any displayable error.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;
