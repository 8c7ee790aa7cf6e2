//! Quiver Core
//!
//! This crate provides the engine of the Quiver fine-grained reactive state
//! graph. It implements:
//!
//! - State cells (atoms) and event cells (actions)
//! - Dynamic dependency tracking with `spy`
//! - Transactional, glitch-free propagation
//! - A connect/disconnect lifecycle for observed atoms
//! - Near and late scheduled effects with causal cancellation
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: atoms, actions, contexts, hooks and effects
//! - `graph`: node identity, per-context caches and the effect queues
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use quiver_core::{Action, Atom, Ctx};
//!
//! let ctx = Ctx::new();
//! let inc = Action::new(|_ctx: &Ctx, ()| Ok(()));
//! let count = Atom::computed({
//!     let inc = inc.clone();
//!     move |ctx, prev: Option<&usize>| Ok(prev.copied().unwrap_or(0) + ctx.spy(&inc)?.len())
//! });
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _sub = ctx.subscribe(&count, move |n| sink.lock().unwrap().push(*n)).unwrap();
//!
//! ctx.transact(|ctx| {
//!     inc.call(ctx, ())?;
//!     inc.call(ctx, ())
//! })
//! .unwrap();
//!
//! assert_eq!(*seen.lock().unwrap(), vec![0, 2]);
//! ```

pub mod graph;
pub mod reactive;

mod config;
mod error;

pub use config::{CtxConfig, LateEffects};
pub use error::{ReactiveError, Result};
pub use graph::{NodeId, NodeKind, Priority};
pub use reactive::{
    control_connection, is_init, on_connect, on_ctx_abort, on_disconnect, on_update, remove_hook,
    take, take_call, take_nested, AbortController, AbortError, Action, ActionCall, Atom, Cause,
    Cleanup, ControlledConnection, Ctx, HookId, PatchInfo, Readable, Scheduled, Subscription,
};
