//! Reactive Primitives
//!
//! This module implements the reactive engine: atoms, actions, the context
//! that holds their caches, and the lifecycle and effect machinery around it.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An [`Atom`] is a state cell. A mutable atom holds a value; a computed atom
//! derives one from the atoms it reads through [`Ctx::spy`]. Reads made by a
//! computation are tracked per run, so dependency sets follow control flow.
//!
//! ## Actions
//!
//! An [`Action`] is an event cell. Its state is the list of calls made within
//! the current transaction, which computed atoms can iterate.
//!
//! ## Contexts and transactions
//!
//! A [`Ctx`] is an isolated graph instance. Every write joins or opens a
//! transaction; all writes of one transaction are propagated together and
//! every listener is notified once with the settled state.
//!
//! ## Lifecycle
//!
//! An atom is connected while something observes it. [`on_connect`] and
//! [`on_disconnect`] bracket that period, with an [`AbortController`] that
//! cancels the work started by the connect hook. [`control_connection`]
//! lets an observer drop and restore its connection without unsubscribing.
//!
//! # Implementation Notes
//!
//! Edges are stored per context in the cache of each node and sub edges are
//! only maintained for connected nodes. Writes push changes to connected
//! dependents; unconnected computed atoms pull and re-validate when read.

mod abort;
mod action;
mod atom;
mod connection;
mod context;
mod effects;
mod lifecycle;
mod subscription;
mod tracking;
mod transaction;

pub use abort::{on_ctx_abort, AbortController, AbortError, Cause};
pub use action::{Action, ActionCall};
pub use atom::{Atom, Proto, Readable};
pub use connection::{control_connection, ControlledConnection};
pub use context::{Ctx, PatchInfo};
pub use effects::{take, take_call, take_nested, Scheduled};
pub use lifecycle::{is_init, on_connect, on_disconnect, on_update, remove_hook, Cleanup, HookId};
pub use subscription::Subscription;
