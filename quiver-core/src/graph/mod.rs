//! Dependency Graph
//!
//! This module holds the data layer of the reactive graph: node identity, the
//! per-context caches ("patches") and the store that owns them, and the effect
//! queues drained at commit.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are mutable atoms, computed atoms and actions
//! - Edges are dependencies: a computed patch lists the pubs it read during its
//!   latest run, and each connected pub lists that computed node in its subs
//!
//! # Design Decisions
//!
//! 1. Edges live in the per-context patch, not on the shared handle, so two
//!    contexts never observe each other's dependency sets.
//!
//! 2. Sub edges are only kept while the dependent is connected. A computed
//!    atom nobody observes re-validates its pubs when read instead of being
//!    pushed to.
//!
//! 3. The store journals every patch mutation made inside a transaction so a
//!    failed segment can be rolled back to its last good state.

mod node;
mod patch;
mod scheduler;
mod store;

pub use node::{NodeId, NodeKind};
pub use patch::{ListenerId, Value};
pub use scheduler::Priority;

pub(crate) use patch::{ListenerEntry, ListenerFn, Patch, Pub, Pubs};
pub(crate) use scheduler::Job;
pub(crate) use store::{Connection, LogFn, Store};
