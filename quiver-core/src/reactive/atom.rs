//! Atom Implementation
//!
//! An atom is the fundamental reactive cell. It is described once by an
//! [`Atom`] handle and gets one cache per [`Ctx`] it is used in.
//!
//! # Kinds
//!
//! - A **mutable** atom holds a value written with [`Atom::set`] or
//!   [`Atom::update`].
//!
//! - A **computed** atom derives its state from a pure computer. Every
//!   dependency the computer reads through [`Ctx::spy`] becomes a pub of the
//!   cache; the set is rebuilt on every run, so conditional reads produce
//!   conditional dependencies.
//!
//! # Equality
//!
//! A new state that compares equal to the cached one is dropped: the cache
//! keeps its version and dependents are not recomputed. Equality defaults to
//! `PartialEq` and can be replaced with [`Atom::with_equality`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::context::Ctx;
use super::lifecycle::HookRegistry;
use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, NodeKind, Value};

pub(crate) type Computer = Arc<dyn Fn(&Ctx, Option<&Value>) -> Result<Value> + Send + Sync>;
pub(crate) type Equality = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
pub(crate) type Init = Arc<dyn Fn(&Ctx) -> Result<Value> + Send + Sync>;

/// Immutable node descriptor shared by every clone of a handle.
///
/// Opaque outside the crate; reachable through [`Readable::proto`].
pub struct Proto {
    pub(crate) id: NodeId,
    pub(crate) name: Arc<str>,
    pub(crate) kind: NodeKind,
    /// Initial state of mutable atoms, the empty call list of actions and
    /// the seed `prev` of computed atoms built with `with_init`.
    pub(crate) init: Option<Init>,
    pub(crate) computer: Option<Computer>,
    pub(crate) is_equal: Equality,
    /// Number of calls in an action state.
    pub(crate) calls_len: Option<fn(&Value) -> usize>,
    pub(crate) hooks: HookRegistry,
}

impl Proto {
    pub(crate) fn new(kind: NodeKind, is_equal: Equality) -> Self {
        let id = NodeId::new();
        Self {
            id,
            name: Arc::from(format!("{}{}", kind.label(), id)),
            kind,
            init: None,
            computer: None,
            is_equal,
            calls_len: None,
            hooks: HookRegistry::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

impl fmt::Debug for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proto")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Anything a context can read: atoms and actions.
pub trait Readable {
    /// What a read returns.
    type State: Clone + Send + Sync + 'static;

    fn proto(&self) -> &Arc<Proto>;

    /// Decode a cached state.
    fn decode(proto: &Proto, value: &Value) -> Result<Self::State>;

    /// Decode a state read by `spy`, given what the same computation read
    /// earlier in this transaction.
    fn decode_spied(proto: &Proto, value: &Value, _earlier: Option<&Value>) -> Result<Self::State> {
        Self::decode(proto, value)
    }

    fn id(&self) -> NodeId {
        self.proto().id
    }

    fn name(&self) -> &str {
        &self.proto().name
    }
}

pub(crate) fn downcast<T: Clone + 'static>(proto: &Proto, value: &Value) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| ReactiveError::TypeMismatch {
            atom: proto.name.to_string(),
        })
}

fn partial_eq<T: PartialEq + 'static>() -> Equality {
    Arc::new(|a: &Value, b: &Value| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    })
}

/// A reactive state cell holding a `T`.
///
/// Handles are cheap to clone; clones share identity and hooks.
///
/// # Example
///
/// ```rust
/// use quiver_core::{Atom, Ctx};
///
/// let ctx = Ctx::new();
/// let count = Atom::new(1).named("count");
/// let doubled = Atom::computed({
///     let count = count.clone();
///     move |ctx, _prev| Ok(ctx.spy(&count)? * 2)
/// });
///
/// assert_eq!(ctx.get(&doubled).unwrap(), 2);
/// count.set(&ctx, 5).unwrap();
/// assert_eq!(ctx.get(&doubled).unwrap(), 10);
/// ```
pub struct Atom<T> {
    proto: Arc<Proto>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Atom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a mutable atom with the given initial value.
    pub fn new(initial: T) -> Self {
        let mut proto = Proto::new(NodeKind::Mutable, partial_eq::<T>());
        proto.init = Some(Arc::new(move |_: &Ctx| Ok(Arc::new(initial.clone()) as Value)));
        Self::from_proto(proto)
    }

    /// Create a derived atom.
    ///
    /// The computer receives a tracking context and the previous state (on
    /// first run, `None`).
    pub fn computed<F>(computer: F) -> Self
    where
        F: Fn(&Ctx, Option<&T>) -> Result<T> + Send + Sync + 'static,
    {
        let mut proto = Proto::new(NodeKind::Computed, partial_eq::<T>());
        proto.computer = Some(Arc::new(move |ctx: &Ctx, prev: Option<&Value>| {
            let prev = prev.and_then(|value| value.downcast_ref::<T>());
            computer(ctx, prev).map(|state| Arc::new(state) as Value)
        }));
        Self::from_proto(proto)
    }
}

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from_proto(proto: Proto) -> Self {
        Self {
            proto: Arc::new(proto),
            _marker: PhantomData,
        }
    }

    /// Set the display name. Call before the handle is cloned or used.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        match Arc::get_mut(&mut self.proto) {
            Some(proto) => proto.name = Arc::from(name),
            None => tracing::warn!(atom = %self.proto.name, %name, "atom already shared, name ignored"),
        }
        self
    }

    /// Replace the equality used to detect state changes. Call before the
    /// handle is cloned or used.
    pub fn with_equality<F>(mut self, is_equal: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let equality: Equality = Arc::new(move |a: &Value, b: &Value| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => is_equal(a, b),
                _ => false,
            }
        });
        match Arc::get_mut(&mut self.proto) {
            Some(proto) => proto.is_equal = equality,
            None => tracing::warn!(atom = %self.proto.name, "atom already shared, equality ignored"),
        }
        self
    }

    /// Compute the initial state from the context that first reads the
    /// atom, replacing the value given to [`Atom::new`]. For a computed atom
    /// the result is the `prev` of its first run. Call before the handle is
    /// cloned or used.
    ///
    /// The initializer runs untracked and once per cache, so an evicted
    /// cache runs it again.
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&Ctx) -> Result<T> + Send + Sync + 'static,
    {
        let init: Init = Arc::new(move |ctx: &Ctx| init(ctx).map(|state| Arc::new(state) as Value));
        match Arc::get_mut(&mut self.proto) {
            Some(proto) => proto.init = Some(init),
            None => tracing::warn!(atom = %self.proto.name, "atom already shared, init ignored"),
        }
        self
    }

    pub fn id(&self) -> NodeId {
        self.proto.id
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }

    pub fn kind(&self) -> NodeKind {
        self.proto.kind
    }

    pub fn is_computed(&self) -> bool {
        self.proto.kind == NodeKind::Computed
    }

    #[cfg(test)]
    pub(crate) fn proto_arc(&self) -> Arc<Proto> {
        Arc::clone(&self.proto)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.proto.kind.is_writable() {
            Ok(())
        } else {
            Err(ReactiveError::ReadOnly {
                atom: self.proto.name.to_string(),
            })
        }
    }

    /// Write a new value, joining the active transaction or opening one.
    pub fn set(&self, ctx: &Ctx, value: T) -> Result<()> {
        self.ensure_writable()?;
        ctx.transact(|ctx| ctx.write(&self.proto, Arc::new(value)))
    }

    /// Write a value derived from the current one and return it.
    pub fn update<F>(&self, ctx: &Ctx, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T,
    {
        self.ensure_writable()?;
        ctx.transact(|ctx| {
            let current = ctx.get(self)?;
            let next = f(&current);
            ctx.write(&self.proto, Arc::new(next.clone()))?;
            Ok(next)
        })
    }
}

impl<T> Readable for Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    type State = T;

    fn proto(&self) -> &Arc<Proto> {
        &self.proto
    }

    fn decode(proto: &Proto, value: &Value) -> Result<T> {
        downcast::<T>(proto, value)
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            proto: Arc::clone(&self.proto),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.proto.id)
            .field("name", &self.proto.name)
            .field("kind", &self.proto.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn atom_get_and_set() {
        let ctx = Ctx::new();
        let atom = Atom::new(0);
        assert_eq!(ctx.get(&atom).unwrap(), 0);

        atom.set(&ctx, 42).unwrap();
        assert_eq!(ctx.get(&atom).unwrap(), 42);
    }

    #[test]
    fn atom_update_returns_new_value() {
        let ctx = Ctx::new();
        let atom = Atom::new(10);
        assert_eq!(atom.update(&ctx, |v| v + 5).unwrap(), 15);
        assert_eq!(ctx.get(&atom).unwrap(), 15);
    }

    #[test]
    fn contexts_are_isolated() {
        let ctx1 = Ctx::new();
        let ctx2 = Ctx::new();
        let atom = Atom::new(0);

        atom.set(&ctx1, 7).unwrap();
        assert_eq!(ctx1.get(&atom).unwrap(), 7);
        assert_eq!(ctx2.get(&atom).unwrap(), 0);
    }

    #[test]
    fn computed_is_lazy_and_cached() {
        let runs = Arc::new(AtomicI32::new(0));
        let counter = Arc::clone(&runs);
        let ctx = Ctx::new();
        let computed = Atom::computed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.get(&computed).unwrap(), 42);
        assert_eq!(ctx.get(&computed).unwrap(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn computed_receives_previous_state() {
        let ctx = Ctx::new();
        let source = Atom::new(1);
        let history = Atom::computed({
            let source = source.clone();
            move |ctx, prev: Option<&Vec<i32>>| {
                let mut seen = prev.cloned().unwrap_or_default();
                seen.push(ctx.spy(&source)?);
                Ok(seen)
            }
        });

        assert_eq!(ctx.get(&history).unwrap(), vec![1]);
        source.set(&ctx, 2).unwrap();
        assert_eq!(ctx.get(&history).unwrap(), vec![1, 2]);
    }

    #[test]
    fn computed_atoms_are_read_only() {
        let ctx = Ctx::new();
        let computed = Atom::computed(|_, _| Ok(1)).named("derived");
        let err = computed.set(&ctx, 2).unwrap_err();
        assert!(matches!(err, ReactiveError::ReadOnly { ref atom } if atom == "derived"));
    }

    #[test]
    fn names_and_ids() {
        let a = Atom::new(0).named("first");
        let b = Atom::new(0);
        assert_eq!(a.name(), "first");
        assert!(b.name().starts_with("atom#"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn with_init_replaces_the_initial_value() {
        let ctx = Ctx::new();
        let offset = Atom::new(100);
        let atom = Atom::new(0).with_init({
            let offset = offset.clone();
            move |ctx| Ok(ctx.get(&offset)? + 23)
        });

        assert_eq!(ctx.get(&atom).unwrap(), 123);
        offset.set(&ctx, 0).unwrap();
        assert_eq!(ctx.get(&atom).unwrap(), 123);
        assert!(ctx.inspect(&atom).unwrap().pubs.is_empty());
    }

    #[test]
    fn with_init_seeds_the_first_run_of_a_computed_atom() {
        let ctx = Ctx::new();
        let source = Atom::new(1);
        let sum = Atom::computed({
            let source = source.clone();
            move |ctx, prev: Option<&i32>| Ok(prev.copied().unwrap_or(0) + ctx.spy(&source)?)
        })
        .with_init(|_| Ok(10));

        assert_eq!(ctx.get(&sum).unwrap(), 11);
        source.set(&ctx, 2).unwrap();
        assert_eq!(ctx.get(&sum).unwrap(), 13);
    }

    #[test]
    fn failing_init_leaves_no_cache() {
        let ctx = Ctx::new();
        let atom = Atom::new(0).with_init(|_| Err(ReactiveError::failed("no seed")));
        assert!(ctx.get(&atom).is_err());
        assert!(ctx.inspect(&atom).is_none());
    }

    #[test]
    fn custom_equality_suppresses_changes() {
        let ctx = Ctx::new();
        let atom = Atom::new(1.0_f64).with_equality(|a, b| (a - b).abs() < 0.5);
        ctx.get(&atom).unwrap();
        let before = ctx.inspect(&atom).unwrap().version;

        atom.set(&ctx, 1.2).unwrap();
        assert_eq!(ctx.get(&atom).unwrap(), 1.0);
        assert_eq!(ctx.inspect(&atom).unwrap().version, before);

        atom.set(&ctx, 2.0).unwrap();
        assert_eq!(ctx.get(&atom).unwrap(), 2.0);
    }
}
