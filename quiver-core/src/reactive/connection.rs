//! Controlled Connection
//!
//! [`control_connection`] wraps a readable in a computed atom that follows it
//! only while a switch is on. Turning the switch off drops the dependency, so
//! the wrapped node disconnects even though the wrapper stays subscribed; the
//! wrapper keeps the last state it saw until the switch is turned back on.

use std::fmt;
use std::sync::Arc;

use super::action::Action;
use super::atom::{Atom, Proto, Readable};
use super::context::Ctx;
use crate::error::Result;
use crate::graph::Value;

/// A readable whose connection to its source can be switched off and on.
///
/// Built by [`control_connection`].
pub struct ControlledConnection<T> {
    atom: Atom<T>,
    active: Atom<bool>,
    toggle: Action<Option<bool>, bool>,
}

/// Wrap `target` so its connection can be toggled, starting connected if
/// `initially` is set.
///
/// # Example
///
/// ```rust
/// use quiver_core::{control_connection, Atom, Ctx};
///
/// let ctx = Ctx::new();
/// let feed = Atom::new(1).named("feed");
/// let controlled = control_connection(&feed, true);
///
/// let _sub = ctx.subscribe(&controlled, |_| {}).unwrap();
/// assert!(ctx.is_connected(&feed));
///
/// controlled.set_connected(&ctx, false).unwrap();
/// feed.set(&ctx, 2).unwrap();
/// assert!(!ctx.is_connected(&feed));
/// assert_eq!(ctx.get(&controlled).unwrap(), 1);
/// ```
pub fn control_connection<R>(target: &R, initially: bool) -> ControlledConnection<R::State>
where
    R: Readable + Clone + Send + Sync + 'static,
    R::State: PartialEq,
{
    let name = format!("{}.controlled", target.name());
    let active = Atom::new(initially).named(format!("{name}.active"));

    let toggle = Action::new({
        let active = active.clone();
        move |ctx: &Ctx, value: Option<bool>| active.update(ctx, |state| value.unwrap_or(!*state))
    })
    .named(format!("{name}.toggle"));

    let atom = Atom::computed({
        let active = active.clone();
        let target = target.clone();
        move |ctx, prev: Option<&R::State>| {
            if ctx.spy(&active)? {
                return ctx.spy(&target);
            }
            match prev {
                Some(state) => Ok(state.clone()),
                None => ctx.get(&target),
            }
        }
    })
    .named(name);

    ControlledConnection { atom, active, toggle }
}

impl<T> ControlledConnection<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Flip the switch. Returns the new setting.
    pub fn toggle(&self, ctx: &Ctx) -> Result<bool> {
        self.toggle.call(ctx, None)
    }

    /// Set the switch. Returns the new setting.
    pub fn set_connected(&self, ctx: &Ctx, connected: bool) -> Result<bool> {
        self.toggle.call(ctx, Some(connected))
    }

    pub fn is_active(&self, ctx: &Ctx) -> Result<bool> {
        ctx.get(&self.active)
    }

    /// The wrapping computed atom.
    pub fn atom(&self) -> &Atom<T> {
        &self.atom
    }

    /// The action behind [`ControlledConnection::toggle`], for hooks and
    /// `take_call`.
    pub fn toggle_action(&self) -> &Action<Option<bool>, bool> {
        &self.toggle
    }
}

impl<T> Readable for ControlledConnection<T>
where
    T: Clone + Send + Sync + 'static,
{
    type State = T;

    fn proto(&self) -> &Arc<Proto> {
        self.atom.proto()
    }

    fn decode(proto: &Proto, value: &Value) -> Result<T> {
        Atom::<T>::decode(proto, value)
    }
}

impl<T> Clone for ControlledConnection<T> {
    fn clone(&self) -> Self {
        Self {
            atom: self.atom.clone(),
            active: self.active.clone(),
            toggle: self.toggle.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for ControlledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledConnection")
            .field("atom", &self.atom.name())
            .finish()
    }
}
