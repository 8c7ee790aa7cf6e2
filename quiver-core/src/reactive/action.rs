//! Action Implementation
//!
//! An action is an event cell. Calling it runs its handler and appends a
//! `{ params, payload }` record to the action's state for the current
//! transaction. A computed atom that spies the action sees every call of the
//! transaction, so several calls coalesced into one notification round are
//! still observed one by one.
//!
//! Call lists do not outlive their transaction: reading an action in a later
//! transaction yields an empty list.

use std::fmt;
use std::sync::Arc;

use super::atom::{downcast, Proto, Readable};
use super::context::Ctx;
use super::lifecycle::HookId;
use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, NodeKind, Value};

/// One call of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall<P, R> {
    pub params: P,
    pub payload: R,
}

type Handler<P, R> = Arc<dyn Fn(&Ctx, P) -> Result<R> + Send + Sync>;

fn calls_len<P: 'static, R: 'static>(value: &Value) -> usize {
    value
        .downcast_ref::<Vec<ActionCall<P, R>>>()
        .map_or(0, Vec::len)
}

/// An event cell taking `P` and producing `R`.
///
/// Several params are passed as a tuple.
///
/// # Example
///
/// ```rust
/// use quiver_core::{Action, Atom, Ctx};
///
/// let ctx = Ctx::new();
/// let add = Action::new(|_ctx: &Ctx, amount: i32| Ok(amount)).named("add");
/// let total = Atom::computed({
///     let add = add.clone();
///     move |ctx, prev: Option<&i32>| {
///         let calls = ctx.spy(&add)?;
///         Ok(prev.copied().unwrap_or(0) + calls.iter().map(|c| c.payload).sum::<i32>())
///     }
/// });
///
/// let _sub = ctx.subscribe(&total, |_| {}).unwrap();
/// add.call(&ctx, 2).unwrap();
/// add.call(&ctx, 3).unwrap();
/// assert_eq!(ctx.get(&total).unwrap(), 5);
/// ```
pub struct Action<P, R> {
    proto: Arc<Proto>,
    handler: Handler<P, R>,
}

impl<P, R> Action<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Ctx, P) -> Result<R> + Send + Sync + 'static,
    {
        // Call lists are replaced on every call and never compare equal.
        let mut proto = Proto::new(NodeKind::Action, Arc::new(|_: &Value, _: &Value| false));
        proto.init = Some(Arc::new(|_: &Ctx| Ok(Arc::new(Vec::<ActionCall<P, R>>::new()) as Value)));
        proto.calls_len = Some(calls_len::<P, R>);
        Self {
            proto: Arc::new(proto),
            handler: Arc::new(handler),
        }
    }

    /// Set the display name. Call before the handle is cloned or used.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        match Arc::get_mut(&mut self.proto) {
            Some(proto) => proto.name = Arc::from(name),
            None => tracing::warn!(action = %self.proto.name, %name, "action already shared, name ignored"),
        }
        self
    }

    pub fn id(&self) -> NodeId {
        self.proto.id
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }

    /// Invoke the action and return its payload.
    ///
    /// The handler runs with a context caused by this call; effects it
    /// schedules inherit that cause.
    pub fn call(&self, ctx: &Ctx, params: P) -> Result<R> {
        ctx.transact(|ctx| {
            let scoped = ctx.caused_by(&self.proto);
            let payload = (self.handler)(&scoped, params.clone())?;
            let call = ActionCall {
                params: params.clone(),
                payload: payload.clone(),
            };
            ctx.record_call(&self.proto, scoped.cause(), Arc::new(params), move |current| {
                let mut calls = current
                    .and_then(|value| value.downcast_ref::<Vec<ActionCall<P, R>>>())
                    .cloned()
                    .unwrap_or_default();
                calls.push(call);
                Arc::new(calls) as Value
            })?;
            Ok(payload)
        })
    }

    /// Repeat the latest call made in `ctx` with the same params.
    pub fn retry(&self, ctx: &Ctx) -> Result<R> {
        let params = ctx
            .last_params(&self.proto)
            .ok_or_else(|| ReactiveError::NoRetryParams {
                action: self.proto.name.to_string(),
            })?;
        let params = downcast::<P>(&self.proto, &params)?;
        self.call(ctx, params)
    }

    /// Register a hook fired once per call with `(ctx, payload, params)`.
    pub fn on_call<F>(&self, hook: F) -> HookId
    where
        F: Fn(&Ctx, &R, &P) + Send + Sync + 'static,
    {
        self.proto.hooks.add_call(Arc::new(move |ctx: &Ctx, state: &Value, index: usize| {
            let call = state
                .downcast_ref::<Vec<ActionCall<P, R>>>()
                .and_then(|calls| calls.get(index));
            if let Some(call) = call {
                hook(ctx, &call.payload, &call.params);
            }
        }))
    }
}

impl<P, R> Readable for Action<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type State = Vec<ActionCall<P, R>>;

    fn proto(&self) -> &Arc<Proto> {
        &self.proto
    }

    fn decode(proto: &Proto, value: &Value) -> Result<Self::State> {
        downcast::<Self::State>(proto, value)
    }

    /// Only the calls appended since the same computation's earlier read.
    fn decode_spied(proto: &Proto, value: &Value, earlier: Option<&Value>) -> Result<Self::State> {
        let calls = Self::decode(proto, value)?;
        match earlier.map(calls_len::<P, R>) {
            Some(seen) if seen <= calls.len() => Ok(calls[seen..].to_vec()),
            _ => Ok(calls),
        }
    }
}

impl<P, R> Clone for Action<P, R> {
    fn clone(&self) -> Self {
        Self {
            proto: Arc::clone(&self.proto),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<P, R> fmt::Debug for Action<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.proto.id)
            .field("name", &self.proto.name)
            .finish()
    }
}
