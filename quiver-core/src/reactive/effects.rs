//! Scheduled Effects
//!
//! Side effects never run in the middle of propagation. [`Ctx::schedule`]
//! queues a job on the active transaction (opening one if needed) and returns
//! a [`Scheduled`] handle that resolves with the job's result.
//!
//! - **Near** jobs run during commit, after listeners. Their writes extend
//!   the transaction.
//! - **Late** jobs run after the transaction has closed.
//!
//! Every job starts under the cancellation scope of the context that
//! scheduled it. A job whose scope was aborted before it ran resolves with an
//! abort error instead of running; an async job is raced against its scope
//! and resolves with an abort error as soon as the scope aborts.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::Shared;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use super::abort::AbortController;
use super::action::Action;
use super::atom::Readable;
use super::context::{Ctx, Scope};
use crate::error::{ReactiveError, Result};
use crate::graph::{Job, Priority};

/// Counts the effects scheduled under one `take_nested` call.
#[derive(Default)]
pub(crate) struct Tracker {
    pending: AtomicUsize,
    notify: Notify,
}

impl Tracker {
    fn enter(self: &Arc<Self>) -> TrackerGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        TrackerGuard(Arc::clone(self))
    }

    async fn settled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a tracked effect until it has finished (or was dropped).
struct TrackerGuard(Arc<Tracker>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

/// Result of a scheduled effect.
///
/// Resolves with the effect's result, an abort error, or
/// [`ReactiveError::EffectDropped`] when the job was discarded by a rollback.
#[must_use = "dropping a Scheduled does not cancel the effect, but its result is lost"]
pub struct Scheduled<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Scheduled<T> {
    fn failed(error: ReactiveError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }

    /// The result, if the effect has already finished.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ReactiveError::EffectDropped)),
        }
    }

    /// A cloneable handle for several awaiters.
    pub fn shared(self) -> Shared<Self>
    where
        T: Clone,
    {
        FutureExt::shared(self)
    }
}

impl<T> Future for Scheduled<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ReactiveError::EffectDropped)))
    }
}

impl Ctx {
    /// Handle for effects scheduled from this scope: same cause, no
    /// dependency frame.
    fn effect_scope(&self) -> Ctx {
        self.with_cause(self.cause())
    }

    fn enqueue(&self, priority: Priority, job: Job) -> Result<()> {
        self.transact(|ctx| {
            ctx.push_job(priority, job);
            Ok(())
        })
    }

    /// Run `effect` after the current transaction commits.
    ///
    /// Outside a transaction, a near effect runs before this returns.
    pub fn schedule<T, F>(&self, effect: F, priority: Priority) -> Scheduled<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ctx) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let guard = self.scope.tracker.as_ref().map(Tracker::enter);
        let ctx = self.effect_scope();
        let job: Job = Box::new(move || {
            let _guard = guard;
            let result = match ctx.controller().and_then(|controller| controller.reason()) {
                Some(reason) => Err(reason.into()),
                None => effect(&ctx),
            };
            let _ = tx.send(result);
        });

        match self.enqueue(priority, job) {
            Ok(()) => Scheduled { rx },
            Err(error) => Scheduled::failed(error),
        }
    }

    /// Spawn `effect` on the current tokio runtime after the transaction
    /// commits.
    ///
    /// The effect is raced against the cancellation scope it was scheduled
    /// under. Continuations re-enter the graph through the context they are
    /// given, each write opening a new transaction.
    pub fn schedule_async<T, F, Fut>(&self, effect: F, priority: Priority) -> Scheduled<T>
    where
        T: Send + 'static,
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return Scheduled::failed(ReactiveError::NoRuntime {
                effect: self.cause().name().to_string(),
            });
        };

        let (tx, rx) = oneshot::channel();
        let guard = self.scope.tracker.as_ref().map(Tracker::enter);
        let ctx = self.effect_scope();
        let job: Job = Box::new(move || {
            let controller = ctx.controller();
            if let Some(reason) = controller.as_ref().and_then(AbortController::reason) {
                let _ = tx.send(Err(reason.into()));
                return;
            }
            handle.spawn(async move {
                let _guard = guard;
                let result = match controller {
                    Some(controller) => {
                        tokio::select! {
                            biased;
                            reason = controller.aborted() => Err(reason.into()),
                            result = effect(ctx) => result,
                        }
                    }
                    None => effect(ctx).await,
                };
                let _ = tx.send(result);
            });
        });

        match self.enqueue(priority, job) {
            Ok(()) => Scheduled { rx },
            Err(error) => Scheduled::failed(error),
        }
    }
}

async fn until_aborted<T>(ctx: &Ctx, rx: oneshot::Receiver<T>) -> Result<T> {
    match ctx.controller() {
        Some(controller) => {
            tokio::select! {
                biased;
                reason = controller.aborted() => Err(reason.into()),
                value = rx => value.map_err(|_| ReactiveError::EffectDropped),
            }
        }
        None => rx.await.map_err(|_| ReactiveError::EffectDropped),
    }
}

/// Wait for the next change of `target` and return the new state.
///
/// Gives up with an abort error when the cancellation scope of `ctx` aborts.
pub async fn take<R: Readable>(ctx: &Ctx, target: &R) -> Result<R::State> {
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    let initial = AtomicBool::new(true);
    let subscription = ctx.subscribe(target, move |state: &R::State| {
        if initial.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(state.clone());
        }
    })?;

    let result = until_aborted(ctx, rx).await;
    subscription.unsubscribe()?;
    result
}

/// Wait for the next call of `action` and return its payload.
pub async fn take_call<P, R>(ctx: &Ctx, action: &Action<P, R>) -> Result<R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    let calls = take(ctx, action).await?;
    calls
        .into_iter()
        .next()
        .map(|call| call.payload)
        .ok_or(ReactiveError::EffectDropped)
}

/// Run `f` and wait until every effect it scheduled, directly or through the
/// actions it called and the effects those scheduled, has finished.
pub async fn take_nested<T, F>(ctx: &Ctx, f: F) -> Result<T>
where
    F: FnOnce(&Ctx) -> Result<T>,
{
    let tracker = Arc::new(Tracker::default());
    let scoped = ctx.derive(Scope {
        cause: ctx.cause(),
        spy: None,
        connected: ctx.scope.connected.clone(),
        tracker: Some(Arc::clone(&tracker)),
    });
    let value = scoped.transact(f)?;
    drop(scoped);

    match ctx.controller() {
        Some(controller) => {
            tokio::select! {
                biased;
                reason = controller.aborted() => Err(reason.into()),
                () = tracker.settled() => Ok(value),
            }
        }
        None => {
            tracker.settled().await;
            Ok(value)
        }
    }
}
