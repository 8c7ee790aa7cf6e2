//! Transaction Engine
//!
//! Every public entry point runs inside a transaction. The outermost entry
//! point opens it; nested entry points (writes made from hooks, listeners,
//! action handlers or near effects) join it behind a savepoint.
//!
//! # Commit
//!
//! When the outermost entry point returns, commit runs rounds of:
//!
//! 1. Propagation. Changed nodes are walked in causal order; each connected
//!    dependent is re-validated against its pubs and recomputed only when a
//!    pub's version moved. A recomputation that yields an equal state keeps
//!    the old version and stops the walk.
//! 2. Update and call hooks, over the change log.
//! 3. Listeners, over the change log, in subscription order per node.
//! 4. Near effects, FIFO.
//!
//! Work produced by a round starts another one. A transaction that is still
//! producing work after `max_commit_rounds` rounds fails as diverged and is
//! rolled back. Late effects run after the transaction has closed.
//!
//! # Late effects
//!
//! Late jobs of closed transactions join one FIFO queue drained by a single
//! loop. Jobs scheduled while the loop runs form its next batch instead of
//! running in place, so chains of late effects do not grow the stack. A drain
//! running more than `max_late_rounds` batches fails as diverged.
//!
//! # Validation
//!
//! Sources bump a context-wide epoch when written. A computed cache validated
//! at the current epoch is fresh; otherwise its pubs are actualized in read
//! order and compared by version. Unconnected computed atoms are never pushed
//! to; they re-validate when read.

use std::sync::Arc;

use indexmap::IndexSet;

use super::abort::Cause;
use super::atom::Proto;
use super::context::{Ctx, PatchInfo, Scope};
use super::lifecycle;
use super::tracking::{ActiveGuard, SpyFrame};
use crate::config::LateEffects;
use crate::error::{ReactiveError, Result};
use crate::graph::{
    Job, ListenerEntry, ListenerFn, ListenerId, LogFn, NodeId, NodeKind, Patch, Priority, Pubs, Value,
};

/// What a read of one node observed.
#[derive(Clone)]
pub(crate) struct Snapshot {
    pub state: Value,
    pub version: u64,
    pub cause: Arc<Cause>,
}

impl Snapshot {
    fn of(patch: &Patch) -> Self {
        Self {
            state: patch.state.clone(),
            version: patch.version,
            cause: Arc::clone(&patch.cause),
        }
    }
}

/// Rolls the open transaction back if its entry point unwinds.
struct OpenTx<'a> {
    ctx: &'a Ctx,
    armed: bool,
}

impl Drop for OpenTx<'_> {
    fn drop(&mut self) {
        if self.armed {
            let discarded = self.ctx.store().abort_transaction();
            discarded.release("rollback");
        }
    }
}

/// Releases the late-drain flag if a late job unwinds.
struct LateDrain<'a> {
    ctx: &'a Ctx,
    armed: bool,
}

impl Drop for LateDrain<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ctx.store().draining_late = false;
        }
    }
}

/// Marks a node as being computed.
struct Computing<'a> {
    ctx: &'a Ctx,
    id: NodeId,
}

impl Drop for Computing<'_> {
    fn drop(&mut self) {
        let mut store = self.ctx.store();
        if let Some(index) = store.computing.iter().rposition(|id| *id == self.id) {
            store.computing.remove(index);
        }
    }
}

/// Log listeners and the entries of one committed transaction.
type LogBatch = (Vec<LogFn>, Vec<PatchInfo>);

impl Ctx {
    /// Run `f` as one transaction and return its result.
    ///
    /// Called while a transaction is active, `f` joins it; if `f` fails, only
    /// what `f` did is rolled back. Called from the outside, the transaction
    /// commits after `f` and every listener sees the final state once.
    ///
    /// A failure of the late effects drained before returning is reported in
    /// place of the value.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Ctx) -> Result<T>,
    {
        let active = ActiveGuard::enter(self.inner.id)?;
        let gate = self.inner.gate.lock();

        let savepoint = self.store().savepoint();
        if let Some(savepoint) = savepoint {
            return f(self).inspect_err(|error| {
                let discarded = self.store().rollback_to(savepoint);
                tracing::debug!(
                    ctx = self.inner.id,
                    %error,
                    jobs = discarded.jobs(),
                    connections = discarded.connections(),
                    "nested segment rolled back"
                );
                discarded.release("rollback");
            });
        }

        let tx_id = self.store().begin();
        let mut open = OpenTx { ctx: self, armed: true };
        let result = f(self).and_then(|value| self.commit().map(|()| value));
        open.armed = false;

        let closed = {
            let mut store = self.store();
            match &result {
                Ok(_) => Ok(store.finish()),
                Err(_) => Err(store.abort_transaction()),
            }
        };

        let (late, log) = match closed {
            Ok(Some(mut tx)) => {
                tracing::debug!(ctx = self.inner.id, tx = tx_id, changed = tx.log.len(), "transaction committed");
                let late = tx.effects.drain_late();
                (late, self.log_batch(&tx.touched))
            }
            Ok(None) => (Vec::new(), None),
            Err(discarded) => {
                if let Err(error) = &result {
                    tracing::debug!(ctx = self.inner.id, tx = tx_id, %error, "transaction rolled back");
                }
                discarded.release("rollback");
                (Vec::new(), None)
            }
        };

        drop(gate);
        drop(active);
        if let Some((listeners, entries)) = log {
            for listener in listeners {
                listener(&entries);
            }
        }
        result.and_then(|value| self.run_late(late).map(|()| value))
    }

    fn log_batch(&self, touched: &IndexSet<NodeId>) -> Option<LogBatch> {
        if touched.is_empty() {
            return None;
        }
        let store = self.store();
        if store.log_listeners.is_empty() {
            return None;
        }
        let entries: Vec<PatchInfo> = touched
            .iter()
            .filter_map(|id| store.get(*id))
            .map(PatchInfo::of)
            .collect();
        if entries.is_empty() {
            return None;
        }
        let listeners = store.log_listeners.values().cloned().collect();
        Some((listeners, entries))
    }

    fn commit(&self) -> Result<()> {
        let limit = self.inner.config.max_commit_rounds;
        let mut rounds = 0;
        loop {
            self.propagate();
            let hooked = self.run_hooks();
            let settled = !self.has_pending();
            let notified = settled && self.notify_listeners();
            let near = if settled { self.drain_near() } else { Vec::new() };
            let flushed = !near.is_empty();
            for job in near {
                job();
            }

            if settled && !hooked && !notified && !flushed {
                return Ok(());
            }
            rounds += 1;
            if rounds > limit {
                let store = self.store();
                let atom = store
                    .tx
                    .as_ref()
                    .and_then(|tx| tx.log.last())
                    .and_then(|id| store.get(*id))
                    .map_or_else(String::new, |patch| patch.proto.name.to_string());
                tracing::error!(ctx = self.inner.id, %atom, rounds = limit, "commit diverged");
                return Err(ReactiveError::Diverged { atom, rounds: limit });
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.store().tx.as_ref().is_some_and(|tx| !tx.pending.is_empty())
    }

    fn drain_near(&self) -> Vec<Job> {
        self.store()
            .tx
            .as_mut()
            .map(|tx| tx.effects.drain_near())
            .unwrap_or_default()
    }

    fn propagate(&self) {
        loop {
            let next = self.store().pop_pending();
            let Some(id) = next else {
                return;
            };
            let subs: Vec<Arc<Proto>> = {
                let store = self.store();
                match store.get(id) {
                    Some(patch) => patch
                        .subs
                        .iter()
                        .filter_map(|sub| store.get(*sub).map(|sub| Arc::clone(&sub.proto)))
                        .collect(),
                    None => Vec::new(),
                }
            };
            for sub in subs {
                tracing::trace!(from = %id, to = %sub.id, "propagate");
                if let Err(error) = self.actualize(&sub) {
                    tracing::error!(atom = %sub.name, %error, "recomputation failed, keeping last state");
                }
            }
        }
    }

    fn run_hooks(&self) -> bool {
        let mut ran = false;
        let log = self.store().log();
        for id in log {
            let due = {
                let mut store = self.store();
                let tx_id = store.tx_id();
                let Some(patch) = store.get(id) else {
                    continue;
                };
                let proto = Arc::clone(&patch.proto);
                if !proto.hooks.has_update_or_call() {
                    continue;
                }
                let updated = patch.version != patch.hooked_version;
                let calls = match (proto.kind, proto.calls_len) {
                    (NodeKind::Action, Some(len)) if patch.tx_id == tx_id => len(&patch.state),
                    _ => 0,
                };
                let new_calls = patch.hooked_calls.min(calls)..calls;
                if !updated && new_calls.is_empty() {
                    continue;
                }
                let state = patch.state.clone();
                let cause = Arc::clone(&patch.cause);
                if let Some(patch) = store.patch_mut(id) {
                    patch.hooked_version = patch.version;
                    patch.hooked_calls = calls;
                }
                (proto, state, cause, updated, new_calls)
            };

            ran = true;
            let (proto, state, cause, updated, new_calls) = due;
            let scoped = self.with_cause(cause);
            if updated {
                for hook in proto.hooks.update_hooks() {
                    hook(&scoped, &state);
                }
            }
            for index in new_calls {
                for hook in proto.hooks.call_hooks() {
                    hook(&scoped, &state, index);
                }
            }
        }
        ran
    }

    fn notify_listeners(&self) -> bool {
        let mut ran = false;
        let log = self.store().log();
        for id in log {
            let due: Vec<(ListenerFn, Value)> = {
                let mut store = self.store();
                let stale = store
                    .get(id)
                    .is_some_and(|patch| patch.listeners.values().any(|entry| entry.seen != patch.version));
                if !stale {
                    continue;
                }
                let Some(patch) = store.patch_mut(id) else {
                    continue;
                };
                let version = patch.version;
                let state = patch.state.clone();
                patch
                    .listeners
                    .values_mut()
                    .filter(|entry| entry.seen != version)
                    .map(|entry| {
                        entry.seen = version;
                        (Arc::clone(&entry.callback), state.clone())
                    })
                    .collect()
            };
            ran |= !due.is_empty();
            for (callback, state) in due {
                callback(&state);
            }
        }
        ran
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Bring the cache of `proto` up to date and return what it holds.
    pub(crate) fn actualize(&self, proto: &Arc<Proto>) -> Result<Snapshot> {
        match proto.kind {
            NodeKind::Mutable => self.actualize_source(proto),
            NodeKind::Action => self.actualize_action(proto),
            NodeKind::Computed => self.actualize_computed(proto),
        }
    }

    /// Run the initializer of `proto` untracked, as the reader.
    fn initial_state(&self, proto: &Proto) -> Result<Value> {
        let init = proto
            .init
            .as_ref()
            .ok_or_else(|| ReactiveError::failed(format!("`{}` has no initial state", proto.name)))?;
        init(&self.with_cause(Arc::clone(&self.scope.cause)))
    }

    fn create_patch(&self, proto: &Arc<Proto>, state: Value) -> Snapshot {
        let (snapshot, displaced) = {
            let mut store = self.store();
            let version = store.next_version();
            let cause = Cause::child(&self.inner.root, proto.id, &proto.name);
            let mut patch = Patch::new(Arc::clone(proto), state, version, cause);
            patch.tx_id = store.tx_id();
            let snapshot = Snapshot::of(&patch);
            (snapshot, store.insert(patch))
        };
        drop(displaced);
        snapshot
    }

    /// Mark `proto` as being computed, failing if it already is.
    fn enter_computing(&self, proto: &Proto) -> Result<Computing<'_>> {
        let mut store = self.store();
        if store.computing.contains(&proto.id) {
            tracing::warn!(ctx = self.inner.id, atom = %proto.name, "dependency cycle");
            return Err(ReactiveError::Cycle {
                atom: proto.name.to_string(),
            });
        }
        store.computing.push(proto.id);
        Ok(Computing { ctx: self, id: proto.id })
    }

    fn actualize_source(&self, proto: &Arc<Proto>) -> Result<Snapshot> {
        let cached = self.store().get(proto.id).map(Snapshot::of);
        match cached {
            Some(snapshot) => Ok(snapshot),
            None => {
                let _computing = self.enter_computing(proto)?;
                let state = self.initial_state(proto)?;
                Ok(self.create_patch(proto, state))
            }
        }
    }

    fn actualize_action(&self, proto: &Arc<Proto>) -> Result<Snapshot> {
        let cached = {
            let store = self.store();
            let tx_id = store.tx_id();
            store
                .get(proto.id)
                .map(|patch| (Snapshot::of(patch), patch.tx_id == tx_id))
        };
        match cached {
            Some((snapshot, true)) => Ok(snapshot),
            // Calls of an earlier transaction are not visible.
            Some((snapshot, false)) => Ok(Snapshot {
                state: self.initial_state(proto)?,
                ..snapshot
            }),
            None => {
                let state = self.initial_state(proto)?;
                Ok(self.create_patch(proto, state))
            }
        }
    }

    fn actualize_computed(&self, proto: &Arc<Proto>) -> Result<Snapshot> {
        let _computing = self.enter_computing(proto)?;
        let (epoch, cached) = {
            let store = self.store();
            let cached = store
                .get(proto.id)
                .map(|patch| (patch.checked_epoch, patch.pubs.clone(), Snapshot::of(patch)));
            (store.epoch, cached)
        };
        let Some((checked_epoch, pubs, snapshot)) = cached else {
            return self.recompute(proto, &self.scope.cause);
        };
        if checked_epoch == epoch {
            return Ok(snapshot);
        }

        for read in &pubs {
            let current = self.actualize(&read.proto)?;
            if current.version != read.version {
                return self.recompute(proto, &current.cause);
            }
        }

        if let Some(patch) = self.store().patch_mut(proto.id) {
            patch.checked_epoch = epoch;
        }
        Ok(snapshot)
    }

    fn recompute(&self, proto: &Arc<Proto>, trigger: &Arc<Cause>) -> Result<Snapshot> {
        let computer = proto
            .computer
            .clone()
            .ok_or_else(|| ReactiveError::failed(format!("`{}` has no computer", proto.name)))?;
        let (prev_state, prev_pubs) = {
            let store = self.store();
            match store.get(proto.id) {
                Some(patch) => (Some(patch.state.clone()), patch.pubs.clone()),
                None => (None, Pubs::new()),
            }
        };
        let fresh = prev_state.is_none();
        let prev_state = match prev_state {
            None if proto.init.is_some() => Some(self.initial_state(proto)?),
            prev => prev,
        };

        tracing::trace!(atom = %proto.name, trigger = %trigger.name(), "recompute");
        let cause = Cause::child(trigger, proto.id, &proto.name);
        let frame = Arc::new(parking_lot::Mutex::new(SpyFrame::new(
            Arc::clone(proto),
            prev_pubs.clone(),
        )));
        let scoped = self.derive(Scope {
            cause: Arc::clone(&cause),
            spy: Some(Arc::clone(&frame)),
            connected: None,
            tracker: None,
        });
        let outcome = computer(&scoped, prev_state.as_ref());
        drop(scoped);
        frame.lock().close();
        let state = outcome?;
        let pubs = match Arc::try_unwrap(frame) {
            Ok(frame) => frame.into_inner().finish(),
            // The computer leaked its context; keep what was recorded.
            Err(shared) => shared.lock().recorded(),
        };

        // A first computation always counts as a change, seeded or not.
        let changed = match &prev_state {
            Some(prev) if !fresh => !(proto.is_equal)(prev, &state),
            _ => true,
        };

        let (snapshot, connected, displaced) = {
            let mut store = self.store();
            let epoch = store.epoch;
            let version = if changed { store.next_version() } else { 0 };
            let tx_id = store.tx_id();

            let outcome = match store.patch_mut(proto.id) {
                Some(patch) => {
                    patch.pubs = pubs.clone();
                    patch.checked_epoch = epoch;
                    if changed {
                        patch.state = state;
                        patch.version = version;
                        patch.cause = cause;
                        patch.tx_id = tx_id;
                    }
                    let snapshot = Snapshot::of(patch);
                    let connected = patch.is_connected();
                    (snapshot, connected, None)
                }
                None => {
                    let mut patch = Patch::new(Arc::clone(proto), state, version, cause);
                    patch.pubs = pubs.clone();
                    patch.checked_epoch = epoch;
                    patch.tx_id = tx_id;
                    // A first computation counts as an update.
                    patch.hooked_version = 0;
                    let snapshot = Snapshot::of(&patch);
                    (snapshot, false, store.insert(patch))
                }
            };
            if changed {
                store.record_change(proto.id);
            }
            outcome
        };
        drop(displaced);

        if connected {
            self.relink(proto.id, &prev_pubs, &pubs);
        }
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Replace the state of a source. Equal states are dropped.
    pub(crate) fn write(&self, proto: &Arc<Proto>, value: Value) -> Result<()> {
        let current = self.actualize(proto)?;
        if (proto.is_equal)(&current.state, &value) {
            return Ok(());
        }

        let mut store = self.store();
        let version = store.next_version();
        let cause = Cause::child(&self.scope.cause, proto.id, &proto.name);
        if let Some(patch) = store.patch_mut(proto.id) {
            patch.state = value;
            patch.version = version;
            patch.cause = cause;
        }
        store.epoch += 1;
        store.record_change(proto.id);
        tracing::trace!(atom = %proto.name, version, "write");
        Ok(())
    }

    /// Append a call to an action's state for the current transaction.
    pub(crate) fn record_call<B>(
        &self,
        proto: &Arc<Proto>,
        cause: Arc<Cause>,
        params: Value,
        build: B,
    ) -> Result<()>
    where
        B: FnOnce(Option<&Value>) -> Value,
    {
        self.actualize(proto)?;
        let current = {
            let store = self.store();
            let tx_id = store.tx_id();
            store
                .get(proto.id)
                .filter(|patch| patch.tx_id == tx_id)
                .map(|patch| patch.state.clone())
        };
        let state = build(current.as_ref());

        let mut store = self.store();
        let version = store.next_version();
        let tx_id = store.tx_id();
        if let Some(patch) = store.patch_mut(proto.id) {
            if patch.tx_id != tx_id {
                patch.tx_id = tx_id;
                patch.hooked_calls = 0;
            }
            patch.state = state;
            patch.version = version;
            patch.cause = cause;
            patch.last_params = Some(params);
        }
        store.epoch += 1;
        store.record_change(proto.id);
        tracing::trace!(action = %proto.name, version, "call");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Listeners and connectivity
    // -----------------------------------------------------------------------

    pub(crate) fn attach_listener(&self, proto: &Arc<Proto>, id: ListenerId, callback: ListenerFn) -> Result<()> {
        let snapshot = self.actualize(proto)?;
        let was_connected = {
            let mut store = self.store();
            let patch = store
                .patch_mut(proto.id)
                .ok_or_else(|| ReactiveError::failed(format!("`{}` has no cache", proto.name)))?;
            let was_connected = patch.is_connected();
            patch.listeners.insert(
                id,
                ListenerEntry {
                    callback: Arc::clone(&callback),
                    seen: snapshot.version,
                },
            );
            was_connected
        };
        if !was_connected {
            self.connect(proto);
        }
        callback(&snapshot.state);
        Ok(())
    }

    pub(crate) fn detach_listener(&self, proto: &Arc<Proto>, id: ListenerId) -> Result<bool> {
        self.transact(|ctx| {
            let (removed, disconnected) = {
                let mut store = ctx.store();
                match store.patch_mut(proto.id) {
                    Some(patch) => {
                        let removed = patch.listeners.shift_remove(&id);
                        let disconnected = removed.is_some() && !patch.is_connected();
                        (removed, disconnected)
                    }
                    None => (None, false),
                }
            };
            if disconnected {
                ctx.disconnect(proto);
            }
            Ok(removed.is_some())
        })
    }

    fn pub_protos(&self, id: NodeId) -> Vec<Arc<Proto>> {
        self.store()
            .get(id)
            .map(|patch| patch.pubs.iter().map(|read| Arc::clone(&read.proto)).collect())
            .unwrap_or_default()
    }

    /// Link the pubs of a node that just became connected, then queue its
    /// connect hooks. Dependencies queue theirs first.
    fn connect(&self, proto: &Arc<Proto>) {
        for dependency in self.pub_protos(proto.id) {
            self.link(proto.id, &dependency);
        }
        let ctx = self.root();
        let proto = Arc::clone(proto);
        self.push_job(Priority::Near, Box::new(move || lifecycle::run_connect(&ctx, &proto)));
    }

    /// Queue the disconnect hooks of a node that lost its last observer, then
    /// release its pubs.
    fn disconnect(&self, proto: &Arc<Proto>) {
        let ctx = self.root();
        let job_proto = Arc::clone(proto);
        self.push_job(Priority::Near, Box::new(move || lifecycle::run_disconnect(&ctx, &job_proto)));
        for dependency in self.pub_protos(proto.id) {
            self.unlink(proto.id, &dependency);
        }
    }

    fn link(&self, sub: NodeId, dependency: &Arc<Proto>) {
        let became_connected = {
            let mut store = self.store();
            let Some(patch) = store.patch_mut(dependency.id) else {
                return;
            };
            let was_connected = patch.is_connected();
            patch.subs.insert(sub);
            !was_connected
        };
        if became_connected {
            self.connect(dependency);
        }
    }

    fn unlink(&self, sub: NodeId, dependency: &Arc<Proto>) {
        let became_disconnected = {
            let mut store = self.store();
            let Some(patch) = store.patch_mut(dependency.id) else {
                return;
            };
            patch.subs.shift_remove(&sub) && !patch.is_connected()
        };
        if became_disconnected {
            self.disconnect(dependency);
        }
    }

    fn relink(&self, id: NodeId, old: &Pubs, new: &Pubs) {
        let contains = |pubs: &Pubs, dependency: NodeId| pubs.iter().any(|read| read.id() == dependency);
        for read in new.iter().filter(|read| !contains(old, read.id())) {
            self.link(id, &read.proto);
        }
        for read in old.iter().filter(|read| !contains(new, read.id())) {
            self.unlink(id, &read.proto);
        }
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    /// Queue `job` on the active transaction, or run it now if none is open.
    pub(crate) fn push_job(&self, priority: Priority, job: Job) {
        let rejected = {
            let mut store = self.store();
            match store.tx.as_mut() {
                Some(tx) => {
                    tx.effects.push(priority, job);
                    None
                }
                None => Some(job),
            }
        };
        if let Some(job) = rejected {
            job();
        }
    }

    /// Queue the late jobs of a closed transaction and run them as the
    /// configured mode says. Jobs queued while a drain is running are left to
    /// that drain.
    fn run_late(&self, jobs: Vec<Job>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let draining = {
            let mut store = self.store();
            store.late.extend(jobs);
            store.draining_late
        };
        if draining {
            return Ok(());
        }
        match self.inner.config.late_effects {
            LateEffects::Immediate => self.drain_late().map(|_| ()),
            LateEffects::Deferred => Ok(()),
            LateEffects::Spawn => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let spawn = !std::mem::replace(&mut self.store().flush_scheduled, true);
                    if spawn {
                        let ctx = self.root();
                        handle.spawn(async move {
                            tokio::task::yield_now().await;
                            if let Err(error) = ctx.flush_late() {
                                tracing::error!(ctx = ctx.id(), %error, "spawned late flush failed");
                            }
                        });
                    }
                    Ok(())
                }
                Err(_) => self.drain_late().map(|_| ()),
            },
        }
    }

    /// Run queued late jobs batch by batch until the queue stays empty.
    /// Returns how many ran, or `0` if another call is already draining.
    fn drain_late(&self) -> Result<usize> {
        {
            let mut store = self.store();
            if store.draining_late {
                return Ok(0);
            }
            store.draining_late = true;
        }
        let mut guard = LateDrain { ctx: self, armed: true };
        let limit = self.inner.config.max_late_rounds;
        let mut ran = 0;
        let mut rounds = 0;
        loop {
            let jobs = {
                let mut store = self.store();
                store.flush_scheduled = false;
                let jobs = std::mem::take(&mut store.late);
                if jobs.is_empty() {
                    // Cleared under the lock that saw the queue empty, so a
                    // job queued after this starts its own drain.
                    store.draining_late = false;
                }
                jobs
            };
            if jobs.is_empty() {
                guard.armed = false;
                return Ok(ran);
            }

            rounds += 1;
            if rounds > limit {
                self.store().draining_late = false;
                guard.armed = false;
                tracing::error!(ctx = self.inner.id, rounds = limit, dropped = jobs.len(), "late effects diverged");
                drop(jobs);
                return Err(ReactiveError::Diverged {
                    atom: "late effects".to_string(),
                    rounds: limit,
                });
            }
            ran += jobs.len();
            for job in jobs {
                job();
            }
        }
    }

    /// Run every late effect held back by [`LateEffects::Deferred`] or
    /// [`LateEffects::Spawn`], including the ones they schedule. Returns how
    /// many ran.
    ///
    /// Fails as [`ReactiveError::Diverged`] when late effects keep scheduling
    /// late effects past `max_late_rounds` batches; the pending batch is
    /// dropped.
    pub fn flush_late(&self) -> Result<usize> {
        self.drain_late()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CtxConfig;
    use crate::reactive::{on_update, Atom};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&count), count)
    }

    #[test]
    fn diamond_recomputes_once() {
        let ctx = Ctx::new();
        let a = Atom::new(1);
        let left = Atom::computed({
            let a = a.clone();
            move |ctx, _| Ok(ctx.spy(&a)? + 1)
        });
        let right = Atom::computed({
            let a = a.clone();
            move |ctx, _| Ok(ctx.spy(&a)? * 10)
        });
        let (runs, seen) = counter();
        let sum = Atom::computed({
            let (left, right) = (left.clone(), right.clone());
            move |ctx, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.spy(&left)? + ctx.spy(&right)?)
            }
        });

        let values = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&values);
        let _sub = ctx.subscribe(&sum, move |v| sink.lock().push(*v)).unwrap();
        a.set(&ctx, 2).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*values.lock(), vec![12, 23]);
    }

    #[test]
    fn unconnected_computed_revalidates_on_read() {
        let ctx = Ctx::new();
        let a = Atom::new(1);
        let (runs, seen) = counter();
        let b = Atom::computed({
            let a = a.clone();
            move |ctx, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.spy(&a)? * 2)
            }
        });

        assert_eq!(ctx.get(&b).unwrap(), 2);
        a.set(&ctx, 1).unwrap();
        assert_eq!(ctx.get(&b).unwrap(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        a.set(&ctx, 3).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.get(&b).unwrap(), 6);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_failure_rolls_back_only_its_segment() {
        let ctx = Ctx::new();
        let a = Atom::new(0);
        let b = Atom::new(0);

        ctx.transact(|ctx| {
            a.set(ctx, 1)?;
            let failed = ctx.transact(|ctx| {
                b.set(ctx, 1)?;
                Err::<(), _>(ReactiveError::failed("inner"))
            });
            assert!(failed.is_err());
            assert_eq!(ctx.get(&b)?, 0);
            Ok(())
        })
        .unwrap();

        assert_eq!(ctx.get(&a).unwrap(), 1);
        assert_eq!(ctx.get(&b).unwrap(), 0);
    }

    #[test]
    fn outer_failure_rolls_back_everything() {
        let ctx = Ctx::new();
        let a = Atom::new(0);
        let notified = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&notified);
        let _sub = ctx
            .subscribe(&a, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let result = ctx.transact(|ctx| {
            a.set(ctx, 5)?;
            Err::<(), _>(ReactiveError::failed("outer"))
        });
        assert!(result.is_err());
        assert_eq!(ctx.get(&a).unwrap(), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn self_feeding_hook_diverges() {
        let ctx = Ctx::with_config(CtxConfig::default().with_max_commit_rounds(5));
        let a = Atom::new(0).named("runaway");
        let target = a.clone();
        on_update(&a, move |ctx, value: &i32| {
            let _ = target.set(ctx, value + 1);
        });

        let err = a.set(&ctx, 1).unwrap_err();
        assert!(matches!(err, ReactiveError::Diverged { ref atom, rounds: 5 } if atom == "runaway"));
        assert_eq!(ctx.get(&a).unwrap(), 0);
    }

    #[test]
    fn hook_writes_extend_the_transaction() {
        let ctx = Ctx::new();
        let a = Atom::new(0);
        let mirror = Atom::new(0);
        let target = mirror.clone();
        on_update(&a, move |ctx, value: &i32| {
            target.set(ctx, *value).unwrap();
        });

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = ctx.subscribe(&mirror, move |v| sink.lock().push(*v)).unwrap();
        a.set(&ctx, 3).unwrap();
        assert_eq!(*seen.lock(), vec![0, 3]);
    }

    #[test]
    fn failing_dependent_is_isolated() {
        let ctx = Ctx::new();
        let a = Atom::new(1);
        let fragile = Atom::computed({
            let a = a.clone();
            move |ctx, _| {
                let value = ctx.spy(&a)?;
                if value == 2 {
                    return Err(ReactiveError::failed("two"));
                }
                Ok(value)
            }
        });
        let sibling = Atom::computed({
            let a = a.clone();
            move |ctx, _| ctx.spy(&a)
        });

        let fragile_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sibling_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (f, s) = (Arc::clone(&fragile_seen), Arc::clone(&sibling_seen));
        let _f = ctx.subscribe(&fragile, move |v| f.lock().push(*v)).unwrap();
        let _s = ctx.subscribe(&sibling, move |v| s.lock().push(*v)).unwrap();

        a.set(&ctx, 2).unwrap();
        assert_eq!(*fragile_seen.lock(), vec![1]);
        assert_eq!(*sibling_seen.lock(), vec![1, 2]);
        assert!(ctx.get(&fragile).is_err());

        a.set(&ctx, 3).unwrap();
        assert_eq!(*fragile_seen.lock(), vec![1, 3]);
    }

    #[test]
    fn deferred_late_effects_wait_for_flush() {
        let ctx = Ctx::with_config(CtxConfig::default().with_late_effects(LateEffects::Deferred));
        let (ran, job_count) = counter();
        ctx.transact(|ctx| {
            ctx.push_job(
                Priority::Late,
                Box::new(move || {
                    job_count.fetch_add(1, Ordering::SeqCst);
                }),
            );
            Ok(())
        })
        .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.flush_late().unwrap(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.flush_late().unwrap(), 0);
    }

    #[test]
    fn rolled_back_listener_owning_a_subscription_is_released_unlocked() {
        let ctx = Ctx::new();
        let atom = Atom::new(0);
        let other = Atom::new(0);

        ctx.transact(|ctx| {
            let failed = ctx.transact(|ctx| {
                let inner = ctx.subscribe(&other, |_| {})?;
                let owned = parking_lot::Mutex::new(Some(inner));
                ctx.subscribe(&atom, move |_| {
                    let _ = owned.lock().is_some();
                })?
                .detach();
                Err::<(), _>(ReactiveError::failed("inner"))
            });
            assert!(failed.is_err());
            Ok(())
        })
        .unwrap();

        assert!(!ctx.is_connected(&atom));
        assert!(!ctx.is_connected(&other));
    }
}
