//! Integration Tests for Scheduled Effects

use std::sync::{Arc, Mutex};
use std::time::Duration;

use quiver_core::{
    on_connect, on_update, take_call, take_nested, Action, Atom, Ctx, CtxConfig, LateEffects,
    Priority, ReactiveError, Scheduled,
};
use tokio::sync::Notify;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn push(log: &Log, entry: &'static str) {
    log.lock().unwrap().push(entry);
}

#[test]
fn late_effect_sees_committed_state() {
    init_tracing();
    let ctx = Ctx::new();
    let atom = Atom::new(0);
    let reader = atom.clone();

    let mut scheduled = ctx
        .transact(|ctx| {
            atom.set(ctx, 1)?;
            let scheduled = ctx.schedule(move |ctx| ctx.get(&reader), Priority::Late);
            atom.set(ctx, 2)?;
            Ok(scheduled)
        })
        .unwrap();

    assert_eq!(scheduled.try_take().unwrap().unwrap(), 2);
}

#[test]
fn near_effects_of_a_late_effect_run_before_the_next_late_effect() {
    init_tracing();
    let ctx = Ctx::new();
    let log = Log::default();

    ctx.transact(|ctx| {
        let first = Arc::clone(&log);
        let _ = ctx.schedule(
            move |ctx| {
                push(&first, "late 1");
                let nested = Arc::clone(&first);
                let _ = ctx.schedule(
                    move |_| {
                        push(&nested, "near of late 1");
                        Ok(())
                    },
                    Priority::Near,
                );
                Ok(())
            },
            Priority::Late,
        );
        let second = Arc::clone(&log);
        let _ = ctx.schedule(
            move |_| {
                push(&second, "late 2");
                Ok(())
            },
            Priority::Late,
        );
        let near = Arc::clone(&log);
        let _ = ctx.schedule(
            move |_| {
                push(&near, "near");
                Ok(())
            },
            Priority::Near,
        );
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.lock().unwrap(), ["near", "late 1", "near of late 1", "late 2"]);
}

#[test]
fn deferred_late_effects_wait_for_flush() {
    init_tracing();
    let ctx = Ctx::with_config(CtxConfig::default().with_late_effects(LateEffects::Deferred));
    let log = Log::default();

    let sink = Arc::clone(&log);
    let mut scheduled = ctx.schedule(
        move |_| {
            push(&sink, "late");
            Ok(())
        },
        Priority::Late,
    );
    assert!(scheduled.try_take().is_none());
    assert!(log.lock().unwrap().is_empty());

    assert_eq!(ctx.flush_late().unwrap(), 1);
    assert!(scheduled.try_take().unwrap().is_ok());
    assert_eq!(ctx.flush_late().unwrap(), 0);
}

#[test]
fn late_effects_scheduling_late_effects_run_in_batches() {
    init_tracing();
    let ctx = Ctx::new();
    let counter = Atom::new(0).named("counter");
    let target = counter.clone();
    on_update(&counter, move |ctx, value: &i32| {
        if *value < 10_000 {
            let target = target.clone();
            let _ = ctx.schedule(move |ctx| target.update(ctx, |n| n + 1), Priority::Late);
        }
    });

    counter.set(&ctx, 1).unwrap();
    assert_eq!(ctx.get(&counter).unwrap(), 10_000);
}

#[test]
fn endless_late_effects_fail_as_diverged() {
    init_tracing();
    let ctx = Ctx::with_config(CtxConfig::default().with_max_late_rounds(50));
    let counter = Atom::new(0).named("counter");
    let target = counter.clone();
    on_update(&counter, move |ctx, _: &i32| {
        let target = target.clone();
        let _ = ctx.schedule(move |ctx| target.update(ctx, |n| n + 1), Priority::Late);
    });

    let err = counter.set(&ctx, 1).unwrap_err();
    assert!(matches!(err, ReactiveError::Diverged { ref atom, rounds: 50 } if atom == "late effects"));
    // The write itself committed; every batch up to the bound ran.
    assert_eq!(ctx.get(&counter).unwrap(), 51);
    assert_eq!(ctx.flush_late().unwrap(), 0);
}

#[test]
fn deferred_flush_runs_late_effects_they_schedule() {
    init_tracing();
    let ctx = Ctx::with_config(CtxConfig::default().with_late_effects(LateEffects::Deferred));
    let log = Log::default();

    let outer = Arc::clone(&log);
    let _ = ctx.schedule(
        move |ctx| {
            push(&outer, "first");
            let inner = Arc::clone(&outer);
            let _ = ctx.schedule(
                move |_| {
                    push(&inner, "second");
                    Ok(())
                },
                Priority::Late,
            );
            Ok(())
        },
        Priority::Late,
    );

    assert_eq!(ctx.flush_late().unwrap(), 2);
    assert_eq!(*log.lock().unwrap(), ["first", "second"]);
}

#[tokio::test]
async fn spawned_late_effects_run_after_yielding() {
    init_tracing();
    let ctx = Ctx::with_config(CtxConfig::default().with_late_effects(LateEffects::Spawn));
    let atom = Atom::new(0);

    let reader = atom.clone();
    let mut scheduled: Scheduled<i32> = ctx.schedule(move |ctx| ctx.get(&reader), Priority::Late);
    atom.set(&ctx, 5).unwrap();
    assert!(scheduled.try_take().is_none());

    assert_eq!(scheduled.await.unwrap(), 5);
}

#[tokio::test]
async fn async_effect_writes_in_a_new_transaction() {
    init_tracing();
    let ctx = Ctx::new();
    let atom = Atom::new(0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = ctx
        .subscribe(&atom, move |value: &i32| sink.lock().unwrap().push(*value))
        .unwrap();

    let writer = atom.clone();
    ctx.schedule_async(
        move |ctx| async move {
            tokio::task::yield_now().await;
            writer.set(&ctx, 1)?;
            writer.set(&ctx, 2)
        },
        Priority::Near,
    )
    .await
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), [0, 1, 2]);
}

#[tokio::test]
async fn take_call_resolves_with_the_next_payload() {
    init_tracing();
    let ctx = Ctx::new();
    let double = Action::new(|_: &Ctx, n: i32| Ok(n * 2)).named("double");

    let caller = double.clone();
    let call_ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        caller.call(&call_ctx, 21).unwrap();
    });

    assert_eq!(take_call(&ctx, &double).await.unwrap(), 42);
}

#[tokio::test]
async fn take_nested_waits_for_effects_of_called_actions() {
    init_tracing();
    let ctx = Ctx::new();
    let loaded = Atom::new(Vec::<String>::new()).named("loaded");

    let target = loaded.clone();
    let fetch = Action::new(move |ctx: &Ctx, id: u32| {
        let target = target.clone();
        let _ = ctx.schedule_async(
            move |ctx| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                target.update(&ctx, |items| {
                    let mut items = items.clone();
                    items.push(format!("item {id}"));
                    items
                })
            },
            Priority::Near,
        );
        Ok(id)
    })
    .named("fetch");

    let ids = take_nested(&ctx, |ctx| Ok((fetch.call(ctx, 1)?, fetch.call(ctx, 2)?)))
        .await
        .unwrap();

    assert_eq!(ids, (1, 2));
    let mut items = ctx.get(&loaded).unwrap();
    items.sort();
    assert_eq!(items, ["item 1", "item 2"]);
}

#[tokio::test]
async fn disconnect_aborts_only_the_connection_work() {
    init_tracing();
    let ctx = Ctx::new();
    let feed = Atom::new(0).named("feed");
    let release = Arc::new(Notify::new());

    let poll: Arc<Mutex<Option<Scheduled<()>>>> = Arc::default();
    let slot = Arc::clone(&poll);
    on_connect(&feed, move |ctx| {
        let scheduled = ctx.schedule_async(
            |_| async {
                std::future::pending::<()>().await;
                Ok(())
            },
            Priority::Late,
        );
        *slot.lock().unwrap() = Some(scheduled);
        None
    });

    let gate = Arc::clone(&release);
    let unrelated = ctx.schedule_async(
        move |_| async move {
            gate.notified().await;
            Ok("unrelated")
        },
        Priority::Late,
    );

    let sub = ctx.subscribe(&feed, |_| {}).unwrap();
    tokio::task::yield_now().await;
    drop(sub);

    let in_flight = poll.lock().unwrap().take().unwrap();
    match in_flight.await {
        Err(ReactiveError::Aborted(error)) => assert_eq!(error.reason(), "disconnect feed"),
        other => panic!("expected abort, got {other:?}"),
    }

    release.notify_one();
    assert_eq!(unrelated.await.unwrap(), "unrelated");
}

#[tokio::test]
async fn effect_of_an_aborted_scope_does_not_run() {
    init_tracing();
    let ctx = Ctx::with_config(CtxConfig::default().with_late_effects(LateEffects::Deferred));
    let feed = Atom::new(0);
    let ran = Log::default();

    let pending: Arc<Mutex<Option<Scheduled<()>>>> = Arc::default();
    let (slot, log) = (Arc::clone(&pending), Arc::clone(&ran));
    on_connect(&feed, move |ctx| {
        let log = Arc::clone(&log);
        let scheduled = ctx.schedule(
            move |_| {
                push(&log, "ran");
                Ok(())
            },
            Priority::Late,
        );
        *slot.lock().unwrap() = Some(scheduled);
        None
    });

    drop(ctx.subscribe(&feed, |_| {}).unwrap());
    ctx.flush_late().unwrap();

    let outcome = pending.lock().unwrap().take().unwrap().await;
    assert!(matches!(outcome, Err(ref error) if error.is_abort()));
    assert!(ran.lock().unwrap().is_empty());
}
