//! §4.5 — `TimerHandler`, the background scheduler. One dispatcher task
//! drains due timers from the store on a time tick and hands them to the
//! callback pool; a second task drains callback completions and decides
//! whether to reschedule or tombstone. Splitting these into two tasks
//! sharing one `Inner` is how this crate honors §9's "implement as a
//! one-way message channel rather than a back-pointer" without the
//! dispatcher itself blocking on HTTP.

use crate::alarm::AlarmTracker;
use crate::clock::Clock;
use crate::http_callback::{CallbackCompletion, CompletionReceiver, HttpCallback};
use crate::logging::{self, PrintSender};
use crate::replicator::Replicator;
use crate::timer::Timer;
use crate::timer_store::TimerStore;
use crate::topology::TopologyHandle;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Dispatcher poll granularity while WAITING: production responsiveness is
/// bounded by this, not by how coarsely the injected [`Clock`] ticks.
const POLL_MS: u64 = 25;
/// §4.5: the wakeup cap, so clock skew and wake signals are noticed promptly.
const MAX_WAIT_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Waiting,
    Dispatching,
    Stopping,
}

struct Inner {
    store: Mutex<TimerStore>,
    clock: Arc<dyn Clock>,
    notify: Notify,
    stop_requested: AtomicBool,
    stopped: Notify,
    /// `None` until the dispatcher task has actually run at least once, so
    /// a subscriber created right after construction can't mistake the
    /// channel's initial value for a real report of reaching `WAITING`.
    state_tx: watch::Sender<Option<DispatchState>>,
    in_flight: DashSet<u64>,
    /// Pops that became due for an id whose previous pop is still
    /// in-flight, oldest first. Held here instead of re-dispatched
    /// immediately (§4.4: no concurrent callbacks for one id) and drained
    /// one at a time as each prior completion arrives, so sequence numbers
    /// reach the callback pool in order with no gaps even when several pops
    /// stack up behind one slow callback.
    pending_redispatch: DashMap<u64, VecDeque<Timer>>,
    callback: HttpCallback,
    replicator: Arc<Replicator>,
    topology: TopologyHandle,
    alarm: AlarmTracker,
    print_tx: PrintSender,
}

pub struct TimerHandler {
    inner: Arc<Inner>,
}

impl TimerHandler {
    pub fn new(
        store: TimerStore,
        clock: Arc<dyn Clock>,
        callback: HttpCallback,
        completion_rx: CompletionReceiver,
        replicator: Arc<Replicator>,
        topology: TopologyHandle,
        alarm: AlarmTracker,
        print_tx: PrintSender,
    ) -> Self {
        let (state_tx, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            store: Mutex::new(store),
            clock,
            notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            stopped: Notify::new(),
            state_tx,
            in_flight: DashSet::new(),
            pending_redispatch: DashMap::new(),
            callback,
            replicator,
            topology,
            alarm,
            print_tx,
        });

        tokio::spawn(dispatcher_loop(inner.clone()));
        tokio::spawn(completion_loop(inner.clone(), completion_rx));

        TimerHandler { inner }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Option<DispatchState>> {
        self.inner.state_tx.subscribe()
    }

    /// Test/ops helper: blocks until the dispatcher (re-)reaches `WAITING`,
    /// mirroring the original implementation's `block_till_waiting` test
    /// seam (`examples/original_source/src/test/test_timer_handler.cpp`).
    ///
    /// Two-phase so a call right after a mutation (`add_timer`, `delete_timer`)
    /// doesn't return on the stale `WAITING` left over from the *previous*
    /// cycle: first wait for the dispatcher to leave `WAITING` (or, on the
    /// very first call, skip straight to the second phase since it hasn't
    /// reported anything yet), then wait for it to report `WAITING` again.
    pub async fn wait_until_waiting(&self) {
        let mut rx = self.subscribe_state();
        while *rx.borrow() == Some(DispatchState::Waiting) {
            if rx.changed().await.is_err() {
                return;
            }
        }
        while *rx.borrow() != Some(DispatchState::Waiting) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn store_len(&self) -> usize {
        self.inner.store.lock().unwrap().len()
    }

    /// §4.6 `GET /timers/<hex>`: looks up a timer by id without removing it.
    pub fn get_timer(&self, id: u64) -> Option<Timer> {
        self.inner.store.lock().unwrap().get(id).cloned()
    }

    /// §4.5: insert or replace, then wake the dispatcher so it can
    /// recompute its sleep target.
    pub fn add_timer(&self, timer: Timer) {
        self.inner.store.lock().unwrap().add_timer(timer);
        self.inner.notify.notify_one();
    }

    /// §4.1/§4.6: converts the stored timer (if any) into a tombstone,
    /// fans it out to replicas, and wakes the dispatcher so it's evicted
    /// after one more tick. Idempotent: a missing id is not an error.
    pub async fn delete_timer(&self, id: u64) -> bool {
        let tombstoned = {
            let mut store = self.inner.store.lock().unwrap();
            let Some(mut timer) = store.get(id).cloned() else {
                return false;
            };
            timer.become_tombstone();
            // `add_timer` deletes any existing entry for the id first, so
            // this keeps the store's "exactly one entry per id" invariant.
            store.add_timer(timer.clone());
            timer
        };

        let topology = self.inner.topology.read().await.clone();
        let bloom_hash = topology.bloom_hash_of(tombstoned.replicas.iter().map(String::as_str));
        self.inner
            .replicator
            .replicate(&tombstoned, topology.local_addr(), bloom_hash)
            .await;
        self.inner.notify.notify_one();
        true
    }

    /// Called by whichever task drains the callback pool's completion
    /// channel; safe to call concurrently with `add_timer`/`delete_timer`
    /// (§5's concurrency contract).
    async fn handle_callback_completion(inner: &Arc<Inner>, completion: CallbackCompletion) {
        let CallbackCompletion { timer, success } = completion;
        inner.in_flight.remove(&timer.id);
        inner.alarm.record(timer.id, success, &inner.print_tx).await;

        if let Some((_, mut queue)) = inner.pending_redispatch.remove(&timer.id) {
            if let Some(next) = queue.pop_front() {
                if !queue.is_empty() {
                    inner.pending_redispatch.insert(timer.id, queue);
                }
                dispatch_prepared(inner, next).await;
            }
        }
    }

    /// Cooperative shutdown (§5): wakes the dispatcher, lets it finish one
    /// more drain, and waits for it to report `STOPPING`.
    pub async fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
        self.inner.stopped.notified().await;
    }
}

async fn dispatcher_loop(inner: Arc<Inner>) {
    let mut until = inner.clock.now_ms();
    loop {
        eprintln!("DBG publish Waiting, until={}", until);
        let _ = inner.state_tx.send(Some(DispatchState::Waiting));
        wait_until(&inner, until).await;
        eprintln!("DBG left wait_until");

        if inner.stop_requested.load(Ordering::SeqCst) {
            let _ = inner.state_tx.send(Some(DispatchState::Dispatching));
            run_dispatch_cycle(&inner).await;
            let _ = inner.state_tx.send(Some(DispatchState::Stopping));
            inner.stopped.notify_waiters();
            return;
        }

        let _ = inner.state_tx.send(Some(DispatchState::Dispatching));
        until = run_dispatch_cycle(&inner).await;
    }
}

async fn wait_until(inner: &Arc<Inner>, until: u64) {
    loop {
        let now = inner.clock.now_ms();
        eprintln!("DBG wait_until now={} until={}", now, until);
        if now >= until || inner.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        let wait_ms = (until - now).min(POLL_MS);
        tokio::select! {
            _ = inner.notify.notified() => { eprintln!("DBG notified"); return },
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => continue,
        }
    }
}

/// One DISPATCHING step: drain due timers, reschedule/tombstone/submit
/// each, then compute the next wakeup (capped at `now + 100ms`, §4.5).
async fn run_dispatch_cycle(inner: &Arc<Inner>) -> u64 {
    let now = inner.clock.now_ms();
    let mut drained = Vec::new();
    inner.store.lock().unwrap().get_next_timers(now, &mut drained);

    for timer in drained {
        if timer.is_tombstone() {
            continue; // already replicated at delete time; just drop it now
        }
        let prepared = prepare_pop(inner, timer, now).await;
        dispatch_prepared(inner, prepared).await;
    }

    let earliest = inner.store.lock().unwrap().earliest_pop_time();
    match earliest {
        Some(t) if t <= now + MAX_WAIT_MS => t.max(now),
        _ => now + MAX_WAIT_MS,
    }
}

/// Advances `timer`'s sequence number, decides whether it repeats or dies,
/// mutates the store accordingly, and returns the (possibly tombstoned)
/// timer clone that should be handed to the callback pool for this pop.
///
/// Tombstones still get one callback-pool submission here only if they
/// were *already* tombstones on entry -- but `run_dispatch_cycle` filters
/// those out before calling this, so `prepare_pop` only ever sees live
/// timers and returns the live (not-yet-tombstoned) timer for callback.
async fn prepare_pop(inner: &Arc<Inner>, mut timer: Timer, now: u64) -> Timer {
    timer.sequence_number += 1;
    let seq = timer.sequence_number;
    let for_callback = timer.clone();

    if timer.should_repeat_after(seq + 1) {
        if timer.next_pop_time() <= now {
            // Smear: force this one reinsertion slightly into the future
            // rather than immediately due again, to avoid a thundering
            // herd on fast intervals racing the clock (§4.5).
            let desired = now + 1;
            timer.start_time_ms = desired.saturating_sub((seq + 1) * timer.interval_ms);
        }
        inner.store.lock().unwrap().add_timer(timer);
        inner.notify.notify_one();
    } else {
        let mut dead = timer.clone();
        dead.become_tombstone();
        inner.store.lock().unwrap().add_timer(dead.clone());
        inner.notify.notify_one();

        let topology = inner.topology.read().await.clone();
        let bloom_hash = topology.bloom_hash_of(dead.replicas.iter().map(String::as_str));
        inner
            .replicator
            .replicate(&dead, topology.local_addr(), bloom_hash)
            .await;
    }

    for_callback
}

async fn dispatch_prepared(inner: &Arc<Inner>, timer: Timer) {
    if inner.in_flight.insert(timer.id) {
        inner.callback.perform(timer).await;
    } else {
        logging::debug(
            &inner.print_tx,
            format!("handler: timer {} already in flight, deferring pop", timer.id),
        )
        .await;
        inner
            .pending_redispatch
            .entry(timer.id)
            .or_insert_with(VecDeque::new)
            .push_back(timer);
    }
}

async fn completion_loop(inner: Arc<Inner>, mut completion_rx: CompletionReceiver) {
    while let Some(completion) = completion_rx.recv().await {
        TimerHandler::handle_callback_completion(&inner, completion).await;
    }
}
