// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::abort::AbortSource;
use crate::sched::{MAX_SCHEDULING_GROUPS, SchedulingGroup};
use crate::task::{self, RawTask, TaskRef};
use crate::time::timer::TimerQueue;
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Weight applied when billing elapsed runtime to a group, so that integer
/// division by the share count keeps sub-microsecond resolution.
const SHARE_SCALE: u64 = 1024;

/// Tunables of a [`Shard`].
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Maximum number of tasks dispatched from one group before the scheduler
    /// re-selects a group.
    pub task_quota: usize,
    /// Period of the preemption ticker; cooperative code observes
    /// [`need_preempt`] at most this long after the runtime requests a yield.
    pub preempt_tick: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            task_quota: 64,
            preempt_tick: Duration::from_micros(500),
        }
    }
}

/// One worker lane: a single-threaded cooperative executor.
///
/// A `Shard` owns the per-group ready queues, the timer queue and the
/// preemption flag for the OS thread it was created on. All futures, tasks
/// and synchronization primitives built on top of it are `!Send`; nothing in
/// the per-shard hot path takes a lock.
///
/// At most one shard may exist per thread. While it exists it is reachable
/// through [`Shard::current`], which is how the free functions
/// ([`spawn`][crate::spawn], [`sleep`][crate::sleep], …) find it.
pub struct Shard {
    inner: Rc<ShardInner>,
    /// Only the handle returned by [`Shard::new`] tears the shard down on
    /// drop; handles from [`Shard::current`] are borrows in spirit.
    owner: bool,
}

pub(crate) struct ShardInner {
    id: u32,
    /// Handed to tasks so their wakers can find the ready queue without
    /// keeping the shard alive.
    self_weak: Weak<ShardInner>,
    config: ShardConfig,
    queues: RefCell<Vec<Option<GroupQueue>>>,
    runnable: Cell<usize>,
    /// Smallest vruntime among runnable groups at the last selection; groups
    /// that wake from idle re-enter here so they cannot replay history.
    min_vruntime: Cell<u64>,
    preempt: Arc<AtomicBool>,
    ticker_shutdown: Arc<AtomicBool>,
    pub(crate) timer: RefCell<TimerQueue>,
    stop_source: AbortSource,
    stopped: Cell<bool>,
    current_group: Cell<SchedulingGroup>,
    in_task: Cell<bool>,
    /// Per-group, per-key user storage managed by the `sched` module.
    pub(crate) specifics: RefCell<Vec<crate::sched::GroupLocal>>,
}

struct GroupQueue {
    queue: VecDeque<TaskRef>,
    shares: u32,
    vruntime: u64,
}

thread_local! {
    static CURRENT: RefCell<Weak<ShardInner>> = const { RefCell::new(Weak::new()) };
}

static NEXT_SHARD_ID: AtomicU32 = AtomicU32::new(0);

/// Returns `true` when the runtime wants cooperative code to yield.
///
/// A cheap flag load. Outside a shard this always returns `false`.
pub fn need_preempt() -> bool {
    ShardInner::try_current().is_some_and(|shard| shard.preempt.load(Ordering::Relaxed))
}

/// The id of the shard running on this thread.
///
/// # Panics
///
/// Panics if no shard is running on this thread.
pub fn current_shard_id() -> u32 {
    Shard::current().id()
}

/// Spawns a future onto the current thread's shard in the caller's
/// scheduling group; see [`Shard::spawn`].
///
/// # Panics
///
/// Panics if no shard is running on this thread.
pub fn spawn<T, F>(future: F) -> crate::Future<T>
where
    T: 'static,
    F: std::future::Future<Output = crate::Result<T>> + 'static,
{
    Shard::current().spawn(future)
}

// === impl Shard ===

impl Shard {
    /// Creates a shard on the current thread with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if a shard already exists on this thread.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ShardConfig::default())
    }

    /// Creates a shard on the current thread.
    ///
    /// # Panics
    ///
    /// Panics if a shard already exists on this thread.
    #[must_use]
    pub fn with_config(config: ShardConfig) -> Self {
        let preempt = Arc::new(AtomicBool::new(false));
        let ticker_shutdown = Arc::new(AtomicBool::new(false));

        let inner = Rc::new_cyclic(|self_weak| ShardInner {
            id: NEXT_SHARD_ID.fetch_add(1, Ordering::Relaxed),
            self_weak: self_weak.clone(),
            queues: RefCell::new((0..MAX_SCHEDULING_GROUPS).map(|_| None).collect()),
            runnable: Cell::new(0),
            min_vruntime: Cell::new(0),
            preempt: Arc::clone(&preempt),
            ticker_shutdown: Arc::clone(&ticker_shutdown),
            timer: RefCell::new(TimerQueue::new()),
            stop_source: AbortSource::new(),
            stopped: Cell::new(false),
            current_group: Cell::new(SchedulingGroup::main()),
            in_task: Cell::new(false),
            specifics: RefCell::new(Vec::new()),
            config,
        });

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.upgrade().is_none(),
                "a shard is already running on this thread"
            );
            *current = Rc::downgrade(&inner);
        });

        spawn_preempt_ticker(preempt, ticker_shutdown, inner.config.preempt_tick);

        tracing::debug!(shard = inner.id, "shard created");
        Self { inner, owner: true }
    }

    /// The shard running on the current thread.
    ///
    /// # Panics
    ///
    /// Panics if no shard is running on this thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            inner: ShardInner::try_current().expect("no shard is running on this thread"),
            owner: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Spawns a future as a task in the caller's scheduling group.
    ///
    /// The returned [`Future`][crate::Future] resolves with the task's result;
    /// dropping it does not cancel the task, the work runs to completion and a
    /// discarded failure is reported through the logging hook.
    pub fn spawn<T, F>(&self, future: F) -> crate::Future<T>
    where
        T: 'static,
        F: std::future::Future<Output = crate::Result<T>> + 'static,
    {
        self.inner
            .spawn_in_group(self.inner.current_group.get(), future)
    }

    /// Spawns a future as a task tagged with the given scheduling group.
    pub fn spawn_in_group<T, F>(&self, group: SchedulingGroup, future: F) -> crate::Future<T>
    where
        T: 'static,
        F: std::future::Future<Output = crate::Result<T>> + 'static,
    {
        self.inner.spawn_in_group(group, future)
    }

    /// Returns `true` when the runtime wants cooperative code to yield.
    pub fn need_preempt(&self) -> bool {
        self.inner.preempt.load(Ordering::Relaxed)
    }

    /// Requests engine shutdown: fires the shard's stop source, which fails
    /// source-less abortable sleeps and resolves [`wait_for_stop`][Self::wait_for_stop].
    pub fn stop(&self) {
        if self.inner.stopped.replace(true) {
            return;
        }
        tracing::debug!(shard = self.inner.id, "shard stop requested");
        self.inner.preempt.store(true, Ordering::Relaxed);
        self.inner.stop_source.request_abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    /// Resolves when the engine starts shutting down.
    pub fn wait_for_stop(&self) -> crate::Future<()> {
        if self.inner.stopped.get() {
            return crate::Future::ready(());
        }
        let wait = self.inner.stop_source.wait();
        crate::Future::from_future(async move {
            wait.await;
            Ok(())
        })
    }

    /// Drives the shard until [`stop`][Self::stop] is called.
    pub fn run(&self) {
        let _span = tracing::debug_span!("shard main loop", shard = self.inner.id).entered();

        loop {
            if self.inner.tick() {
                continue;
            }

            if self.inner.stopped.get() {
                tracing::debug!(shard = self.inner.id, "stop observed, shutting down");
                break;
            }

            let now = Instant::now();
            let (expired, next_deadline) = self.inner.timer.borrow_mut().turn(now);
            if expired > 0 {
                continue;
            }

            park_until(next_deadline, now);
        }
    }

    /// The thread-context: drives the shard until `future` resolves, blocking
    /// the calling thread in between.
    ///
    /// Inside a `block_on` scope (and only there) [`Future::get`][crate::Future::get]
    /// and the deferred-close guards may synchronously drive the runtime.
    /// Calling `block_on` from inside a task is a framework defect.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        let _span = tracing::debug_span!("shard block_on", shard = self.inner.id).entered();

        if self.inner.in_task.get() {
            debug_assert!(false, "block_on called from inside a task");
            tracing::error!("block_on called from inside a task; this may deadlock");
        }

        let waker = Waker::from(Arc::new(Unpark(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                return value;
            }

            if self.inner.tick() {
                continue;
            }

            let now = Instant::now();
            let (expired, next_deadline) = self.inner.timer.borrow_mut().turn(now);
            if expired > 0 {
                continue;
            }

            park_until(next_deadline, now);
        }
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.inner.id)
            .field("runnable", &self.inner.runnable.get())
            .finish()
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        self.inner.ticker_shutdown.store(true, Ordering::Release);
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current
                .upgrade()
                .is_some_and(|shard| Rc::ptr_eq(&shard, &self.inner))
            {
                *current = Weak::new();
            }
        });
    }
}

// === impl ShardInner ===

impl ShardInner {
    pub(crate) fn try_current() -> Option<Rc<ShardInner>> {
        CURRENT.with(|current| current.borrow().upgrade())
    }

    pub(crate) fn current_group(&self) -> SchedulingGroup {
        self.current_group.get()
    }

    pub(crate) fn in_task(&self) -> bool {
        self.in_task.get()
    }

    pub(crate) fn stop_source(&self) -> &AbortSource {
        &self.stop_source
    }

    pub(crate) fn spawn_in_group<T, F>(
        &self,
        group: SchedulingGroup,
        future: F,
    ) -> crate::Future<T>
    where
        T: 'static,
        F: std::future::Future<Output = crate::Result<T>> + 'static,
    {
        let mut promise = crate::Promise::new();
        let result = promise.get_future();
        self.spawn_detached(group, async move {
            promise.resolve(future.await);
        });
        result
    }

    pub(crate) fn spawn_detached<F>(&self, group: SchedulingGroup, future: F)
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        let task = RawTask::new(group, self.self_weak.clone(), future.boxed_local());
        tracing::trace!(task.id = %task.id(), group = ?group, "spawn");
        self.enqueue(TaskRef(task));
    }

    /// Appends a task to its group's ready queue, activating the group if it
    /// was idle.
    pub(crate) fn enqueue(&self, task: TaskRef) {
        let group = task.group();
        let mut queues = self.queues.borrow_mut();
        let slot = &mut queues[group.index()];
        let queue = slot.get_or_insert_with(|| GroupQueue {
            queue: VecDeque::new(),
            shares: crate::sched::group_shares(group),
            vruntime: self.min_vruntime.get(),
        });
        if queue.queue.is_empty() {
            queue.vruntime = queue.vruntime.max(self.min_vruntime.get());
        }
        queue.queue.push_back(task);
        self.runnable.set(self.runnable.get() + 1);
    }

    /// Marks the shard as running a task; the guard restores the previous
    /// context on drop.
    pub(crate) fn enter_task(&self, group: SchedulingGroup) -> TaskContext<'_> {
        TaskContext {
            prev_group: self.current_group.replace(group),
            prev_in_task: self.in_task.replace(true),
            shard: self,
        }
    }

    /// Deficit round-robin selection: the runnable group with the smallest
    /// share-normalized runtime runs next.
    fn select_group(&self) -> Option<usize> {
        let queues = self.queues.borrow();
        let mut best: Option<(usize, u64)> = None;
        for (index, queue) in queues.iter().enumerate() {
            let Some(queue) = queue else { continue };
            if queue.queue.is_empty() {
                continue;
            }
            if best.is_none_or(|(_, vruntime)| queue.vruntime < vruntime) {
                best = Some((index, queue.vruntime));
            }
        }
        if let Some((_, vruntime)) = best {
            self.min_vruntime.set(vruntime);
        }
        best.map(|(index, _)| index)
    }

    /// Dispatches up to a task-quota worth of tasks from one group, billing
    /// the elapsed runtime to it. Returns `true` if any task was polled.
    pub(crate) fn tick(&self) -> bool {
        let Some(index) = self.select_group() else {
            return false;
        };

        let started = Instant::now();
        let mut polled = 0;
        while polled < self.config.task_quota {
            let task = {
                let mut queues = self.queues.borrow_mut();
                queues[index].as_mut().and_then(|q| q.queue.pop_front())
            };
            let Some(task) = task else { break };
            self.runnable.set(self.runnable.get() - 1);

            // the dispatcher regained control; cooperative code gets a fresh
            // quota for this dispatch
            self.preempt.store(false, Ordering::Relaxed);

            task::run_task(self, task);
            polled += 1;

            if self.timer_due(Instant::now()) {
                break;
            }
        }

        let elapsed = started.elapsed();
        let mut queues = self.queues.borrow_mut();
        if let Some(queue) = queues[index].as_mut() {
            let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
            queue.vruntime = queue
                .vruntime
                .saturating_add(nanos.saturating_mul(SHARE_SCALE) / u64::from(queue.shares.max(1)));
        }

        tracing::trace!(shard = self.id, polled, "tick");
        polled > 0
    }

    fn timer_due(&self, now: Instant) -> bool {
        self.timer
            .borrow()
            .next_deadline()
            .is_some_and(|deadline| deadline <= now)
    }
}

impl fmt::Debug for ShardInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardInner")
            .field("id", &self.id)
            .field("runnable", &self.runnable.get())
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

pub(crate) struct TaskContext<'shard> {
    shard: &'shard ShardInner,
    prev_group: SchedulingGroup,
    prev_in_task: bool,
}

impl Drop for TaskContext<'_> {
    fn drop(&mut self) {
        self.shard.current_group.set(self.prev_group);
        self.shard.in_task.set(self.prev_in_task);
    }
}

struct Unpark(Thread);

impl Wake for Unpark {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

fn park_until(deadline: Option<Instant>, now: Instant) {
    match deadline {
        Some(deadline) => thread::park_timeout(deadline.saturating_duration_since(now)),
        None => {
            tracing::trace!("parking without a deadline");
            thread::park();
        }
    }
}

/// The quota ticker arms the preemption flag on a fixed period, bounding how
/// long a cooperative loop can run between yield points.
fn spawn_preempt_ticker(preempt: Arc<AtomicBool>, shutdown: Arc<AtomicBool>, period: Duration) {
    thread::Builder::new()
        .name("shoal-preempt".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(period);
                preempt.store(true, Ordering::Release);
            }
        })
        .expect("failed to spawn the preemption ticker");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn block_on_plain_value() {
        let _trace = trace_init();
        let shard = Shard::new();
        let out = shard.block_on(async { 1 + 1 });
        assert_eq!(out, 2);
    }

    #[test]
    fn spawn_result_flows_through_the_handle() {
        let _trace = trace_init();
        let shard = Shard::new();
        let out = shard.block_on(async {
            let handle = crate::spawn(async { Ok(42u32) });
            handle.await
        });
        assert_eq!(out.unwrap(), 42);
    }

    #[test]
    fn tasks_run_in_fifo_order_within_a_group() {
        let _trace = trace_init();
        let shard = Shard::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let order = Rc::clone(&order);
                shard.spawn(async move {
                    order.borrow_mut().push(i);
                    Ok(())
                })
            })
            .collect();

        shard.block_on(async {
            for handle in handles {
                handle.await.unwrap();
            }
        });

        assert_eq!(*order.borrow(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn yield_now_round_trips_through_the_queue() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            crate::task::yield_now().await;
            crate::task::yield_now().await;
        });
    }

    #[test]
    fn need_preempt_is_false_off_shard() {
        assert!(!need_preempt());
    }

    #[test]
    fn stop_resolves_wait_for_stop() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let shard = Shard::current();
            let waiter = shard.wait_for_stop();
            shard.stop();
            waiter.await.unwrap();
            assert!(shard.is_stopped());
        });
    }

    #[test]
    fn run_drains_until_stop() {
        let _trace = trace_init();
        let shard = Shard::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        drop(shard.spawn(async move {
            flag.set(true);
            Shard::current().stop();
            Ok(())
        }));
        shard.run();
        assert!(ran.get());
    }

    /// The busy-spin fairness measurement from the scheduling model: two
    /// groups with a 1:2 share ratio should accumulate iterations in roughly
    /// that ratio. Wall-clock dependent, so it only runs when asked for.
    #[test]
    #[ignore = "wall-clock fairness measurement"]
    fn group_shares_bias_throughput() {
        let _trace = trace_init();
        let shard = Shard::new();

        let a = crate::sched::create_scheduling_group("fairness-a", 100)
            .get()
            .unwrap();
        let b = crate::sched::create_scheduling_group("fairness-b", 200)
            .get()
            .unwrap();

        let count_a = Rc::new(Cell::new(0u64));
        let count_b = Rc::new(Cell::new(0u64));
        let deadline = Instant::now() + Duration::from_millis(500);

        let spin = |count: Rc<Cell<u64>>| {
            crate::combinator::repeat(move || {
                let count = Rc::clone(&count);
                async move {
                    while !need_preempt() && Instant::now() < deadline {
                        std::hint::spin_loop();
                    }
                    count.set(count.get() + 1);
                    if Instant::now() >= deadline {
                        Ok(crate::Stop::Yes)
                    } else {
                        Ok(crate::Stop::No)
                    }
                }
            })
        };

        let fut_a = shard.spawn_in_group(a, spin(Rc::clone(&count_a)));
        let fut_b = shard.spawn_in_group(b, spin(Rc::clone(&count_b)));
        shard.block_on(async {
            fut_a.await.unwrap();
            fut_b.await.unwrap();
        });

        let (a_iters, b_iters) = (count_a.get().max(1), count_b.get());
        // 2.0 nominal ratio, generous window for loaded machines
        assert!(
            b_iters * 10 >= a_iters * 14 && b_iters * 10 <= a_iters * 26,
            "expected roughly 2x iterations for the 2x-share group, got {a_iters} vs {b_iters}"
        );

        crate::sched::destroy_scheduling_group(a).get().unwrap();
        crate::sched::destroy_scheduling_group(b).get().unwrap();
    }
}
