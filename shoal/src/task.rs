// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod id;
mod yield_now;

use crate::executor::ShardInner;
use crate::sched::SchedulingGroup;
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem::ManuallyDrop;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub use id::Id;
pub use yield_now::{maybe_yield, yield_now};

/// Where a task currently is in its run cycle.
///
/// The state is a plain [`Cell`] because tasks never leave their shard; every
/// transition happens on the shard's own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    /// Parked; some waker holds a reference and may enqueue it later.
    Idle,
    /// Sitting in its group's ready queue.
    Queued,
    /// Currently being polled by the dispatch loop.
    Running,
    /// Woke itself while being polled; the dispatcher re-enqueues it.
    RunningWoken,
    /// Ran to completion; the future has been dropped.
    Complete,
}

/// A heap-allocated task: a type-erased future plus the scheduling-group tag
/// the executor partitions ready queues by.
///
/// Tasks are reference-counted with [`Rc`]; a task is owned by exactly one of
/// the group ready queue, the wakers registered for it, or the transient
/// dispatch frame. Wakers built from a task pointer must never leave the
/// shard's thread.
pub(crate) struct RawTask {
    id: Id,
    group: Cell<SchedulingGroup>,
    state: Cell<RunState>,
    shard: Weak<ShardInner>,
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
}

/// A counted reference to a [`RawTask`] owned by the ready queue or the
/// dispatch loop.
pub(crate) struct TaskRef(pub(crate) Rc<RawTask>);

// === impl RawTask ===

impl RawTask {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake_by_val,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    pub(crate) fn new(
        group: SchedulingGroup,
        shard: Weak<ShardInner>,
        future: LocalBoxFuture<'static, ()>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: Id::next(),
            group: Cell::new(group),
            state: Cell::new(RunState::Queued),
            shard,
            future: RefCell::new(Some(future)),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn group(&self) -> SchedulingGroup {
        self.group.get()
    }

    /// Transitions the task towards the ready queue.
    ///
    /// Waking an already queued, woken or complete task is a no-op; waking a
    /// task whose shard has shut down drops the wake on the floor.
    pub(crate) fn wake(this: &Rc<Self>) {
        match this.state.get() {
            RunState::Idle => {
                let Some(shard) = this.shard.upgrade() else {
                    tracing::trace!(task.id = %this.id, "woken after shard shutdown");
                    return;
                };
                this.state.set(RunState::Queued);
                shard.enqueue(TaskRef(Rc::clone(this)));
            }
            RunState::Running => this.state.set(RunState::RunningWoken),
            RunState::Queued | RunState::RunningWoken | RunState::Complete => {}
        }
    }

    /// Builds a [`Waker`] that holds one strong reference to the task.
    pub(crate) fn waker(this: &Rc<Self>) -> Waker {
        let ptr = Rc::into_raw(Rc::clone(this));
        // Safety: the pointer comes out of `Rc::into_raw` with its own strong
        // count, and the vtable below balances every clone/drop. The waker is
        // `!Send` by construction of this runtime (tasks never leave their
        // shard), which the single-threaded dispatch model guarantees.
        unsafe { Waker::from_raw(RawWaker::new(ptr.cast::<()>(), &Self::WAKER_VTABLE)) }
    }

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        // Safety: `ptr` was produced by `Rc::into_raw` in `waker` or
        // `clone_waker`; bumping the strong count mints a new owned pointer.
        unsafe { Rc::increment_strong_count(ptr.cast::<RawTask>()) };
        RawWaker::new(ptr, &Self::WAKER_VTABLE)
    }

    unsafe fn wake_by_val(ptr: *const ()) {
        // Safety: consumes the strong count owned by this waker.
        let this = unsafe { Rc::from_raw(ptr.cast::<RawTask>()) };
        Self::wake(&this);
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: borrows the strong count owned by the waker without
        // consuming it, hence the `ManuallyDrop`.
        let this = unsafe { ManuallyDrop::new(Rc::from_raw(ptr.cast::<RawTask>())) };
        Self::wake(&this);
    }

    unsafe fn drop_waker(ptr: *const ()) {
        // Safety: releases the strong count owned by this waker.
        drop(unsafe { Rc::from_raw(ptr.cast::<RawTask>()) });
    }
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.id)
            .field("group", &self.group.get())
            .field("state", &self.state.get())
            .finish()
    }
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn group(&self) -> SchedulingGroup {
        self.0.group()
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef").field("id", &self.0.id).finish()
    }
}

/// Polls a task once and routes it according to the poll outcome.
///
/// Runs on the shard thread with no queue borrows held, so the future being
/// polled is free to spawn tasks, wake wakers and register timers.
pub(crate) fn run_task(shard: &ShardInner, task: TaskRef) {
    tracing::trace!(task = ?task, "dispatch");

    let poll = {
        let Ok(mut slot) = task.0.future.try_borrow_mut() else {
            // Reentrant dispatch of the task we are already inside of. This
            // only happens when a thread-context is entered from task code (a
            // defect that is reported at the entry point); requeue and let the
            // outer poll finish first.
            task.0.state.set(RunState::Queued);
            shard.enqueue(task);
            return;
        };
        let Some(future) = slot.as_mut() else {
            return;
        };

        task.0.state.set(RunState::Running);
        let _ctx = shard.enter_task(task.0.group.get());
        let waker = RawTask::waker(&task.0);
        let mut cx = Context::from_waker(&waker);
        future.as_mut().poll(&mut cx)
    };

    match poll {
        Poll::Ready(()) => {
            task.0.state.set(RunState::Complete);
            *task.0.future.borrow_mut() = None;
        }
        Poll::Pending => match task.0.state.get() {
            RunState::RunningWoken => {
                task.0.state.set(RunState::Queued);
                shard.enqueue(task);
            }
            _ => task.0.state.set(RunState::Idle),
        },
    }
}
