// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::abort::{AbortSource, Subscription};
use crate::error::Error;
use crate::executor::ShardInner;
use crate::time::timer::TimerShared;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Wait until `duration` has elapsed.
///
/// The deadline is taken from the monotonic clock at call time; the timer is
/// armed with the shard's timer queue on first poll. A zero duration still
/// resolves only at the next timer poll, never synchronously.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        state: State::Unregistered,
    }
}

/// A sleep that can be cut short by an abort source.
///
/// On abort the timer is disarmed and the future fails with
/// [`SleepAborted`][crate::ErrorKind::SleepAborted], unless the timer had
/// already fired, in which case the abort is a no-op. If the source has
/// already fired when this is called, the future fails immediately.
pub fn sleep_abortable(duration: Duration, source: &AbortSource) -> crate::Future<()> {
    let flag = Rc::new(AbortFlag {
        aborted: Cell::new(false),
        waker: RefCell::new(None),
    });
    let callback = {
        let flag = Rc::clone(&flag);
        move || {
            flag.aborted.set(true);
            if let Some(waker) = flag.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    };
    let Some(subscription) = source.subscribe(callback) else {
        return crate::Future::err(Error::sleep_aborted());
    };
    crate::Future::from_future(SleepAbortable {
        sleep: sleep(duration),
        flag,
        _subscription: subscription,
    })
}

/// A sleep cut short by engine shutdown: fails with
/// [`SleepAborted`][crate::ErrorKind::SleepAborted] if and when
/// [`Shard::stop`][crate::Shard::stop] is called before the timer fires.
///
/// # Panics
///
/// Panics if no shard is running on this thread.
pub fn sleep_abortable_on_stop(duration: Duration) -> crate::Future<()> {
    let shard = ShardInner::try_current().expect("sleep requires a shard on this thread");
    sleep_abortable(duration, shard.stop_source())
}

#[derive(Debug)]
enum State {
    Unregistered,
    Registered {
        id: u64,
        entry: Rc<TimerShared>,
        shard: Rc<ShardInner>,
    },
    Completed,
}

/// Future returned by [`sleep`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    deadline: Instant,
    state: State,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            State::Completed => return Poll::Ready(()),
            State::Registered { entry, .. } if entry.fired.get() => {}
            State::Registered { entry, .. } => {
                *entry.waker.borrow_mut() = Some(cx.waker().clone());
                return Poll::Pending;
            }
            State::Unregistered => {
                let shard =
                    ShardInner::try_current().expect("sleep requires a shard on this thread");
                let (id, entry) = shard.timer.borrow_mut().register(this.deadline);
                *entry.waker.borrow_mut() = Some(cx.waker().clone());
                this.state = State::Registered { id, entry, shard };
                return Poll::Pending;
            }
        }
        this.state = State::Completed;
        Poll::Ready(())
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let State::Registered { id, entry, shard } = &self.state {
            if !entry.fired.get() {
                shard.timer.borrow_mut().cancel(*id);
            }
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Unregistered => "unregistered",
            State::Registered { .. } => "registered",
            State::Completed => "completed",
        };
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("state", &state)
            .finish()
    }
}

struct AbortFlag {
    aborted: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

struct SleepAbortable {
    sleep: Sleep,
    flag: Rc<AbortFlag>,
    _subscription: Subscription,
}

impl Future for SleepAbortable {
    type Output = crate::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // a fired timer wins over a later abort
        if Pin::new(&mut this.sleep).poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        if this.flag.aborted.get() {
            return Poll::Ready(Err(Error::sleep_aborted()));
        }
        *this.flag.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}
