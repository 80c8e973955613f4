// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, Result};
use crate::future::Future;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// A counting semaphore with FIFO waiters.
///
/// This is the primary backpressure primitive: a waiter parks until it can
/// take its units, and units return to the pool when the RAII
/// [`SemaphoreUnits`] guard drops. Waiters are served strictly in arrival
/// order; a large request at the head blocks smaller requests behind it until
/// it can be satisfied.
///
/// `Semaphore` is a cheap handle; clones share the same pool.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<SemState>>,
}

struct SemState {
    units: usize,
    waiters: VecDeque<SemWaiter>,
    broken: Option<Error>,
    next_id: u64,
}

struct SemWaiter {
    id: u64,
    units: usize,
    state: WaiterState,
    waker: Option<Waker>,
}

enum WaiterState {
    Waiting,
    Granted,
    Broken(Error),
}

/// RAII ownership of semaphore units; returns them on drop.
pub struct SemaphoreUnits {
    inner: Rc<RefCell<SemState>>,
    units: usize,
}

// === impl Semaphore ===

impl Semaphore {
    #[must_use]
    pub fn new(units: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SemState {
                units,
                waiters: VecDeque::new(),
                broken: None,
                next_id: 0,
            })),
        }
    }

    pub fn available_units(&self) -> usize {
        self.inner.borrow().units
    }

    pub fn waiters(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Takes `units` without waiting, or returns `None` if that would queue.
    pub fn try_wait(&self, units: usize) -> Option<SemaphoreUnits> {
        let mut state = self.inner.borrow_mut();
        if state.broken.is_none() && state.waiters.is_empty() && state.units >= units {
            state.units -= units;
            Some(SemaphoreUnits {
                inner: Rc::clone(&self.inner),
                units,
            })
        } else {
            None
        }
    }

    /// Waits until `units` can be taken from the pool.
    ///
    /// Dropping the returned future before it resolves dequeues the waiter;
    /// dropping it after the grant returns the units, so no unit is ever
    /// leaked.
    pub fn wait(&self, units: usize) -> Future<SemaphoreUnits> {
        {
            let mut state = self.inner.borrow_mut();
            if let Some(err) = &state.broken {
                return Future::err(err.clone());
            }
            if state.waiters.is_empty() && state.units >= units {
                state.units -= units;
                return Future::ready(SemaphoreUnits {
                    inner: Rc::clone(&self.inner),
                    units,
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.push_back(SemWaiter {
                id,
                units,
                state: WaiterState::Waiting,
                waker: None,
            });
            drop(state);
            Future::from_future(SemaphoreWait {
                inner: Rc::clone(&self.inner),
                id,
                units,
                finished: false,
            })
        }
    }

    /// Like [`wait`][Self::wait], failing with
    /// [`SemaphoreTimedOut`][crate::ErrorKind::SemaphoreTimedOut] if the
    /// units cannot be taken within `timeout`.
    pub fn wait_timeout(&self, units: usize, timeout: Duration) -> Future<SemaphoreUnits> {
        let wait = self.wait(units);
        Future::from_future(async move {
            match crate::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::semaphore_timed_out()),
            }
        })
    }

    /// Returns `units` to the pool and grants any waiters that now fit.
    pub fn signal(&self, units: usize) {
        let wakers = {
            let mut state = self.inner.borrow_mut();
            state.units += units;
            grant_waiters(&mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Breaks the semaphore: every queued and future waiter fails with
    /// [`SemaphoreBroken`][crate::ErrorKind::SemaphoreBroken].
    pub fn broken(&self) {
        self.broken_with(Error::semaphore_broken());
    }

    /// Breaks the semaphore with a caller-provided error.
    pub fn broken_with(&self, error: Error) {
        let wakers = {
            let mut state = self.inner.borrow_mut();
            if state.broken.is_some() {
                return;
            }
            state.broken = Some(error.clone());
            let mut wakers = Vec::new();
            for waiter in state.waiters.iter_mut() {
                if matches!(waiter.state, WaiterState::Waiting) {
                    waiter.state = WaiterState::Broken(error.clone());
                    if let Some(waker) = waiter.waker.take() {
                        wakers.push(waker);
                    }
                }
            }
            wakers
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Semaphore")
            .field("units", &state.units)
            .field("waiters", &state.waiters.len())
            .field("broken", &state.broken.is_some())
            .finish()
    }
}

/// FIFO grant scan: satisfy waiters from the front until one does not fit.
fn grant_waiters(state: &mut SemState) -> Vec<Waker> {
    let mut wakers = Vec::new();
    let mut available = state.units;
    for waiter in state.waiters.iter_mut() {
        match waiter.state {
            WaiterState::Granted | WaiterState::Broken(_) => continue,
            WaiterState::Waiting => {
                if waiter.units > available {
                    break;
                }
                available -= waiter.units;
                waiter.state = WaiterState::Granted;
                if let Some(waker) = waiter.waker.take() {
                    wakers.push(waker);
                }
            }
        }
    }
    state.units = available;
    wakers
}

struct SemaphoreWait {
    inner: Rc<RefCell<SemState>>,
    id: u64,
    units: usize,
    finished: bool,
}

impl StdFuture for SemaphoreWait {
    type Output = Result<SemaphoreUnits>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = {
            let mut state = self.inner.borrow_mut();
            let id = self.id;
            let Some(position) = state.waiters.iter().position(|w| w.id == id) else {
                debug_assert!(false, "semaphore waiter vanished");
                return Poll::Ready(Err(Error::semaphore_broken()));
            };
            if matches!(state.waiters[position].state, WaiterState::Waiting) {
                state.waiters[position].waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let waiter = state.waiters.remove(position).expect("position is in range");
            match waiter.state {
                WaiterState::Granted => Ok(()),
                WaiterState::Broken(err) => Err(err),
                WaiterState::Waiting => unreachable!("handled above"),
            }
        };
        self.finished = true;
        Poll::Ready(outcome.map(|()| SemaphoreUnits {
            inner: Rc::clone(&self.inner),
            units: self.units,
        }))
    }
}

impl Drop for SemaphoreWait {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let wakers = {
            let mut state = self.inner.borrow_mut();
            let id = self.id;
            let Some(position) = state.waiters.iter().position(|w| w.id == id) else {
                return;
            };
            let waiter = state.waiters.remove(position).expect("position is in range");
            if matches!(waiter.state, WaiterState::Granted) {
                // granted but never observed; give the units back
                state.units += waiter.units;
                grant_waiters(&mut state)
            } else {
                Vec::new()
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

// === impl SemaphoreUnits ===

impl SemaphoreUnits {
    pub fn units(&self) -> usize {
        self.units
    }
}

impl Drop for SemaphoreUnits {
    fn drop(&mut self) {
        let wakers = {
            let mut state = self.inner.borrow_mut();
            state.units += self.units;
            grant_waiters(&mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl fmt::Debug for SemaphoreUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreUnits")
            .field("units", &self.units)
            .finish()
    }
}

/// Takes `units` from `semaphore`, runs `f`, and returns the units when the
/// produced future settles, on success and failure alike.
pub async fn with_semaphore<F, Fut, T>(semaphore: &Semaphore, units: usize, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: StdFuture<Output = Result<T>>,
{
    let units = semaphore.wait(units).await?;
    let result = f().await;
    drop(units);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;

    #[test]
    fn immediate_grant_when_units_are_available() {
        let _trace = trace_init();
        let shard = Shard::new();
        let sem = Semaphore::new(2);
        let units = shard.block_on(sem.wait(2)).unwrap();
        assert_eq!(sem.available_units(), 0);
        drop(units);
        assert_eq!(sem.available_units(), 2);
    }

    #[test]
    fn waiters_are_served_in_fifo_order() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let sem = Semaphore::new(1);
            let order = Rc::new(RefCell::new(Vec::new()));

            let held = sem.wait(1).await.unwrap();

            let handles: Vec<_> = (0..3u32)
                .map(|i| {
                    let sem = sem.clone();
                    let order = Rc::clone(&order);
                    Shard::current().spawn(async move {
                        let units = sem.wait(1).await?;
                        order.borrow_mut().push(i);
                        drop(units);
                        Ok(())
                    })
                })
                .collect();

            crate::task::yield_now().await;
            drop(held);

            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn try_wait_respects_queued_waiters() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let sem = Semaphore::new(1);
            let held = sem.wait(1).await.unwrap();
            let queued = sem.wait(1);
            assert!(sem.try_wait(1).is_none());
            drop(held);
            queued.await.unwrap();
        });
    }

    #[test]
    fn wait_timeout_expires() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let sem = Semaphore::new(0);
            let err = sem
                .wait_timeout(1, Duration::from_millis(20))
                .await
                .unwrap_err();
            assert!(err.is_semaphore_timed_out());
            // the timed-out waiter must be gone from the queue
            assert_eq!(sem.waiters(), 0);
        });
    }

    #[test]
    fn broken_fails_queued_and_future_waiters() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let sem = Semaphore::new(0);
            let queued = sem.wait(1);
            sem.broken();
            assert!(queued.await.unwrap_err().is_semaphore_broken());
            assert!(sem.wait(1).await.unwrap_err().is_semaphore_broken());
        });
    }

    #[test]
    fn dropping_a_granted_wait_returns_the_units() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let sem = Semaphore::new(1);
            let held = sem.wait(1).await.unwrap();
            let queued = sem.wait(1);
            drop(held);
            // the queued waiter was granted while we never polled it
            drop(queued);
            assert_eq!(sem.available_units(), 1);
        });
    }

    #[test]
    fn with_semaphore_returns_units_on_failure() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let sem = Semaphore::new(1);
            let out: Result<()> =
                with_semaphore(&sem, 1, || async { Err(Error::msg("inner")) }).await;
            assert!(out.is_err());
            assert_eq!(sem.available_units(), 1);
        });
    }
}
