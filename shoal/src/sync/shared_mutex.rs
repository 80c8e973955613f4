// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::future::Future;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Something that can be locked asynchronously and unlocked synchronously;
/// the contract [`with_lock`][crate::combinator::with_lock] is written
/// against.
pub trait Lockable {
    fn lock(&self) -> Future<()>;
    fn unlock(&self);
}

/// A fair reader/writer mutex for shard-local state.
///
/// Acquisition is FIFO with a writer-bias tie-break on wakeup: when the lock
/// is released, a writer at the head of the queue is granted as soon as the
/// last reader leaves, and otherwise the prefix of queued readers up to the
/// next writer is granted as a group. Writers therefore wait a bounded number
/// of release events and readers cannot starve them.
///
/// `SharedMutex` is a cheap handle; clones share the same lock.
#[derive(Clone)]
pub struct SharedMutex {
    inner: Rc<RefCell<MutexState>>,
}

struct MutexState {
    readers: u64,
    writer: bool,
    waiters: VecDeque<MutexWaiter>,
    next_id: u64,
}

struct MutexWaiter {
    id: u64,
    write: bool,
    granted: bool,
    waker: Option<Waker>,
}

// === impl SharedMutex ===

impl SharedMutex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(MutexState {
                readers: 0,
                writer: false,
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Acquires the lock in shared mode; succeeds immediately iff no writer
    /// holds the lock and none is queued.
    pub fn lock_shared(&self) -> Future<()> {
        let mut state = self.inner.borrow_mut();
        if !state.writer && state.waiters.is_empty() {
            state.readers += 1;
            return Future::ready(());
        }
        let id = enqueue(&mut state, false);
        drop(state);
        Future::from_future(Acquire {
            inner: Rc::clone(&self.inner),
            id,
            write: false,
            finished: false,
        })
    }

    /// Acquires the lock exclusively; succeeds immediately iff the lock is
    /// idle and nobody is queued.
    pub fn lock_exclusive(&self) -> Future<()> {
        let mut state = self.inner.borrow_mut();
        if !state.writer && state.readers == 0 && state.waiters.is_empty() {
            state.writer = true;
            return Future::ready(());
        }
        let id = enqueue(&mut state, true);
        drop(state);
        Future::from_future(Acquire {
            inner: Rc::clone(&self.inner),
            id,
            write: true,
            finished: false,
        })
    }

    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.inner.borrow_mut();
        if !state.writer && state.waiters.is_empty() {
            state.readers += 1;
            true
        } else {
            false
        }
    }

    pub fn try_lock_exclusive(&self) -> bool {
        let mut state = self.inner.borrow_mut();
        if !state.writer && state.readers == 0 && state.waiters.is_empty() {
            state.writer = true;
            true
        } else {
            false
        }
    }

    pub fn unlock_shared(&self) {
        let wakers = {
            let mut state = self.inner.borrow_mut();
            debug_assert!(state.readers > 0, "unlock_shared without a shared lock");
            state.readers = state.readers.saturating_sub(1);
            wake_waiters(&mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn unlock_exclusive(&self) {
        let wakers = {
            let mut state = self.inner.borrow_mut();
            debug_assert!(state.writer, "unlock_exclusive without the exclusive lock");
            state.writer = false;
            wake_waiters(&mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("SharedMutex")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// [`Lockable`] in exclusive mode, matching the scoped-lock helper.
impl Lockable for SharedMutex {
    fn lock(&self) -> Future<()> {
        self.lock_exclusive()
    }

    fn unlock(&self) {
        self.unlock_exclusive();
    }
}

fn enqueue(state: &mut MutexState, write: bool) -> u64 {
    let id = state.next_id;
    state.next_id += 1;
    state.waiters.push_back(MutexWaiter {
        id,
        write,
        granted: false,
        waker: None,
    });
    id
}

/// The wakeup policy: grant the head writer iff the lock is idle, otherwise
/// grant the prefix of readers up to the next queued writer. The state
/// mutation happens at grant time, so the exclusion invariants hold at every
/// instant regardless of when the woken futures run.
fn wake_waiters(state: &mut MutexState) -> Vec<Waker> {
    let mut wakers = Vec::new();
    for waiter in state.waiters.iter_mut() {
        if waiter.write {
            if !waiter.granted && state.readers == 0 && !state.writer {
                // head-of-queue writer with an idle lock
                state.writer = true;
                waiter.granted = true;
                if let Some(waker) = waiter.waker.take() {
                    wakers.push(waker);
                }
            }
            // nothing behind a writer is granted
            break;
        }
        if state.writer {
            break;
        }
        if !waiter.granted {
            state.readers += 1;
            waiter.granted = true;
            if let Some(waker) = waiter.waker.take() {
                wakers.push(waker);
            }
        }
    }
    wakers
}

struct Acquire {
    inner: Rc<RefCell<MutexState>>,
    id: u64,
    write: bool,
    finished: bool,
}

impl StdFuture for Acquire {
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        {
            let mut state = self.inner.borrow_mut();
            let id = self.id;
            let Some(position) = state.waiters.iter().position(|w| w.id == id) else {
                debug_assert!(false, "mutex waiter vanished");
                return Poll::Ready(Ok(()));
            };
            if !state.waiters[position].granted {
                state.waiters[position].waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            state.waiters.remove(position);
        }
        self.finished = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Acquire {
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
            if waiter.granted {
                // granted but never observed; release the grant
                if waiter.write {
                    state.writer = false;
                } else {
                    state.readers = state.readers.saturating_sub(1);
                }
                wake_waiters(&mut state)
            } else {
                Vec::new()
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

/// A reader/writer lock presented as two [`Lockable`] views over a
/// [`SharedMutex`].
#[derive(Clone, Debug, Default)]
pub struct RwLock {
    mutex: SharedMutex,
}

/// The shared view of an [`RwLock`].
#[derive(Debug)]
pub struct RwLockRead<'a>(&'a SharedMutex);

/// The exclusive view of an [`RwLock`].
#[derive(Debug)]
pub struct RwLockWrite<'a>(&'a SharedMutex);

impl RwLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mutex: SharedMutex::new(),
        }
    }

    pub fn for_read(&self) -> RwLockRead<'_> {
        RwLockRead(&self.mutex)
    }

    pub fn for_write(&self) -> RwLockWrite<'_> {
        RwLockWrite(&self.mutex)
    }
}

impl RwLockRead<'_> {
    pub fn lock(&self) -> Future<()> {
        self.0.lock_shared()
    }

    pub fn try_lock(&self) -> bool {
        self.0.try_lock_shared()
    }

    pub fn unlock(&self) {
        self.0.unlock_shared();
    }
}

impl Lockable for RwLockRead<'_> {
    fn lock(&self) -> Future<()> {
        self.0.lock_shared()
    }

    fn unlock(&self) {
        self.0.unlock_shared();
    }
}

impl RwLockWrite<'_> {
    pub fn lock(&self) -> Future<()> {
        self.0.lock_exclusive()
    }

    pub fn try_lock(&self) -> bool {
        self.0.try_lock_exclusive()
    }

    pub fn unlock(&self) {
        self.0.unlock_exclusive();
    }
}

impl Lockable for RwLockWrite<'_> {
    fn lock(&self) -> Future<()> {
        self.0.lock_exclusive()
    }

    fn unlock(&self) {
        self.0.unlock_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;
    use crate::time::sleep;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn exclusive_excludes_readers_and_writers() {
        let _trace = trace_init();
        let shard = Shard::new();
        let mutex = SharedMutex::new();
        shard.block_on(mutex.lock_exclusive()).unwrap();
        assert!(!mutex.try_lock_shared());
        assert!(!mutex.try_lock_exclusive());
        mutex.unlock_exclusive();
        assert!(mutex.try_lock_shared());
        mutex.unlock_shared();
    }

    #[test]
    fn readers_share_the_lock() {
        let _trace = trace_init();
        let shard = Shard::new();
        let mutex = SharedMutex::new();
        shard.block_on(mutex.lock_shared()).unwrap();
        assert!(mutex.try_lock_shared());
        assert!(!mutex.try_lock_exclusive());
        mutex.unlock_shared();
        mutex.unlock_shared();
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let mutex = SharedMutex::new();
            mutex.lock_shared().await.unwrap();

            // a writer queues behind the reader
            let writer = mutex.lock_exclusive();
            // fairness: a new reader must not overtake the queued writer
            assert!(!mutex.try_lock_shared());
            let reader = mutex.lock_shared();

            mutex.unlock_shared();
            writer.await.unwrap();
            mutex.unlock_exclusive();
            reader.await.unwrap();
            mutex.unlock_shared();
        });
    }

    #[test]
    fn release_wakes_the_reader_prefix_as_a_group() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let mutex = SharedMutex::new();
            mutex.lock_exclusive().await.unwrap();

            let r1 = mutex.lock_shared();
            let r2 = mutex.lock_shared();
            let w = mutex.lock_exclusive();
            let r3 = mutex.lock_shared();

            mutex.unlock_exclusive();
            // both leading readers hold the lock now, the writer and the
            // trailing reader still wait
            r1.await.unwrap();
            r2.await.unwrap();
            assert!(!mutex.try_lock_exclusive());

            mutex.unlock_shared();
            mutex.unlock_shared();
            w.await.unwrap();
            mutex.unlock_exclusive();
            r3.await.unwrap();
            mutex.unlock_shared();
        });
    }

    #[test]
    fn contended_exclusive_sections_never_overlap() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let mutex = SharedMutex::new();
            let in_section = Rc::new(Cell::new(0u32));

            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let mutex = mutex.clone();
                    let in_section = Rc::clone(&in_section);
                    Shard::current().spawn(async move {
                        mutex.lock_exclusive().await?;
                        in_section.set(in_section.get() + 1);
                        assert_eq!(in_section.get(), 1);
                        sleep(Duration::from_millis(1)).await;
                        assert_eq!(in_section.get(), 1);
                        in_section.set(in_section.get() - 1);
                        mutex.unlock_exclusive();
                        Ok(())
                    })
                })
                .collect();

            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(in_section.get(), 0);
            assert!(mutex.try_lock_exclusive());
        });
    }

    #[test]
    fn rwlock_views_map_to_the_two_modes() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let rw = RwLock::new();
            rw.for_read().lock().await.unwrap();
            assert!(rw.for_read().try_lock());
            assert!(!rw.for_write().try_lock());
            rw.for_read().unlock();
            rw.for_read().unlock();

            rw.for_write().lock().await.unwrap();
            assert!(!rw.for_read().try_lock());
            rw.for_write().unlock();
        });
    }
}
