// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::task::Waker;
use std::time::Instant;

/// State shared between a registered timer and the future waiting on it.
#[derive(Debug)]
pub(crate) struct TimerShared {
    pub(crate) fired: Cell<bool>,
    pub(crate) waker: RefCell<Option<Waker>>,
}

/// The shard's one-shot timer queue: a min-heap of deadlines with lazily
/// reclaimed cancellations.
///
/// Cancelling removes the entry from the id map only; the heap slot is
/// skipped when it surfaces. The cost is at most one spurious wakeup at the
/// cancelled deadline.
#[derive(Debug)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Rc<TimerShared>>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Arms a one-shot timer for `deadline`.
    pub(crate) fn register(&mut self, deadline: Instant) -> (u64, Rc<TimerShared>) {
        let id = self.next_id;
        self.next_id += 1;
        let shared = Rc::new(TimerShared {
            fired: Cell::new(false),
            waker: RefCell::new(None),
        });
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, Rc::clone(&shared));
        (id, shared)
    }

    /// Disarms a timer; returns `true` iff it had not fired yet.
    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Number of armed (registered, unfired, uncancelled) timers.
    #[cfg(test)]
    pub(crate) fn armed(&self) -> usize {
        self.entries.len()
    }

    /// The earliest armed deadline, possibly a stale (cancelled) one.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|&Reverse((deadline, _))| deadline)
    }

    /// Fires every timer whose deadline has passed, waking its waiter.
    ///
    /// Returns the number of timers fired and the next pending deadline.
    pub(crate) fn turn(&mut self, now: Instant) -> (usize, Option<Instant>) {
        let mut expired = 0;
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            let Some(entry) = self.entries.remove(&id) else {
                // cancelled; reclaim the heap slot and move on
                continue;
            };
            entry.fired.set(true);
            if let Some(waker) = entry.waker.borrow_mut().take() {
                waker.wake();
            }
            expired += 1;
        }
        if expired > 0 {
            tracing::trace!(expired, "timer turn");
        }
        (expired, self.next_deadline())
    }
}
