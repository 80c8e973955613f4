// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot cancellation signals.
//!
//! Cancellation in this runtime is explicit: an operation that can be
//! cancelled takes a reference to an [`AbortSource`], and cancellation is
//! delivered by firing the source. Nothing aborts a running continuation
//! implicitly.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// A one-shot cancellation signal with ordered subscribers.
pub struct AbortSource {
    inner: Rc<RefCell<AbortInner>>,
}

struct AbortInner {
    aborted: bool,
    next_id: u64,
    subs: Vec<(u64, Box<dyn FnOnce()>)>,
    waiters: Vec<(u64, Waker)>,
}

/// RAII handle for a subscription; dropping it unsubscribes.
pub struct Subscription {
    inner: Weak<RefCell<AbortInner>>,
    id: u64,
}

/// Future returned by [`AbortSource::wait`]; resolves once the source fires.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct AbortWait {
    inner: Rc<RefCell<AbortInner>>,
    id: Option<u64>,
}

// === impl AbortSource ===

impl AbortSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(AbortInner {
                aborted: false,
                next_id: 0,
                subs: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// Fires the source: every subscription callback runs exactly once, in
    /// registration order. Firing again later is a no-op.
    ///
    /// Callbacks run with no internal borrow held, so they are free to
    /// subscribe (which will yield `None`), inspect the source, or fire it
    /// again.
    pub fn request_abort(&self) {
        let subs = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            mem::take(&mut inner.subs)
        };
        tracing::trace!(subscribers = subs.len(), "abort requested");
        for (_, callback) in subs {
            callback();
        }
        let waiters = mem::take(&mut self.inner.borrow_mut().waiters);
        for (_, waker) in waiters {
            waker.wake();
        }
    }

    /// Registers a callback to run when the source fires.
    ///
    /// Returns `None` when the source has already fired; the caller must
    /// handle the abort itself in that case.
    pub fn subscribe<F>(&self, callback: F) -> Option<Subscription>
    where
        F: FnOnce() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subs.push((id, Box::new(callback)));
        Some(Subscription {
            inner: Rc::downgrade(&self.inner),
            id,
        })
    }

    /// A future that resolves when the source fires.
    pub fn wait(&self) -> AbortWait {
        AbortWait {
            inner: Rc::clone(&self.inner),
            id: None,
        }
    }
}

impl Default for AbortSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AbortSource")
            .field("aborted", &inner.aborted)
            .field("subscribers", &inner.subs.len())
            .finish()
    }
}

// === impl Subscription ===

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            let id = self.id;
            inner.subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// === impl AbortWait ===

impl Future for AbortWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if inner.aborted {
            return Poll::Ready(());
        }
        match this.id {
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.waiters.push((id, cx.waker().clone()));
                this.id = Some(id);
            }
            Some(id) => {
                if let Some((_, waker)) = inner.waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    waker.clone_from(cx.waker());
                }
            }
        }
        Poll::Pending
    }
}

impl Drop for AbortWait {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            let mut inner = self.inner.borrow_mut();
            inner.waiters.retain(|(wid, _)| *wid != id);
        }
    }
}

impl fmt::Debug for AbortWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortWait").field("id", &self.id).finish()
    }
}
