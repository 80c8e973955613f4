// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor::ShardInner;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Captures a callable and runs it when the scope ends, unless cancelled.
pub fn defer<F: FnOnce()>(action: F) -> Deferred<F> {
    Deferred {
        action: Some(action),
    }
}

/// RAII action returned by [`defer`].
#[must_use = "the deferred action runs when this guard is dropped"]
pub struct Deferred<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> Deferred<F> {
    /// Disarms the guard; the action will not run.
    pub fn cancel(&mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for Deferred<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            // a deferred action must not take the process down mid-unwind
            if catch_unwind(AssertUnwindSafe(action)).is_err() {
                tracing::error!("deferred action panicked");
            }
        }
    }
}

impl<F: FnOnce()> fmt::Debug for Deferred<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

/// An object with an asynchronous teardown; see [`deferred_close`].
pub trait Closeable {
    fn close(&mut self) -> crate::Future<()>;
}

/// An object with an asynchronous stop; see [`deferred_stop`].
pub trait Stoppable {
    fn stop(&mut self) -> crate::Future<()>;
}

/// Wraps `obj` so that its [`close`][Closeable::close] runs when the scope
/// ends.
///
/// The release is driven synchronously, which is legal only inside a
/// thread-context ([`Shard::block_on`][crate::Shard::block_on]). Dropping the
/// guard from inside a task is a defect: it is reported and the close runs as
/// a background task instead.
pub fn deferred_close<T: Closeable + 'static>(obj: T) -> DeferredClose<T> {
    DeferredClose { obj: Some(obj) }
}

/// Wraps `obj` so that its [`stop`][Stoppable::stop] runs when the scope
/// ends; the same thread-context rules as [`deferred_close`] apply.
pub fn deferred_stop<T: Stoppable + 'static>(obj: T) -> DeferredStop<T> {
    DeferredStop { obj: Some(obj) }
}

/// RAII close guard returned by [`deferred_close`].
#[must_use = "the object is closed when this guard is dropped"]
pub struct DeferredClose<T: Closeable + 'static> {
    obj: Option<T>,
}

/// RAII stop guard returned by [`deferred_stop`].
#[must_use = "the object is stopped when this guard is dropped"]
pub struct DeferredStop<T: Stoppable + 'static> {
    obj: Option<T>,
}

impl<T: Closeable + 'static> DeferredClose<T> {
    /// Disarms the guard and hands the object back unclosed.
    pub fn into_inner(mut self) -> T {
        self.obj.take().expect("guard still armed")
    }
}

impl<T: Stoppable + 'static> DeferredStop<T> {
    /// Disarms the guard and hands the object back running.
    pub fn into_inner(mut self) -> T {
        self.obj.take().expect("guard still armed")
    }
}

impl<T: Closeable + 'static> Deref for DeferredClose<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.obj.as_ref().expect("guard still armed")
    }
}

impl<T: Closeable + 'static> DerefMut for DeferredClose<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("guard still armed")
    }
}

impl<T: Stoppable + 'static> Deref for DeferredStop<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.obj.as_ref().expect("guard still armed")
    }
}

impl<T: Stoppable + 'static> DerefMut for DeferredStop<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("guard still armed")
    }
}

impl<T: Closeable + 'static> Drop for DeferredClose<T> {
    fn drop(&mut self) {
        let Some(mut obj) = self.obj.take() else {
            return;
        };
        let release = obj.close();
        run_deferred_release("close", release, obj);
    }
}

impl<T: Stoppable + 'static> Drop for DeferredStop<T> {
    fn drop(&mut self) {
        let Some(mut obj) = self.obj.take() else {
            return;
        };
        let release = obj.stop();
        run_deferred_release("stop", release, obj);
    }
}

impl<T: Closeable + 'static> fmt::Debug for DeferredClose<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredClose")
            .field("armed", &self.obj.is_some())
            .finish()
    }
}

impl<T: Stoppable + 'static> fmt::Debug for DeferredStop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredStop")
            .field("armed", &self.obj.is_some())
            .finish()
    }
}

/// Drives a release future to completion, synchronously in a thread-context
/// and as a background task otherwise. The object is kept alive until the
/// release has settled. Never panics: this runs from drop glue.
fn run_deferred_release<T: 'static>(what: &'static str, release: crate::Future<()>, obj: T) {
    match ShardInner::try_current() {
        Some(shard) if !shard.in_task() => {
            if let Err(err) = crate::Shard::current().block_on(release) {
                tracing::error!(error = %err, "deferred {what} failed");
            }
            drop(obj);
        }
        Some(shard) => {
            tracing::error!("deferred {what} dropped inside a task; releasing in the background");
            let group = shard.current_group();
            shard.spawn_detached(group, async move {
                if let Err(err) = release.await {
                    tracing::error!(error = %err, "deferred {what} failed");
                }
                drop(obj);
            });
        }
        None => {
            tracing::error!("deferred {what} dropped without a shard; resource released unclosed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;
    use std::rc::Rc;
    use std::cell::Cell;

    #[test]
    fn deferred_action_runs_at_scope_end() {
        let ran = Rc::new(Cell::new(false));
        {
            let flag = Rc::clone(&ran);
            let _guard = defer(move || flag.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn cancelled_action_does_not_run() {
        let ran = Rc::new(Cell::new(false));
        {
            let flag = Rc::clone(&ran);
            let mut guard = defer(move || flag.set(true));
            guard.cancel();
        }
        assert!(!ran.get());
    }

    struct Closer {
        closed: Rc<Cell<bool>>,
    }

    impl Closeable for Closer {
        fn close(&mut self) -> crate::Future<()> {
            let closed = Rc::clone(&self.closed);
            crate::Future::from_future(async move {
                crate::task::yield_now().await;
                closed.set(true);
                Ok(())
            })
        }
    }

    #[test]
    fn deferred_close_drives_the_close_in_a_thread_context() {
        let _trace = trace_init();
        let shard = Shard::new();
        let closed = Rc::new(Cell::new(false));
        {
            let _guard = deferred_close(Closer {
                closed: Rc::clone(&closed),
            });
            assert!(!closed.get());
        }
        assert!(closed.get());
        drop(shard);
    }

    #[test]
    fn into_inner_skips_the_close() {
        let _trace = trace_init();
        let shard = Shard::new();
        let closed = Rc::new(Cell::new(false));
        let guard = deferred_close(Closer {
            closed: Rc::clone(&closed),
        });
        let _obj = guard.into_inner();
        assert!(!closed.get());
        drop(shard);
    }

    struct Stopper {
        stopped: Rc<Cell<bool>>,
    }

    impl Stoppable for Stopper {
        fn stop(&mut self) -> crate::Future<()> {
            let stopped = Rc::clone(&self.stopped);
            stopped.set(true);
            crate::Future::ready(())
        }
    }

    #[test]
    fn deferred_stop_mirrors_deferred_close() {
        let _trace = trace_init();
        let shard = Shard::new();
        let stopped = Rc::new(Cell::new(false));
        {
            let _guard = deferred_stop(Stopper {
                stopped: Rc::clone(&stopped),
            });
        }
        assert!(stopped.get());
        drop(shard);
    }
}
