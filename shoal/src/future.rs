// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, Result, report_broken_promise, report_unhandled_exception};
use crate::executor::{ShardInner, need_preempt};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// The write end of a deferred value channel.
///
/// Exactly one of [`set_value`][Self::set_value] / [`set_error`][Self::set_error]
/// is called, at most once; both consume the promise. Dropping an unresolved
/// promise resolves its future with a [`BrokenPromise`][crate::ErrorKind::BrokenPromise]
/// error and reports through the logging hook.
pub struct Promise<T> {
    shared: Option<Rc<RefCell<Shared<T>>>>,
}

/// A handle to a pending or resolved result.
///
/// `Future<T>` implements [`std::future::Future`] with output `Result<T>`,
/// so `.await` is the primary way to chain continuations; the `then` family
/// below exists for callback-shaped call sites and for ready-future fast
/// paths. A future is consumed exactly once: by awaiting it, by one of the
/// consuming combinators, by [`forward_to`][Self::forward_to], by
/// [`get`][Self::get] inside a thread-context, or by dropping it. Dropping a
/// failed future whose error was never observed is reported through the
/// logging hook.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Future<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    /// An immediately available result (or, after consumption, `None`).
    Ready(Option<Result<T>>),
    /// Linked to a live promise.
    Linked(Rc<RefCell<Shared<T>>>),
    /// A continuation chain built by one of the `then` combinators.
    Chained(LocalBoxFuture<'static, Result<T>>),
}

struct Shared<T> {
    result: Option<Result<T>>,
    /// At most one waiter: installing a second continuation on the same
    /// future is impossible because consumption is by value.
    waker: Option<Waker>,
    future_taken: bool,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // both ends are gone; a failure still stored here was never observed
        if let Some(Err(err)) = &self.result {
            report_unhandled_exception(err);
        }
    }
}

// === impl Promise ===

impl<T> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Some(Rc::new(RefCell::new(Shared {
                result: None,
                waker: None,
                future_taken: false,
            }))),
        }
    }

    /// The future this promise will resolve.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn get_future(&mut self) -> Future<T> {
        let shared = self
            .shared
            .as_ref()
            .expect("get_future called on a resolved promise");
        {
            let mut shared = shared.borrow_mut();
            assert!(!shared.future_taken, "get_future may only be called once");
            shared.future_taken = true;
        }
        Future {
            inner: Inner::Linked(Rc::clone(shared)),
        }
    }

    pub fn set_value(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn set_error(self, error: Error) {
        self.resolve(Err(error));
    }

    /// Resolves the promise with a full result, waking the future's waiter.
    ///
    /// Resolving a promise whose future was dropped is a no-op, except that a
    /// discarded failure is reported when the channel is torn down.
    pub fn resolve(mut self, result: Result<T>) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let waker = {
            let mut shared = shared.borrow_mut();
            debug_assert!(shared.result.is_none(), "promise resolved twice");
            shared.result = Some(result);
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let waker = {
            let mut shared = shared.borrow_mut();
            if shared.result.is_some() {
                return;
            }
            report_broken_promise();
            shared.result = Some(Err(Error::broken_promise()));
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.shared.is_none())
            .finish()
    }
}

// === impl Future ===

impl<T> Future<T> {
    /// A future that is immediately available with `value`.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::Ready(Some(Ok(value))),
        }
    }

    /// A future that is immediately failed with `error`.
    pub fn err(error: Error) -> Self {
        Self {
            inner: Inner::Ready(Some(Err(error))),
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    /// Returns `true` when the result can be taken without suspending.
    pub fn available(&self) -> bool {
        match &self.inner {
            Inner::Ready(slot) => slot.is_some(),
            Inner::Linked(shared) => shared.borrow().result.is_some(),
            Inner::Chained(_) => false,
        }
    }

    /// Returns `true` when the future is available and carries a failure.
    pub fn failed(&self) -> bool {
        match &self.inner {
            Inner::Ready(slot) => matches!(slot, Some(Err(_))),
            Inner::Linked(shared) => matches!(shared.borrow().result, Some(Err(_))),
            Inner::Chained(_) => false,
        }
    }

    /// Consumes an available result, leaving the future spent.
    fn take_ready(&mut self) -> Option<Result<T>> {
        match &mut self.inner {
            Inner::Ready(slot) => slot.take(),
            Inner::Linked(shared) => shared.borrow_mut().result.take(),
            Inner::Chained(_) => None,
        }
    }

    /// Consumes and discards an available result, failure included.
    ///
    /// This is the one way to drop a failed future without triggering the
    /// unhandled-failure report.
    pub fn ignore_ready_future(mut self) {
        debug_assert!(
            self.available(),
            "ignore_ready_future called on a pending future"
        );
        let _ = self.take_ready();
    }
}

impl<T: 'static> Future<T> {
    /// Wraps any future resolving to a `Result<T>`.
    pub fn from_future<F>(future: F) -> Self
    where
        F: StdFuture<Output = Result<T>> + 'static,
    {
        Self {
            inner: Inner::Chained(future.boxed_local()),
        }
    }

    /// Chains a continuation invoked with the value; a failure skips `f` and
    /// propagates unchanged.
    ///
    /// If the future is already available and the runtime is not asking for a
    /// preemption point, `f` runs inline without going through the ready
    /// queue. For continuations producing a plain value rather than a future,
    /// see [`map`][Self::map].
    pub fn then<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        if self.available() && !need_preempt() {
            return match self.take_ready().expect("available") {
                Ok(value) => f(value),
                Err(err) => Future::err(err),
            };
        }
        Future::from_future(async move {
            match self.await {
                Ok(value) => f(value).await,
                Err(err) => Err(err),
            }
        })
    }

    /// Like [`then`][Self::then], for continuations returning a plain value.
    pub fn map<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        if self.available() && !need_preempt() {
            return Future::from_result(self.take_ready().expect("available").map(f));
        }
        Future::from_future(async move { self.await.map(f) })
    }

    /// Chains a continuation that receives the full result and may inspect
    /// either side of it.
    pub fn then_wrapped<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(Result<T>) -> Future<U> + 'static,
    {
        if self.available() && !need_preempt() {
            return f(self.take_ready().expect("available"));
        }
        Future::from_future(async move { f(self.await).await })
    }

    /// Runs `f` regardless of the outcome and forwards the original result.
    pub fn finally<F>(mut self, f: F) -> Future<T>
    where
        F: FnOnce() + 'static,
    {
        if self.available() && !need_preempt() {
            let result = self.take_ready().expect("available");
            f();
            return Future::from_result(result);
        }
        Future::from_future(async move {
            let result = self.await;
            f();
            result
        })
    }

    /// Invokes `f` only on failure; `f` may convert the failure back into a
    /// value.
    pub fn handle_exception<F>(mut self, f: F) -> Future<T>
    where
        F: FnOnce(Error) -> Result<T> + 'static,
    {
        if self.available() && !need_preempt() {
            return match self.take_ready().expect("available") {
                Err(err) => Future::from_result(f(err)),
                ok => Future::from_result(ok),
            };
        }
        Future::from_future(async move {
            match self.await {
                Err(err) => f(err),
                ok => ok,
            }
        })
    }

    /// Transfers this future's eventual result into `promise`.
    ///
    /// An unavailable future is driven by a background task, so this requires
    /// a shard on the calling thread.
    pub fn forward_to(mut self, promise: Promise<T>) {
        if let Some(result) = self.take_ready() {
            promise.resolve(result);
            return;
        }
        let shard = ShardInner::try_current().expect("forward_to requires a shard on this thread");
        let group = shard.current_group();
        shard.spawn_detached(group, async move {
            promise.resolve(self.await);
        });
    }

    /// Blocks until the future resolves and returns the result.
    ///
    /// Legal only in a thread-context (outside any task); see
    /// [`Shard::block_on`][crate::Shard::block_on]. An available future can be
    /// `get` anywhere without blocking.
    pub fn get(mut self) -> Result<T> {
        self.wait();
        self.take_ready().expect("wait returned without a result")
    }

    /// Blocks until the future resolves, leaving the result in place.
    pub fn wait(&mut self) {
        if self.available() {
            return;
        }
        let shard = ShardInner::try_current().expect("Future::wait requires a shard on this thread");
        if shard.in_task() {
            debug_assert!(false, "Future::wait called from inside a task; use .await instead");
            tracing::error!("Future::wait called from inside a task; use .await instead");
        }
        drop(shard);
        let result = crate::Shard::current().block_on(&mut *self);
        self.inner = Inner::Ready(Some(result));
    }
}

// Safety note in spirit: `Future` never hands out pinned projections of `T`;
// all accesses move through `&mut self`, so pinning it promises nothing.
impl<T> Unpin for Future<T> {}

impl<T> StdFuture for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Ready(slot) => match slot.take() {
                Some(result) => Poll::Ready(result),
                None => consumed_again(),
            },
            Inner::Linked(shared) => {
                let result = {
                    let mut shared = shared.borrow_mut();
                    match shared.result.take() {
                        Some(result) => result,
                        None => {
                            shared.waker = Some(cx.waker().clone());
                            return Poll::Pending;
                        }
                    }
                };
                this.inner = Inner::Ready(None);
                Poll::Ready(result)
            }
            Inner::Chained(future) => match future.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    this.inner = Inner::Ready(None);
                    Poll::Ready(result)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        // Linked failures are reported by `Shared::drop` once both ends are
        // gone; chained failures by the dropped inner future.
        if let Inner::Ready(Some(Err(err))) = &self.inner {
            report_unhandled_exception(err);
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            Inner::Ready(Some(Ok(_))) => "value",
            Inner::Ready(Some(Err(_))) => "failed",
            Inner::Ready(None) => "consumed",
            Inner::Linked(shared) if shared.borrow().result.is_some() => "resolved",
            Inner::Linked(_) => "pending",
            Inner::Chained(_) => "chained",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

fn consumed_again<T>() -> Poll<Result<T>> {
    debug_assert!(false, "future polled after completion");
    tracing::error!("future polled after completion");
    Poll::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;
    use std::cell::Cell;

    #[test]
    fn ready_future_resolves_inline() {
        let fut = Future::ready(7);
        assert!(fut.available());
        assert!(!fut.failed());
        assert_eq!(fut.get().unwrap(), 7);
    }

    #[test]
    fn then_identity_preserves_the_value() {
        let out = Future::ready(3).then(Future::ready).get();
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn then_skips_the_callback_on_failure() {
        let called = Rc::new(Cell::new(false));
        let flag = Rc::clone(&called);
        let out = Future::<u32>::err(Error::msg("boom"))
            .then(move |v| {
                flag.set(true);
                Future::ready(v)
            })
            .get();
        assert!(!called.get());
        assert_eq!(out.unwrap_err().to_string(), "boom");
    }

    #[test]
    fn map_applies_on_the_fast_path() {
        let out = Future::ready(2).map(|v| v * 21).get();
        assert_eq!(out.unwrap(), 42);
    }

    #[test]
    fn then_wrapped_observes_both_sides() {
        let ok = Future::ready(1)
            .then_wrapped(|res| Future::ready(res.is_ok()))
            .get();
        assert!(ok.unwrap());

        let err = Future::<u32>::err(Error::msg("x"))
            .then_wrapped(|res| Future::ready(res.is_err()))
            .get();
        assert!(err.unwrap());
    }

    #[test]
    fn finally_is_the_identity_and_runs_on_both_paths() {
        let ran = Rc::new(Cell::new(0));

        let counter = Rc::clone(&ran);
        let ok = Future::ready(5)
            .finally(move || counter.set(counter.get() + 1))
            .get();
        assert_eq!(ok.unwrap(), 5);

        let counter = Rc::clone(&ran);
        let err = Future::<u32>::err(Error::msg("fail"))
            .finally(move || counter.set(counter.get() + 1))
            .get();
        assert!(err.is_err());
        assert_eq!(ran.get(), 2);
    }

    #[test]
    fn handle_exception_converts_failures() {
        let out = Future::<u32>::err(Error::msg("gone"))
            .handle_exception(|_| Ok(11))
            .get();
        assert_eq!(out.unwrap(), 11);

        let untouched = Future::ready(4).handle_exception(|_| Ok(0)).get();
        assert_eq!(untouched.unwrap(), 4);
    }

    #[test]
    fn dropping_an_unresolved_promise_breaks_the_future() {
        let _trace = trace_init();
        let shard = Shard::new();
        let mut promise = Promise::<u32>::new();
        let fut = promise.get_future();
        drop(promise);
        let err = shard.block_on(fut).unwrap_err();
        assert!(err.is_broken_promise());
    }

    #[test]
    fn resolving_an_orphan_promise_is_a_no_op() {
        let mut promise = Promise::new();
        drop(promise.get_future());
        promise.set_value(9);
    }

    #[test]
    fn forward_to_preserves_value_and_error() {
        let _trace = trace_init();
        let shard = Shard::new();

        let mut target = Promise::new();
        let forwarded = target.get_future();
        Future::ready(13).forward_to(target);
        assert_eq!(shard.block_on(forwarded).unwrap(), 13);

        let mut target = Promise::<u32>::new();
        let forwarded = target.get_future();
        Future::err(Error::msg("carried")).forward_to(target);
        let err = shard.block_on(forwarded).unwrap_err();
        assert_eq!(err.to_string(), "carried");
    }

    #[test]
    fn forward_to_drives_pending_futures_through_a_task() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let mut source = Promise::new();
            let pending = source.get_future();
            let mut target = Promise::new();
            let forwarded = target.get_future();

            pending.forward_to(target);
            drop(Shard::current().spawn(async move {
                source.set_value(21);
                Ok(())
            }));

            assert_eq!(forwarded.await.unwrap(), 21);
        });
    }

    #[test]
    fn promise_resolution_wakes_the_awaiting_task() {
        let _trace = trace_init();
        let shard = Shard::new();
        let out = shard.block_on(async {
            let mut promise = Promise::new();
            let fut = promise.get_future();
            drop(Shard::current().spawn(async move {
                crate::task::yield_now().await;
                promise.set_value(8);
                Ok(())
            }));
            fut.await
        });
        assert_eq!(out.unwrap(), 8);
    }

    #[test]
    fn get_drives_the_shard_outside_a_task() {
        let _trace = trace_init();
        let shard = Shard::new();
        let mut promise = Promise::new();
        let fut = promise.get_future();
        drop(shard.spawn(async move {
            promise.set_value("done");
            Ok(())
        }));
        assert_eq!(fut.get().unwrap(), "done");
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "future polled after completion")]
    fn double_consume_is_a_defect() {
        use futures::task::noop_waker;
        let mut fut = Future::ready(1);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = Pin::new(&mut fut).poll(&mut cx);
        let _ = Pin::new(&mut fut).poll(&mut cx);
    }

    #[test]
    fn ignore_ready_future_swallows_failures() {
        Future::<u32>::err(Error::msg("ignored")).ignore_ready_future();
    }
}
