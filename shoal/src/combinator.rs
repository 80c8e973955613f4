// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The loop and scoping combinators.
//!
//! Every looping combinator here consults [`need_preempt`][crate::need_preempt]
//! between synchronously ready steps and yields through the ready queue when
//! the runtime asks for it, so a long chain of ready iterations cannot
//! monopolize the shard.

use crate::defer::{Closeable, defer};
use crate::error::{Error, Result};
use crate::executor::ShardInner;
use crate::sync::{Gate, Lockable, Semaphore};
use crate::task::maybe_yield;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::future::Future as StdFuture;
use std::rc::Rc;

/// Tells [`repeat`] whether to keep looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Yes,
    No,
}

/// Invokes `action` on each element in order, waiting for each returned
/// future to resolve before moving on. Short-circuits on the first failure.
///
/// An empty range resolves immediately.
pub async fn do_for_each<I, F, Fut>(range: I, mut action: F) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: StdFuture<Output = Result<()>>,
{
    for item in range {
        action(item).await?;
        maybe_yield().await;
    }
    Ok(())
}

/// Launches every invocation of `action` eagerly and resolves when all of
/// them have completed. When one or more fail, the failure the scheduler
/// observes first wins and the rest are discarded.
///
/// There is no bound on in-flight work; use
/// [`max_concurrent_for_each`] when the range is large.
pub async fn parallel_for_each<I, F, Fut>(range: I, mut action: F) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: StdFuture<Output = Result<()>>,
{
    let failure: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let work: Vec<_> = range
        .into_iter()
        .map(|item| {
            let fut = action(item);
            let failure = Rc::clone(&failure);
            async move {
                if let Err(err) = fut.await {
                    record_failure(&failure, err);
                }
            }
        })
        .collect();
    futures::future::join_all(work).await;
    match failure.borrow_mut().take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// First completion wins; failures observed after it only make the log.
fn record_failure(failure: &RefCell<Option<Error>>, err: Error) {
    let mut failure = failure.borrow_mut();
    if failure.is_none() {
        *failure = Some(err);
    } else {
        tracing::debug!(error = %err, "additional failure discarded");
    }
}

/// Like [`parallel_for_each`], but with at most `max_concurrent` invocations
/// in flight, enforced by a counting semaphore.
///
/// Each action runs as a background task holding one semaphore unit; the
/// combinator resolves once the range is exhausted and every unit has been
/// returned. A failure stops new launches but never cancels in-flight
/// actions; the first observed failure is surfaced after all work has
/// quiesced. With `max_concurrent == 1` this degenerates to a sequential
/// scan.
pub async fn max_concurrent_for_each<I, F, Fut>(
    range: I,
    max_concurrent: usize,
    mut action: F,
) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: StdFuture<Output = Result<()>> + 'static,
{
    debug_assert!(max_concurrent > 0, "max_concurrent must be positive");
    let max_concurrent = max_concurrent.max(1);
    let shard =
        ShardInner::try_current().expect("max_concurrent_for_each requires a shard on this thread");
    let semaphore = Semaphore::new(max_concurrent);
    let failure: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));

    for item in range {
        if failure.borrow().is_some() {
            break;
        }
        let units = semaphore.wait(1).await?;
        if failure.borrow().is_some() {
            break;
        }
        let fut = action(item);
        let failure = Rc::clone(&failure);
        shard.spawn_detached(shard.current_group(), async move {
            if let Err(err) = fut.await {
                record_failure(&failure, err);
            }
            drop(units);
        });
    }

    // quiesce: the range is done once every unit is back in the pool
    drop(semaphore.wait(max_concurrent).await?);
    match failure.borrow_mut().take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Invokes `action` until it reports [`Stop::Yes`] or fails.
pub async fn repeat<F, Fut>(mut action: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: StdFuture<Output = Result<Stop>>,
{
    loop {
        match action().await? {
            Stop::Yes => return Ok(()),
            Stop::No => maybe_yield().await,
        }
    }
}

/// Evaluates `stop` before each iteration and runs `action` until `stop`
/// reports `true` or an iteration fails.
pub async fn do_until<C, F, Fut>(mut stop: C, mut action: F) -> Result<()>
where
    C: FnMut() -> bool,
    F: FnMut() -> Fut,
    Fut: StdFuture<Output = Result<()>>,
{
    while !stop() {
        action().await?;
        maybe_yield().await;
    }
    Ok(())
}

/// Invokes `action` until it produces a value.
pub async fn repeat_until_value<T, F, Fut>(mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: StdFuture<Output = Result<Option<T>>>,
{
    loop {
        if let Some(value) = action().await? {
            return Ok(value);
        }
        maybe_yield().await;
    }
}

/// Invokes `action` forever; resolves only when an iteration fails.
pub async fn keep_doing<F, Fut>(mut action: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: StdFuture<Output = Result<()>>,
{
    loop {
        action().await?;
        maybe_yield().await;
    }
}

/// Keeps owned state alive across suspension.
///
/// The state is moved into a heap holder; `f` receives a handle to it and the
/// holder is destroyed strictly after the returned future has settled. This
/// is the callback-world rendition of "keep a local alive across `.await`";
/// prefer a plain `let` binding inside `async` code.
pub fn do_with<S, T, F, Fut>(state: S, f: F) -> crate::Future<T>
where
    S: 'static,
    T: 'static,
    F: FnOnce(Rc<RefCell<S>>) -> Fut,
    Fut: StdFuture<Output = Result<T>> + 'static,
{
    let holder = Rc::new(RefCell::new(state));
    let fut = f(Rc::clone(&holder));
    crate::Future::from_future(async move {
        let result = fut.await;
        drop(holder);
        result
    })
}

/// Takes `lock`, runs `f`, and releases the lock exactly once on every exit
/// path, success and failure alike. A lock-acquisition failure is returned
/// without invoking `f`.
pub async fn with_lock<L, F, Fut, T>(lock: &L, f: F) -> Result<T>
where
    L: Lockable + ?Sized,
    F: FnOnce() -> Fut,
    Fut: StdFuture<Output = Result<T>>,
{
    lock.lock().await?;
    let guard = defer(|| lock.unlock());
    let result = f().await;
    drop(guard);
    result
}

/// Enters `gate`, runs `f`, and leaves on completion, success and failure
/// alike. Fails with [`GateClosed`][crate::ErrorKind::GateClosed] without
/// invoking `f` when the gate is already closed.
pub async fn with_gate<F, Fut, T>(gate: &Gate, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: StdFuture<Output = Result<T>>,
{
    let holder = gate.hold()?;
    let result = f().await;
    drop(holder);
    result
}

/// Awaits the opener, hands the opened object to `f` by reference, and closes
/// it on every exit path.
///
/// When only the close fails its error is surfaced; when both `f` and the
/// close fail, `f`'s error wins and the close failure goes to the log.
pub async fn with_file<T, F, R>(open: crate::Future<T>, f: F) -> Result<R>
where
    T: Closeable,
    F: for<'a> FnOnce(&'a mut T) -> LocalBoxFuture<'a, Result<R>>,
{
    let mut file = open.await?;
    let result = f(&mut file).await;
    let close_result = file.close().await;
    match (result, close_result) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), Ok(())) => Err(err),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(err), Err(close_err)) => {
            tracing::error!(error = %close_err, "close failed while handling an earlier failure");
            Err(err)
        }
    }
}
