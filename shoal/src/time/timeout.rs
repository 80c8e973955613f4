// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::sleep::{Sleep, sleep};
use pin_project::pin_project;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Requires a future to complete before `duration` has elapsed.
///
/// On expiry the inner future is dropped; the work it represents is not
/// cancelled beyond whatever its own drop releases.
pub fn timeout<F>(duration: Duration, future: F) -> Timeout<F::IntoFuture>
where
    F: IntoFuture,
{
    Timeout {
        sleep: sleep(duration),
        future: future.into_future(),
    }
}

/// Future returned by [`timeout`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    sleep: Sleep,
    #[pin]
    future: F,
}

/// The deadline elapsed before the inner future completed.
#[derive(Debug)]
pub struct Elapsed(pub(crate) ());

impl<F> Timeout<F> {
    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        if let Poll::Ready(value) = me.future.poll(cx) {
            return Poll::Ready(Ok(value));
        }

        match Pin::new(me.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;

    #[test]
    fn completes_before_the_deadline() {
        let _trace = trace_init();
        let shard = Shard::new();
        let out = shard.block_on(async {
            timeout(Duration::from_secs(5), async { 17 }).await
        });
        assert_eq!(out.unwrap(), 17);
    }

    #[test]
    fn elapses_when_the_future_stalls() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let slow = crate::time::sleep(Duration::from_secs(60));
            let out = timeout(Duration::from_millis(20), slow).await;
            assert!(out.is_err());
        });
    }
}
