// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields execution back to the shard's dispatch loop once.
///
/// The current task is put at the back of its group's ready queue, letting
/// other runnable tasks (and other groups) make progress first.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Yields only when the runtime has requested a preemption point.
///
/// This is the check every loop combinator performs between synchronously
/// ready steps: cheap when the preemption flag is clear, a full trip through
/// the ready queue when it is set.
pub async fn maybe_yield() {
    if crate::executor::need_preempt() {
        yield_now().await;
    }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
