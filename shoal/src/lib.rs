// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The deferred-computation core of a thread-per-core runtime.
//!
//! One [`Shard`] runs per OS thread: a single-threaded cooperative executor
//! with per-[scheduling-group][sched] ready queues, a timer queue and a
//! preemption flag. On top of it sit the [`Promise`]/[`Future`] pair, the
//! loop and scoping [combinators][combinator], and the shard-local
//! synchronization primitives ([`Gate`], [`Semaphore`], [`SharedMutex`]).
//!
//! Nothing on the per-shard hot path takes a lock, and nothing here is
//! `Send`: tasks, futures and primitives stay on the shard that created
//! them. Cancellation is explicit through [`AbortSource`]s; a dropped future
//! never cancels the work producing it.
//!
//! ```
//! use std::time::Duration;
//!
//! let shard = shoal::Shard::new();
//! let sum = shard.block_on(async {
//!     let held = std::rc::Rc::new(std::cell::Cell::new(0u32));
//!     let total = std::rc::Rc::clone(&held);
//!     shoal::do_for_each(1..=4u32, move |i| {
//!         let total = std::rc::Rc::clone(&total);
//!         async move {
//!             shoal::sleep(Duration::from_millis(1)).await;
//!             total.set(total.get() + i);
//!             Ok(())
//!         }
//!     })
//!     .await
//!     .unwrap();
//!     held.get()
//! });
//! assert_eq!(sum, 10);
//! ```

pub mod abort;
pub mod combinator;
mod defer;
mod error;
pub mod executor;
mod future;
pub mod sched;
pub mod sync;
pub mod task;
pub mod time;

#[cfg(test)]
mod test_util;

pub use abort::{AbortSource, Subscription};
pub use combinator::{
    Stop, do_for_each, do_until, do_with, keep_doing, max_concurrent_for_each, parallel_for_each,
    repeat, repeat_until_value, with_file, with_gate, with_lock,
};
pub use defer::{
    Closeable, Deferred, DeferredClose, DeferredStop, Stoppable, defer, deferred_close,
    deferred_stop,
};
pub use error::{Error, ErrorKind, Result};
pub use executor::{Shard, ShardConfig, current_shard_id, need_preempt, spawn};
pub use future::{Future, Promise};
pub use sched::{
    SchedulingGroup, SchedulingGroupKey, create_scheduling_group, create_scheduling_group_key,
    current_scheduling_group, destroy_scheduling_group, with_scheduling_group,
};
pub use sync::{
    Gate, GateHolder, Lockable, RwLock, Semaphore, SemaphoreUnits, SharedMutex, with_semaphore,
};
pub use task::{maybe_yield, yield_now};
pub use time::{Sleep, sleep, sleep_abortable, sleep_abortable_on_stop, timeout};
