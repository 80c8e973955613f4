// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-shard timers and sleeps.
//!
//! The shard's timer queue is the only reactor facility this core owns:
//! sleeps register with it on first poll and are fired when the dispatch
//! loop turns the queue between task batches. A due deadline is therefore
//! observed at the next timer poll, never synchronously.

mod sleep;
mod timeout;
pub(crate) mod timer;

pub use sleep::{Sleep, sleep, sleep_abortable, sleep_abortable_on_stop};
pub use timeout::{Elapsed, Timeout, timeout};
