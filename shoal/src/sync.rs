// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shard-local synchronization primitives.
//!
//! Everything here is `!Send` and lock-free in the OS sense: waiter queues
//! are plain deques behind [`RefCell`][std::cell::RefCell]s, which is all a
//! single-threaded shard needs. Fairness is FIFO throughout.

mod gate;
mod semaphore;
mod shared_mutex;

pub use gate::{Gate, GateHolder};
pub use semaphore::{Semaphore, SemaphoreUnits, with_semaphore};
pub use shared_mutex::{Lockable, RwLock, RwLockRead, RwLockWrite, SharedMutex};
