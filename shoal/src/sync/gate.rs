// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, Result};
use crate::future::{Future, Promise};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A countdown latch over outstanding operations.
///
/// Every unit of background work [`enter`][Gate::enter]s the gate before it
/// starts and [`leave`][Gate::leave]s when it finishes. [`close`][Gate::close]
/// flips the gate shut, after which new entries fail with
/// [`GateClosed`][crate::ErrorKind::GateClosed], and resolves once the count
/// has drained to zero.
///
/// `Gate` is a cheap handle; clones share the same state.
#[derive(Clone)]
pub struct Gate {
    inner: Rc<RefCell<GateState>>,
}

struct GateState {
    count: u64,
    closed: bool,
    drained: Option<Promise<()>>,
}

/// RAII alternative to a manual [`leave`][Gate::leave]; returned by
/// [`Gate::hold`].
pub struct GateHolder {
    inner: Rc<RefCell<GateState>>,
}

// === impl Gate ===

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GateState {
                count: 0,
                closed: false,
                drained: None,
            })),
        }
    }

    /// Registers one unit of outstanding work.
    ///
    /// # Errors
    ///
    /// Fails with [`GateClosed`][crate::ErrorKind::GateClosed] once
    /// [`close`][Self::close] has been called.
    pub fn enter(&self) -> Result<()> {
        let mut state = self.inner.borrow_mut();
        if state.closed {
            return Err(Error::gate_closed());
        }
        state.count += 1;
        Ok(())
    }

    /// Unregisters one unit of outstanding work. Must pair 1:1 with a
    /// successful [`enter`][Self::enter].
    pub fn leave(&self) {
        leave(&self.inner);
    }

    /// [`enter`][Self::enter], with the matching leave performed by the
    /// returned guard.
    pub fn hold(&self) -> Result<GateHolder> {
        self.enter()?;
        Ok(GateHolder {
            inner: Rc::clone(&self.inner),
        })
    }

    /// Closes the gate: new entries fail from this point on, and the returned
    /// future resolves once the count reaches zero. May be called only once.
    pub fn close(&self) -> Future<()> {
        let mut state = self.inner.borrow_mut();
        if state.closed {
            debug_assert!(false, "close may only be called once per gate");
            return Future::err(Error::msg("gate already closed"));
        }
        state.closed = true;
        if state.count == 0 {
            return Future::ready(());
        }
        let mut promise = Promise::new();
        let drained = promise.get_future();
        state.drained = Some(promise);
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn count(&self) -> u64 {
        self.inner.borrow().count
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Gate")
            .field("count", &state.count)
            .field("closed", &state.closed)
            .finish()
    }
}

fn leave(inner: &Rc<RefCell<GateState>>) {
    let drained = {
        let mut state = inner.borrow_mut();
        debug_assert!(state.count > 0, "leave without a matching enter");
        state.count = state.count.saturating_sub(1);
        if state.count == 0 && state.closed {
            state.drained.take()
        } else {
            None
        }
    };
    if let Some(promise) = drained {
        promise.set_value(());
    }
}

impl Drop for GateState {
    fn drop(&mut self) {
        // an invariant violation, but never a panic inside drop
        if self.count != 0 {
            tracing::error!(
                count = self.count,
                "gate dropped with outstanding operations"
            );
        }
    }
}

// === impl GateHolder ===

impl Drop for GateHolder {
    fn drop(&mut self) {
        leave(&self.inner);
    }
}

impl fmt::Debug for GateHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateHolder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn close_resolves_immediately_when_idle() {
        let _trace = trace_init();
        let shard = Shard::new();
        let gate = Gate::new();
        shard.block_on(gate.close()).unwrap();
        assert!(gate.is_closed());
    }

    #[test]
    fn enter_fails_after_close() {
        let _trace = trace_init();
        let shard = Shard::new();
        let gate = Gate::new();
        shard.block_on(gate.close()).unwrap();
        let err = gate.enter().unwrap_err();
        assert!(err.is_gate_closed());
    }

    #[test]
    fn close_waits_for_every_straggler() {
        let _trace = trace_init();
        let shard = Shard::new();
        shard.block_on(async {
            let gate = Gate::new();

            for delay_ms in [5u64, 10, 15] {
                gate.enter().unwrap();
                let gate = gate.clone();
                drop(Shard::current().spawn(async move {
                    sleep(Duration::from_millis(delay_ms)).await;
                    gate.leave();
                    Ok(())
                }));
            }

            sleep(Duration::from_millis(2)).await;
            let closing = gate.close();
            assert!(gate.enter().unwrap_err().is_gate_closed());
            assert_eq!(gate.count(), 3);

            closing.await.unwrap();
            assert_eq!(gate.count(), 0);
        });
    }

    #[test]
    fn drain_happens_exactly_at_the_last_leave() {
        let _trace = trace_init();
        let shard = Shard::new();
        let gate = Gate::new();
        gate.enter().unwrap();
        gate.enter().unwrap();

        let mut closing = gate.close();
        assert!(!closing.available());
        gate.leave();
        assert!(!closing.available());
        gate.leave();

        shard.block_on(&mut closing).unwrap();
    }

    #[test]
    fn holder_leaves_on_drop() {
        let _trace = trace_init();
        let shard = Shard::new();
        let gate = Gate::new();
        let holder = gate.hold().unwrap();
        assert_eq!(gate.count(), 1);
        drop(holder);
        assert_eq!(gate.count(), 0);
        shard.block_on(gate.close()).unwrap();
    }
}
