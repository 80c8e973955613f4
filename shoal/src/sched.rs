// Copyright 2025 the shoal authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduling groups: named share-weighted lanes within a shard.
//!
//! Group creation and destruction go through a process-wide registry behind
//! a plain mutex; this is a cold path. Everything per-shard (ready queues,
//! the lazily built specific values) stays lock-free on the shard itself.

use crate::error::{Error, Result};
use crate::executor::ShardInner;
use std::any::Any;
use std::fmt;
use std::future::Future as StdFuture;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

/// Size of the scheduling-group index table; group indices are dense and
/// recycled on destruction.
pub const MAX_SCHEDULING_GROUPS: usize = 16;

/// Default share weight of the main group and of groups whose registration
/// can no longer be found.
const DEFAULT_SHARES: u32 = 1000;

/// A handle to a scheduling group: a small dense index into the per-shard
/// queue and storage tables.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulingGroup {
    index: u8,
}

/// A typed key into the per-group "specific" storage, allocated by
/// [`create_scheduling_group_key`].
pub struct SchedulingGroupKey<T> {
    index: usize,
    _type: PhantomData<fn() -> T>,
}

struct GroupEntry {
    name: String,
    shares: u32,
    generation: u64,
}

struct KeyEntry {
    ctor: Box<dyn Fn() -> Box<dyn Any> + Send + Sync>,
}

struct Registry {
    slots: Vec<Option<GroupEntry>>,
    keys: Vec<Arc<KeyEntry>>,
    next_generation: u64,
}

/// Per-shard, per-group storage of specific values, owned by the shard.
#[derive(Default)]
pub(crate) struct GroupLocal {
    generation: u64,
    values: Vec<Option<Box<dyn Any>>>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| {
    let mut slots: Vec<Option<GroupEntry>> = (0..MAX_SCHEDULING_GROUPS).map(|_| None).collect();
    slots[0] = Some(GroupEntry {
        name: String::from("main"),
        shares: DEFAULT_SHARES,
        generation: 0,
    });
    Mutex::new(Registry {
        slots,
        keys: Vec::new(),
        next_generation: 1,
    })
});

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

// === impl SchedulingGroup ===

impl SchedulingGroup {
    /// The main group every task belongs to unless told otherwise.
    #[must_use]
    pub fn main() -> Self {
        Self { index: 0 }
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self {
            index: u8::try_from(index).expect("group index fits the table"),
        }
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.index)
    }

    /// The group's registered name, or `None` if it has been destroyed.
    pub fn name(&self) -> Option<String> {
        registry().slots[self.index()]
            .as_ref()
            .map(|entry| entry.name.clone())
    }

    /// The group's registered share weight, or `None` if it has been
    /// destroyed.
    pub fn shares(&self) -> Option<u32> {
        registry().slots[self.index()].as_ref().map(|entry| entry.shares)
    }
}

impl Default for SchedulingGroup {
    fn default() -> Self {
        Self::main()
    }
}

impl fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingGroup")
            .field("index", &self.index)
            .finish()
    }
}

impl<T> Clone for SchedulingGroupKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SchedulingGroupKey<T> {}

impl<T> fmt::Debug for SchedulingGroupKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingGroupKey")
            .field("index", &self.index)
            .finish()
    }
}

/// Registers a scheduling group with the given share weight.
///
/// Fails when `name` is empty or when the index table is full. The handle is
/// valid on every shard; per-shard state materializes lazily on first use.
pub fn create_scheduling_group(name: &str, shares: u32) -> crate::Future<SchedulingGroup> {
    if name.is_empty() {
        return crate::Future::err(Error::msg("scheduling group name may not be empty"));
    }
    let mut registry = registry();
    let Some(index) = registry.slots.iter().position(Option::is_none) else {
        return crate::Future::err(Error::msg("scheduling group table is full"));
    };
    let generation = registry.next_generation;
    registry.next_generation += 1;
    registry.slots[index] = Some(GroupEntry {
        name: String::from(name),
        shares,
        generation,
    });
    tracing::debug!(name, shares, index, "scheduling group created");
    crate::Future::ready(SchedulingGroup::from_index(index))
}

/// Unregisters a scheduling group and drops the calling shard's specific
/// values for it; other shards reclaim theirs lazily. The index becomes
/// available for reuse.
pub fn destroy_scheduling_group(group: SchedulingGroup) -> crate::Future<()> {
    if group.index() == 0 {
        return crate::Future::err(Error::msg("the main scheduling group cannot be destroyed"));
    }
    {
        let mut registry = registry();
        if registry.slots[group.index()].take().is_none() {
            return crate::Future::err(Error::msg("scheduling group already destroyed"));
        }
    }
    if let Some(shard) = ShardInner::try_current() {
        let mut specifics = shard.specifics.borrow_mut();
        if let Some(local) = specifics.get_mut(group.index()) {
            *local = GroupLocal::default();
        }
    }
    tracing::debug!(index = group.index(), "scheduling group destroyed");
    crate::Future::ready(())
}

/// The share weight the shard's queue should run `group` at.
pub(crate) fn group_shares(group: SchedulingGroup) -> u32 {
    registry().slots[group.index()]
        .as_ref()
        .map_or(DEFAULT_SHARES, |entry| entry.shares)
}

/// Allocates a key whose per-group value is built lazily by `constructor`
/// the first time each group touches it on a shard.
pub fn create_scheduling_group_key<T, F>(constructor: F) -> SchedulingGroupKey<T>
where
    T: 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    let ctor: Box<dyn Fn() -> Box<dyn Any> + Send + Sync> = Box::new(move || {
        let value: Box<dyn Any> = Box::new(constructor());
        value
    });
    let mut registry = registry();
    let index = registry.keys.len();
    registry.keys.push(Arc::new(KeyEntry { ctor }));
    SchedulingGroupKey {
        index,
        _type: PhantomData,
    }
}

/// Runs `f` with the current group's specific value for `key`, constructing
/// it first if this is the group's first access on this shard.
///
/// `f` must not reenter the specific storage of the same shard.
///
/// # Panics
///
/// Panics if no shard runs on this thread or if `key` is used with a type it
/// was not created with.
pub fn with_specific<T, R, F>(key: SchedulingGroupKey<T>, f: F) -> R
where
    T: 'static,
    F: FnOnce(&mut T) -> R,
{
    with_specific_in(current_scheduling_group(), key, f)
}

/// [`with_specific`] for an explicit group.
pub fn with_specific_in<T, R, F>(group: SchedulingGroup, key: SchedulingGroupKey<T>, f: F) -> R
where
    T: 'static,
    F: FnOnce(&mut T) -> R,
{
    let shard = ShardInner::try_current().expect("scheduling-group storage requires a shard");
    let mut specifics = shard.specifics.borrow_mut();
    while specifics.len() <= group.index() {
        specifics.push(GroupLocal::default());
    }

    let (generation, ctor) = {
        let registry = registry();
        let generation = registry.slots[group.index()]
            .as_ref()
            .map_or(u64::MAX, |entry| entry.generation);
        let ctor = registry.keys.get(key.index).map(Arc::clone);
        (generation, ctor)
    };

    let local = &mut specifics[group.index()];
    if local.generation != generation {
        // the slot was recycled since this shard last looked
        local.values.clear();
        local.generation = generation;
    }
    if local.values.len() <= key.index {
        local.values.resize_with(key.index + 1, || None);
    }
    if local.values[key.index].is_none() {
        let ctor = ctor.expect("unknown scheduling group key");
        local.values[key.index] = Some((ctor.ctor)());
    }
    let value = local.values[key.index]
        .as_mut()
        .expect("just constructed")
        .downcast_mut::<T>()
        .expect("scheduling group key used with a different type");
    f(value)
}

/// Folds `map` over the specific values of every live group on this shard.
pub fn map_reduce_specific<T, A, M, R>(
    key: SchedulingGroupKey<T>,
    mut map: M,
    initial: A,
    mut reduce: R,
) -> A
where
    T: 'static,
    M: FnMut(&T) -> A,
    R: FnMut(A, A) -> A,
{
    let mut acc = initial;
    for group in live_groups() {
        let mapped = with_specific_in(group, key, |value| map(value));
        acc = reduce(acc, mapped);
    }
    acc
}

/// Folds the specific values of every live group on this shard directly into
/// an accumulator.
pub fn reduce_specific<T, A, R>(key: SchedulingGroupKey<T>, initial: A, mut reduce: R) -> A
where
    T: 'static,
    R: FnMut(A, &T) -> A,
{
    let mut acc = initial;
    for group in live_groups() {
        acc = with_specific_in(group, key, |value| reduce(acc, value));
    }
    acc
}

fn live_groups() -> Vec<SchedulingGroup> {
    registry()
        .slots
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| slot.as_ref().map(|_| SchedulingGroup::from_index(index)))
        .collect()
}

/// Runs `f` as a task tagged with `group`; every task transitively spawned
/// from it inherits the tag unless overridden.
pub fn with_scheduling_group<T, F, Fut>(group: SchedulingGroup, f: F) -> crate::Future<T>
where
    T: 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: StdFuture<Output = Result<T>> + 'static,
{
    let shard = ShardInner::try_current().expect("with_scheduling_group requires a shard");
    shard.spawn_in_group(group, async move { f().await })
}

/// The scheduling group of the running task, or the main group outside of
/// task context.
pub fn current_scheduling_group() -> SchedulingGroup {
    ShardInner::try_current().map_or_else(SchedulingGroup::main, |shard| shard.current_group())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shard;
    use crate::test_util::trace_init;

    #[test]
    fn empty_names_are_rejected() {
        let err = create_scheduling_group("", 100).get().unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn created_groups_report_name_and_shares() {
        let _trace = trace_init();
        let group = create_scheduling_group("reporting", 250).get().unwrap();
        assert_eq!(group.name().as_deref(), Some("reporting"));
        assert_eq!(group.shares(), Some(250));
        destroy_scheduling_group(group).get().unwrap();
        assert_eq!(group.name(), None);
    }

    #[test]
    fn tasks_carry_their_scheduling_group() {
        let _trace = trace_init();
        let shard = Shard::new();
        let group = create_scheduling_group("tagging", 100).get().unwrap();

        let seen = shard.block_on(async {
            assert_eq!(current_scheduling_group(), SchedulingGroup::main());
            with_scheduling_group(group, move || async move {
                let direct = current_scheduling_group();
                // a task spawned from here inherits the tag
                let inherited = Shard::current()
                    .spawn(async { Ok(current_scheduling_group()) })
                    .await?;
                Ok((direct, inherited))
            })
            .await
        });

        let (direct, inherited) = seen.unwrap();
        assert_eq!(direct, group);
        assert_eq!(inherited, group);
        destroy_scheduling_group(group).get().unwrap();
    }

    #[test]
    fn specific_values_are_lazy_and_per_group() {
        let _trace = trace_init();
        let shard = Shard::new();
        let group = create_scheduling_group("specific", 100).get().unwrap();

        // the constructor must be Send + Sync; count through a thread-safe cell
        use std::sync::atomic::{AtomicU32, Ordering};
        let constructions = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&constructions);
        let key = create_scheduling_group_key(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            0u64
        });

        shard.block_on(async {
            with_specific_in(SchedulingGroup::main(), key, |v| *v += 1);
            with_specific_in(SchedulingGroup::main(), key, |v| *v += 1);
            with_specific_in(group, key, |v| *v += 5);

            assert_eq!(with_specific_in(SchedulingGroup::main(), key, |v| *v), 2);
            assert_eq!(with_specific_in(group, key, |v| *v), 5);
        });

        // one construction per touched group on this shard
        assert_eq!(constructions.load(Ordering::Relaxed), 2);

        let total = reduce_specific(key, 0u64, |acc, v| acc + *v);
        assert_eq!(total, 7);

        let max = map_reduce_specific(key, |v| *v, 0u64, u64::max);
        assert_eq!(max, 5);

        destroy_scheduling_group(group).get().unwrap();
    }

    #[test]
    fn destroyed_slots_do_not_leak_specifics_into_new_groups() {
        let _trace = trace_init();
        let shard = Shard::new();
        let key = create_scheduling_group_key(|| 0u32);

        let first = create_scheduling_group("recycle-a", 100).get().unwrap();
        shard.block_on(async {
            with_specific_in(first, key, |v| *v = 41);
        });
        destroy_scheduling_group(first).get().unwrap();

        let second = create_scheduling_group("recycle-b", 100).get().unwrap();
        shard.block_on(async {
            // even if the index was recycled, the value must start fresh
            assert_eq!(with_specific_in(second, key, |v| *v), 0);
        });
        destroy_scheduling_group(second).get().unwrap();
    }
}
