//! Ranked mutexes.
//!
//! Every lock in the cache belongs to one [`LockRank`]. A thread may only
//! acquire a lock whose rank is strictly greater than every rank it already
//! holds:
//!
//! | Rank | Guards |
//! |------|--------|
//! | `Registry` | recycling registry index and parked FIFO |
//! | `Partition` | one shard of a cache's entry index |
//! | `Cache` | a cache's FIFO, size, retire window, refcount, recycle marker |
//! | `Entry` | one entry's state and response |
//!
//! Paths that need an outer lock while holding an inner one (parking a
//! cache, retiring the FIFO head) release the inner guard, take the outer
//! lock, reacquire, and revalidate. Acquiring out of order is a logic error
//! and stops the process.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    Registry = 0,
    Partition = 1,
    Cache = 2,
    Entry = 3,
}

impl LockRank {
    const fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Bits of this rank and every rank nested inside it.
    const fn this_and_inner(self) -> u8 {
        !(self.bit() - 1)
    }
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

fn note_acquire(rank: LockRank) {
    HELD.with(|held| {
        let mask = held.get();
        if mask & rank.this_and_inner() != 0 {
            crate::fail_stop(format_args!(
                "lock order violation: acquiring {rank:?} with held mask {mask:#06b}"
            ));
        }
        held.set(mask | rank.bit());
    });
}

fn note_release(rank: LockRank) {
    HELD.with(|held| held.set(held.get() & !rank.bit()));
}

/// Ranks currently held by this thread.
#[cfg(test)]
fn held_ranks() -> Vec<LockRank> {
    let mask = HELD.with(Cell::get);
    [
        LockRank::Registry,
        LockRank::Partition,
        LockRank::Cache,
        LockRank::Entry,
    ]
    .into_iter()
    .filter(|rank| mask & rank.bit() != 0)
    .collect()
}

/// A `parking_lot` mutex that enforces [`LockRank`] ordering per thread.
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> RankedGuard<'_, T> {
        note_acquire(self.rank);
        RankedGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedMutex")
            .field("rank", &self.rank)
            .field("inner", &self.inner)
            .finish()
    }
}

pub struct RankedGuard<'a, T> {
    rank: LockRank,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        note_release(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_in_rank_order_is_allowed() {
        let registry = RankedMutex::new(LockRank::Registry, 0_u32);
        let partition = RankedMutex::new(LockRank::Partition, 0_u32);
        let cache = RankedMutex::new(LockRank::Cache, 0_u32);
        let entry = RankedMutex::new(LockRank::Entry, 0_u32);

        let r = registry.lock();
        let p = partition.lock();
        let c = cache.lock();
        let e = entry.lock();
        assert_eq!(held_ranks().len(), 4);
        drop((e, c, p, r));
        assert!(held_ranks().is_empty());
    }

    #[test]
    fn skipping_ranks_is_allowed() {
        let registry = RankedMutex::new(LockRank::Registry, ());
        let cache = RankedMutex::new(LockRank::Cache, ());
        let _r = registry.lock();
        let _c = cache.lock();
        assert_eq!(held_ranks(), vec![LockRank::Registry, LockRank::Cache]);
    }

    #[test]
    fn drop_and_reacquire_outer_first() {
        let partition = RankedMutex::new(LockRank::Partition, ());
        let cache = RankedMutex::new(LockRank::Cache, ());

        let c = cache.lock();
        drop(c);
        let _p = partition.lock();
        let _c = cache.lock();
        assert_eq!(held_ranks(), vec![LockRank::Partition, LockRank::Cache]);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn inner_then_outer_panics() {
        let registry = RankedMutex::new(LockRank::Registry, ());
        let cache = RankedMutex::new(LockRank::Cache, ());
        let _c = cache.lock();
        let _r = registry.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn two_locks_of_one_rank_panic() {
        let a = RankedMutex::new(LockRank::Partition, ());
        let b = RankedMutex::new(LockRank::Partition, ());
        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    fn guard_gives_mutable_access() {
        let cache = RankedMutex::new(LockRank::Cache, vec![1, 2]);
        cache.lock().push(3);
        assert_eq!(*cache.lock(), vec![1, 2, 3]);
    }
}
