//! Partitioned ordered index.
//!
//! A [`PartitionedIndex`] routes a 64-bit hash to one of `npart` shards, each
//! behind its own [`RankedMutex`]. A shard is an ordered map fronted by a
//! small direct-mapped slot array addressed by `hash % cachesz`; the slots
//! are write-through, so the map is always authoritative.

use crate::lock_order::{LockRank, RankedGuard, RankedMutex};
use drc_error::{DrcError, Result};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct Partition<K, V> {
    slots: Vec<Option<(K, V)>>,
    tree: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> Partition<K, V> {
    /// Create a shard with `cachesz` direct-mapped slots.
    pub fn with_slots(cachesz: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(cachesz).map_err(|err| {
            DrcError::unavailable(format!("partition slots ({cachesz}): {err}"))
        })?;
        slots.resize_with(cachesz, || None);
        Ok(Self {
            slots,
            tree: BTreeMap::new(),
        })
    }

    #[inline]
    fn slot_of(&self, hash: u64) -> Option<usize> {
        let len = u64::try_from(self.slots.len()).ok().filter(|len| *len > 0)?;
        usize::try_from(hash % len).ok()
    }

    /// Look up `key`, refreshing its slot on a map hit.
    pub fn get(&mut self, hash: u64, key: &K) -> Option<&V> {
        let slot = self.slot_of(hash);
        if let Some(idx) = slot {
            let cached = self.slots[idx].as_ref().is_some_and(|(k, _)| k == key);
            if cached {
                return self.slots[idx].as_ref().map(|(_, v)| v);
            }
        }
        let value = self.tree.get(key)?;
        if let Some(idx) = slot {
            self.slots[idx] = Some((key.clone(), value.clone()));
        }
        Some(value)
    }

    pub fn insert(&mut self, hash: u64, key: K, value: V) -> Option<V> {
        if let Some(idx) = self.slot_of(hash) {
            self.slots[idx] = Some((key.clone(), value.clone()));
        }
        self.tree.insert(key, value)
    }

    pub fn remove(&mut self, hash: u64, key: &K) -> Option<V> {
        if let Some(idx) = self.slot_of(hash)
            && self.slots[idx].as_ref().is_some_and(|(k, _)| k == key)
        {
            self.slots[idx] = None;
        }
        self.tree.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Remove and return every value in key order.
    pub fn drain(&mut self) -> Vec<V> {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        std::mem::take(&mut self.tree).into_values().collect()
    }
}

/// Select a shard for `hash` out of `count`.
#[inline]
pub fn partition_of(hash: u64, count: usize) -> usize {
    let count_u64 = u64::try_from(count.max(1)).expect("partition count must fit in u64");
    usize::try_from(hash % count_u64).expect("remainder must fit in usize")
}

/// Build `npart` unlocked shards with `cachesz` slots each.
pub fn build_partitions<K: Ord + Clone, V: Clone>(
    npart: usize,
    cachesz: usize,
) -> Result<Vec<Partition<K, V>>> {
    let mut parts = Vec::new();
    parts
        .try_reserve_exact(npart)
        .map_err(|err| DrcError::unavailable(format!("partition table ({npart}): {err}")))?;
    for _ in 0..npart {
        parts.push(Partition::with_slots(cachesz)?);
    }
    Ok(parts)
}

/// Lock-per-shard index.
#[derive(Debug)]
pub struct PartitionedIndex<K, V> {
    parts: Vec<RankedMutex<Partition<K, V>>>,
}

impl<K: Ord + Clone, V: Clone> PartitionedIndex<K, V> {
    pub fn new(npart: usize, cachesz: usize) -> Result<Self> {
        let parts = build_partitions(npart.max(1), cachesz)?
            .into_iter()
            .map(|part| RankedMutex::new(LockRank::Partition, part))
            .collect();
        Ok(Self { parts })
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.parts.len()
    }

    /// Lock the shard that owns `hash`.
    pub fn lock_for(&self, hash: u64) -> RankedGuard<'_, Partition<K, V>> {
        self.parts[partition_of(hash, self.parts.len())].lock()
    }

    /// Lock shard `idx` directly.
    pub fn lock_at(&self, idx: usize) -> RankedGuard<'_, Partition<K, V>> {
        self.parts[idx].lock()
    }

    /// Total entries across shards. Not a consistent snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.iter().map(|part| part.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
