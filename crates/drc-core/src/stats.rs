//! Counters and reporting snapshots.

use drc_types::{DrcKind, PeerAddr};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ── Per-cache counters ─────────────────────────────────────────────────────

/// Event counters for one cache. Updated without the cache lock.
#[derive(Debug, Default)]
pub struct DrcCounters {
    /// Replays served from a completed entry.
    pub hits: AtomicU64,
    /// New entries created.
    pub misses: AtomicU64,
    /// Lookups that found the identical request still executing.
    pub in_progress: AtomicU64,
    /// Entries removed from the FIFO head by the retire loop.
    pub retired: AtomicU64,
    /// Entries removed on the abort path.
    pub deleted: AtomicU64,
}

impl DrcCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_progress(&self) {
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retired(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrcStats {
    pub cache_id: u64,
    pub kind: DrcKind,
    pub peer: Option<PeerAddr>,
    pub size: usize,
    pub max_size: usize,
    pub hiwat: usize,
    pub retire_window: usize,
    pub refcnt: u32,
    pub parked: bool,
    pub hits: u64,
    pub misses: u64,
    pub in_progress: u64,
    pub retired: u64,
    pub deleted: u64,
}

impl DrcStats {
    /// Replays over all cached lookups, in [0.0, 1.0].
    #[must_use]
    #[expect(clippy::cast_precision_loss)] // reporting only
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Per-connection caches reachable by peer address.
    pub tracked: usize,
    /// Of those, caches parked with no references.
    pub parked: usize,
    /// Caches reaped by expiry sweeps since startup.
    pub expired_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsystemStats {
    pub disabled: bool,
    pub shared: DrcStats,
    pub registry: RegistryStats,
}
