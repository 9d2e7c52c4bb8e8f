//! One duplicate request cache.
//!
//! A [`Drc`] pairs a partitioned index of entries with an arrival-ordered
//! FIFO. Both always hold the same set of entries: every insertion and
//! removal touches both while the owning partition lock is held, so a
//! lookup never sees an entry the FIFO has already given up.
//!
//! # Lock protocol
//!
//! - `start`: partition, then cache (miss: append to FIFO; hit: widen window).
//! - `finish`: cache alone to narrow the window, then for each victim the
//!   two-phase [`Drc::retire_head`].
//! - `delete`, `purge`: partition, then cache.

use crate::config::CacheParams;
use crate::dispatch::Dispatch;
use crate::entry::{DupReqEntry, EntryKey, Observed};
use crate::lock_order::{LockRank, RankedGuard, RankedMutex};
use crate::partition::PartitionedIndex;
use crate::retire::{RETIRE_BATCH, RetirePolicy};
use crate::stats::{DrcCounters, DrcStats};
use drc_error::Result;
use drc_types::{Checksum, DrcKind, PeerAddr, RpcCall, Xid};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, trace};

pub(crate) type EntryRef<R> = Arc<DupReqEntry<R>>;

/// Set while a per-connection cache sits in the registry's parked FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecycleMarker {
    pub(crate) parked_at: Instant,
    pub(crate) park_seq: u64,
}

/// Fields guarded by the cache lock.
pub(crate) struct DrcState<R> {
    fifo: BTreeMap<u64, EntryRef<R>>,
    next_seq: u64,
    retire_window: usize,
    pub(crate) refcnt: u32,
    pub(crate) recycle: Option<RecycleMarker>,
}

impl<R> DrcState<R> {
    fn head(&self) -> Option<HeadSnapshot> {
        self.fifo.first_key_value().map(|(&seq, entry)| HeadSnapshot {
            seq,
            hash: entry.hash(),
            key: *entry.key(),
        })
    }
}

/// The FIFO head as seen before the cache lock was dropped.
#[derive(Debug, Clone, Copy)]
struct HeadSnapshot {
    seq: u64,
    hash: u64,
    key: EntryKey,
}

pub(crate) enum Lookup<R> {
    /// New pending entry; the caller executes the request.
    Miss(EntryRef<R>),
    /// Completed duplicate; the caller holds one more entry reference.
    Replay(EntryRef<R>, Arc<R>),
    /// The identical request is still executing.
    InProgress,
}

pub(crate) struct Drc<R> {
    id: u64,
    kind: DrcKind,
    peer: Option<PeerAddr>,
    params: CacheParams,
    policy: RetirePolicy,
    index: PartitionedIndex<EntryKey, EntryRef<R>>,
    state: RankedMutex<DrcState<R>>,
    dispatch: Arc<dyn Dispatch<R>>,
    counters: DrcCounters,
}

impl<R> Drc<R> {
    pub(crate) fn new(
        id: u64,
        kind: DrcKind,
        peer: Option<PeerAddr>,
        params: CacheParams,
        dispatch: Arc<dyn Dispatch<R>>,
    ) -> Result<Self> {
        let index = PartitionedIndex::new(params.npart, params.cachesz)?;
        debug!(
            cache_id = id,
            %kind,
            peer = ?peer,
            npart = params.npart,
            cachesz = params.cachesz,
            max_size = params.size,
            hiwat = params.hiwat,
            "drc_create"
        );
        Ok(Self {
            id,
            kind,
            peer,
            params,
            policy: RetirePolicy::new(params.size, params.hiwat),
            index,
            state: RankedMutex::new(
                LockRank::Cache,
                DrcState {
                    fifo: BTreeMap::new(),
                    next_seq: 0,
                    retire_window: 0,
                    refcnt: 0,
                    recycle: None,
                },
            ),
            dispatch,
            counters: DrcCounters::default(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> DrcKind {
        self.kind
    }

    pub(crate) fn peer(&self) -> Option<PeerAddr> {
        self.peer
    }

    pub(crate) fn dispatch(&self) -> &dyn Dispatch<R> {
        self.dispatch.as_ref()
    }

    pub(crate) fn lock_state(&self) -> RankedGuard<'_, DrcState<R>> {
        self.state.lock()
    }

    /// Entry key for a request from `peer`; only the shared cache keeps it.
    pub(crate) fn key_for(&self, peer: PeerAddr, xid: Xid, checksum: Checksum) -> EntryKey {
        let peer = self.kind.is_shared().then_some(peer);
        EntryKey::new(peer, xid, checksum, self.params.checksum)
    }

    pub(crate) fn start(&self, key: EntryKey, call: RpcCall) -> Lookup<R> {
        let hash = key.hash();
        let mut part = self.index.lock_for(hash);

        if let Some(entry) = part.get(hash, &key).cloned() {
            return match entry.observe() {
                Observed::Pending => {
                    drop(part);
                    self.counters.record_in_progress();
                    debug!(cache_id = self.id, %key, "drc_hit_in_progress");
                    Lookup::InProgress
                }
                Observed::Complete(response) => {
                    entry.get();
                    let mut st = self.state.lock();
                    st.retire_window = self.policy.widen(st.retire_window);
                    let retire_window = st.retire_window;
                    drop(st);
                    drop(part);
                    self.counters.record_hit();
                    debug!(cache_id = self.id, %key, retire_window, "drc_hit_replay");
                    Lookup::Replay(entry, response)
                }
                Observed::Deleted => {
                    drop(part);
                    crate::fail_stop(format_args!(
                        "deleted entry {key} still indexed in cache {}",
                        self.id
                    ))
                }
            };
        }

        let mut st = self.state.lock();
        let seq = st.next_seq;
        st.next_seq += 1;
        let entry = Arc::new(DupReqEntry::new(key, call, seq));
        let _ = st.fifo.insert(seq, Arc::clone(&entry));
        let size = st.fifo.len();
        drop(st);
        let _ = part.insert(hash, key, Arc::clone(&entry));
        drop(part);

        self.counters.record_miss();
        trace!(cache_id = self.id, %key, %call, size, "drc_start");
        Lookup::Miss(entry)
    }

    /// Complete `entry`, pay down the retire window, and retire up to
    /// [`RETIRE_BATCH`] entries from the FIFO head.
    pub(crate) fn finish(&self, entry: &EntryRef<R>, response: R) -> Arc<R> {
        let response = entry.complete(response);

        let mut st = self.state.lock();
        st.retire_window = self.policy.narrow(st.retire_window);
        trace!(
            cache_id = self.id,
            key = %entry.key(),
            size = st.fifo.len(),
            retire_window = st.retire_window,
            "drc_finish"
        );

        for _ in 0..RETIRE_BATCH {
            if !self.policy.should_retire(st.fifo.len(), st.retire_window) {
                break;
            }
            let Some(head) = st.head() else {
                break;
            };
            drop(st);
            let Some(victim) = self.retire_head(&head) else {
                return response;
            };
            victim.put(self.dispatch());
            st = self.state.lock();
        }
        drop(st);
        response
    }

    /// Second phase of retirement.
    ///
    /// Called with no locks held. Takes the head's partition lock, then the
    /// cache lock, and proceeds only if the FIFO head is still the entry in
    /// `head`. Returns the victim with its index reference still to put, or
    /// `None` if the head moved.
    fn retire_head(&self, head: &HeadSnapshot) -> Option<EntryRef<R>> {
        let mut part = self.index.lock_for(head.hash);
        let mut st = self.state.lock();
        if st.fifo.first_key_value().map(|(&seq, _)| seq) != Some(head.seq) {
            drop(st);
            drop(part);
            debug!(cache_id = self.id, key = %head.key, "drc_retire_abandoned");
            return None;
        }
        let (_, victim) = st.fifo.pop_first()?;
        let size = st.fifo.len();
        drop(st);

        let indexed = part.remove(head.hash, &head.key);
        drop(part);
        if !indexed.is_some_and(|found| Arc::ptr_eq(&found, &victim)) {
            crate::fail_stop(format_args!(
                "retired head {} missing from index of cache {}",
                head.key, self.id
            ));
        }

        self.counters.record_retired();
        debug!(
            cache_id = self.id,
            key = %head.key,
            state = ?victim.state(),
            refs = victim.refs(),
            size,
            "drc_retire"
        );
        Some(victim)
    }

    /// Abort path: unlink `entry` and drop the index reference.
    ///
    /// Returns `false` if retirement or a purge already unlinked it. The
    /// caller's own reference is untouched.
    pub(crate) fn delete(&self, entry: &EntryRef<R>) -> bool {
        let mut part = self.index.lock_for(entry.hash());
        let mut st = self.state.lock();
        let enqueued = st
            .fifo
            .get(&entry.seq())
            .is_some_and(|queued| Arc::ptr_eq(queued, entry));
        if enqueued {
            let _ = st.fifo.remove(&entry.seq());
        }
        let size = st.fifo.len();
        drop(st);

        if enqueued {
            let indexed = part.remove(entry.hash(), entry.key());
            if !indexed.is_some_and(|found| Arc::ptr_eq(&found, entry)) {
                drop(part);
                crate::fail_stop(format_args!(
                    "deleted entry {} missing from index of cache {}",
                    entry.key(),
                    self.id
                ));
            }
        }
        entry.mark_deleted();
        drop(part);

        if !enqueued {
            trace!(cache_id = self.id, key = %entry.key(), "drc_delete_unlinked");
            return false;
        }
        self.counters.record_deleted();
        debug!(cache_id = self.id, key = %entry.key(), size, "drc_delete");
        entry.put(self.dispatch());
        true
    }

    /// Unlink every entry and drop the index references.
    ///
    /// Entries still held by in-flight handles survive until released.
    pub(crate) fn purge(&self) -> usize {
        let mut unlinked = Vec::new();
        for idx in 0..self.index.partition_count() {
            let mut part = self.index.lock_at(idx);
            let drained = part.drain();
            if drained.is_empty() {
                continue;
            }
            let mut st = self.state.lock();
            for entry in &drained {
                let _ = st.fifo.remove(&entry.seq());
            }
            drop(st);
            drop(part);
            unlinked.extend(drained);
        }

        let count = unlinked.len();
        for entry in unlinked {
            entry.put(self.dispatch());
        }
        debug!(cache_id = self.id, kind = %self.kind, purged = count, "drc_purge");
        count
    }

    pub(crate) fn stats(&self) -> DrcStats {
        let st = self.state.lock();
        let (size, retire_window, refcnt, parked) = (
            st.fifo.len(),
            st.retire_window,
            st.refcnt,
            st.recycle.is_some(),
        );
        drop(st);
        DrcStats {
            cache_id: self.id,
            kind: self.kind,
            peer: self.peer,
            size,
            max_size: self.policy.max_size(),
            hiwat: self.policy.hiwat(),
            retire_window,
            refcnt,
            parked,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            in_progress: self.counters.in_progress.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            deleted: self.counters.deleted.load(Ordering::Relaxed),
        }
    }

    /// Keys in arrival order, oldest first.
    pub(crate) fn fifo_keys(&self) -> Vec<EntryKey> {
        self.state.lock().fifo.values().map(|entry| *entry.key()).collect()
    }

    /// Entries in the index. Matches the FIFO length when quiescent.
    #[cfg(test)]
    pub(crate) fn indexed_len(&self) -> usize {
        self.index.len()
    }
}

impl<R> fmt::Debug for Drc<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drc")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
