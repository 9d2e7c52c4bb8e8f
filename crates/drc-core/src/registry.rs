//! Recycling registry for per-connection caches.
//!
//! A stream connection's cache outlives the connection: when its last
//! reference goes away it is parked here, keyed by peer address, so a client
//! that reconnects within the expiry delta resumes with its history intact.
//!
//! The peer index holds only [`Weak`] back-references; the parked FIFO holds
//! the strong reference that keeps an idle cache alive. A cache in use is
//! kept alive by its connection and in-flight handles.

use crate::config::DrcConfig;
use crate::drc::{Drc, DrcState, RecycleMarker};
use crate::lock_order::{LockRank, RankedGuard, RankedMutex};
use crate::partition::{Partition, build_partitions, partition_of};
use crate::stats::RegistryStats;
use drc_error::Result;
use drc_types::PeerAddr;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

pub(crate) struct RegistryState<R> {
    by_peer: Vec<Partition<PeerAddr, Weak<Drc<R>>>>,
    parked: BTreeMap<u64, Arc<Drc<R>>>,
    next_park_seq: u64,
    last_expire_check: Option<Instant>,
}

impl<R> RegistryState<R> {
    fn shard(&mut self, peer: &PeerAddr) -> (&mut Partition<PeerAddr, Weak<Drc<R>>>, u64) {
        let hash = peer.hash_key();
        let idx = partition_of(hash, self.by_peer.len());
        (&mut self.by_peer[idx], hash)
    }

    /// Live cache tracked for `peer`, parked or not.
    pub(crate) fn lookup(&mut self, peer: PeerAddr) -> Option<Arc<Drc<R>>> {
        let (shard, hash) = self.shard(&peer);
        shard.get(hash, &peer).and_then(Weak::upgrade)
    }

    pub(crate) fn track(&mut self, drc: &Arc<Drc<R>>) {
        let Some(peer) = drc.peer() else {
            return;
        };
        let (shard, hash) = self.shard(&peer);
        let _ = shard.insert(hash, peer, Arc::downgrade(drc));
    }

    /// Forget `drc` unless the index already points at a newer cache.
    pub(crate) fn untrack(&mut self, drc: &Arc<Drc<R>>) {
        let Some(peer) = drc.peer() else {
            return;
        };
        let (shard, hash) = self.shard(&peer);
        let ours = shard
            .get(hash, &peer)
            .is_some_and(|tracked| std::ptr::eq(tracked.as_ptr(), Arc::as_ptr(drc)));
        if ours {
            let _ = shard.remove(hash, &peer);
        }
    }

    /// Park a zero-reference cache. `st` is `drc`'s locked state.
    pub(crate) fn park(&mut self, drc: &Arc<Drc<R>>, st: &mut DrcState<R>, now: Instant) {
        let park_seq = self.next_park_seq;
        self.next_park_seq += 1;
        st.recycle = Some(RecycleMarker {
            parked_at: now,
            park_seq,
        });
        let _ = self.parked.insert(park_seq, Arc::clone(drc));
    }

    /// Remove a cache from the parked FIFO by its marker.
    pub(crate) fn unpark(&mut self, marker: RecycleMarker) -> Option<Arc<Drc<R>>> {
        self.parked.remove(&marker.park_seq)
    }

    /// Remove every parked cache from both structures.
    pub(crate) fn take_parked(&mut self) -> Vec<Arc<Drc<R>>> {
        let parked = std::mem::take(&mut self.parked);
        let mut taken = Vec::with_capacity(parked.len());
        for drc in parked.into_values() {
            drc.lock_state().recycle = None;
            self.untrack(&drc);
            taken.push(drc);
        }
        taken
    }
}

pub(crate) struct DrcRegistry<R> {
    state: RankedMutex<RegistryState<R>>,
    expire_after: Duration,
    check_interval: Duration,
    expired_total: AtomicU64,
}

impl<R> DrcRegistry<R> {
    pub(crate) fn new(config: &DrcConfig) -> Result<Self> {
        let by_peer = build_partitions(config.recycle_npart, 0)?;
        Ok(Self {
            state: RankedMutex::new(
                LockRank::Registry,
                RegistryState {
                    by_peer,
                    parked: BTreeMap::new(),
                    next_park_seq: 0,
                    last_expire_check: None,
                },
            ),
            expire_after: config.recycle_expire(),
            check_interval: config.expire_check_interval(),
            expired_total: AtomicU64::new(0),
        })
    }

    pub(crate) fn lock(&self) -> RankedGuard<'_, RegistryState<R>> {
        self.state.lock()
    }

    /// Detach parked caches idle for longer than the expiry delta.
    ///
    /// Unless `force`, skips when nothing is parked or the previous sweep ran
    /// less than the check interval ago. Stops at the first fresh head. The
    /// caller purges what is returned, outside the registry lock.
    pub(crate) fn collect_expired(&self, now: Instant, force: bool) -> Vec<Arc<Drc<R>>> {
        let mut reg = self.state.lock();
        if reg.parked.is_empty() {
            return Vec::new();
        }
        if !force
            && reg
                .last_expire_check
                .is_some_and(|last| now.saturating_duration_since(last) < self.check_interval)
        {
            return Vec::new();
        }

        let mut expired = Vec::new();
        while let Some(drc) = reg.parked.first_key_value().map(|(_, drc)| Arc::clone(drc)) {
            let mut st = drc.lock_state();
            let Some(marker) = st.recycle else {
                drop(st);
                drop(reg);
                crate::fail_stop(format_args!(
                    "cache {} parked without a recycle marker",
                    drc.id()
                ));
            };
            if now.saturating_duration_since(marker.parked_at) <= self.expire_after {
                break;
            }
            st.recycle = None;
            drop(st);
            let _ = reg.parked.pop_first();
            reg.untrack(&drc);
            trace!(cache_id = drc.id(), peer = ?drc.peer(), "drc_recycle_expire");
            expired.push(drc);
        }
        reg.last_expire_check = Some(now);
        drop(reg);

        if expired.is_empty() {
            debug!("drc_recycle_sweep: nothing expired");
        } else {
            let reaped = u64::try_from(expired.len()).unwrap_or(u64::MAX);
            self.expired_total.fetch_add(reaped, Ordering::Relaxed);
            info!(reaped, "drc_recycle_sweep");
        }
        expired
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        let reg = self.state.lock();
        let tracked = reg.by_peer.iter().map(Partition::len).sum();
        let parked = reg.parked.len();
        drop(reg);
        RegistryStats {
            tracked,
            parked,
            expired_total: self.expired_total.load(Ordering::Relaxed),
        }
    }
}
