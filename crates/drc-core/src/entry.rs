//! Cache entries and their reference counting.

use crate::dispatch::Dispatch;
use crate::lock_order::{LockRank, RankedMutex};
use drc_types::{Checksum, PeerAddr, RpcCall, Xid, mix64};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tracing::debug;

/// Identity of one request within a cache.
///
/// The peer is present only in the shared cache; a per-connection cache
/// implies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntryKey {
    pub checksum: Checksum,
    pub xid: Xid,
    pub peer: Option<PeerAddr>,
}

impl EntryKey {
    /// Build a key; `use_checksum == false` zeroes the checksum.
    #[must_use]
    pub fn new(peer: Option<PeerAddr>, xid: Xid, checksum: Checksum, use_checksum: bool) -> Self {
        Self {
            checksum: if use_checksum {
                checksum
            } else {
                Checksum::ZERO
            },
            xid,
            peer,
        }
    }

    /// Partition hash. Falls back to the xid when the checksum is zeroed.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let base = if self.checksum == Checksum::ZERO {
            mix64(u64::from(self.xid.0))
        } else {
            mix64(self.checksum.0 ^ u64::from(self.xid.0))
        };
        match self.peer {
            Some(peer) => mix64(base ^ peer.hash_key()),
            None => base,
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{peer}/{}/{:#x}", self.xid, self.checksum.0),
            None => write!(f, "{}/{:#x}", self.xid, self.checksum.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Complete,
    Deleted,
}

struct EntrySlot<R> {
    state: EntryState,
    response: Option<Arc<R>>,
}

/// What a lookup found in an indexed entry.
pub(crate) enum Observed<R> {
    Pending,
    Complete(Arc<R>),
    Deleted,
}

/// One request/response pairing.
///
/// Starts with two references: the index (held until retirement, deletion
/// or purge) and the caller that created it. Each replay adds one. The
/// response goes back to the dispatch table when the count reaches zero.
pub struct DupReqEntry<R> {
    key: EntryKey,
    hash: u64,
    call: RpcCall,
    seq: u64,
    created_at: Instant,
    refs: AtomicU32,
    slot: RankedMutex<EntrySlot<R>>,
}

impl<R> DupReqEntry<R> {
    pub(crate) fn new(key: EntryKey, call: RpcCall, seq: u64) -> Self {
        Self {
            key,
            hash: key.hash(),
            call,
            seq,
            created_at: Instant::now(),
            refs: AtomicU32::new(2),
            slot: RankedMutex::new(
                LockRank::Entry,
                EntrySlot {
                    state: EntryState::Pending,
                    response: None,
                },
            ),
        }
    }

    #[must_use]
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[must_use]
    pub fn call(&self) -> &RpcCall {
        &self.call
    }

    /// Arrival sequence within the owning cache.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn state(&self) -> EntryState {
        self.slot.lock().state
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn observe(&self) -> Observed<R> {
        let slot = self.slot.lock();
        match (slot.state, &slot.response) {
            (EntryState::Pending, _) => Observed::Pending,
            (EntryState::Complete, Some(response)) => Observed::Complete(Arc::clone(response)),
            (EntryState::Complete, None) => crate::fail_stop(format_args!(
                "entry {} complete without a response",
                self.key
            )),
            (EntryState::Deleted, _) => Observed::Deleted,
        }
    }

    /// Store the response. Only a pending entry may complete.
    pub(crate) fn complete(&self, response: R) -> Arc<R> {
        let response = Arc::new(response);
        let mut slot = self.slot.lock();
        if slot.state != EntryState::Pending {
            let state = slot.state;
            drop(slot);
            crate::fail_stop(format_args!(
                "finishing entry {} in state {state:?}",
                self.key
            ));
        }
        slot.state = EntryState::Complete;
        slot.response = Some(Arc::clone(&response));
        response
    }

    pub(crate) fn mark_deleted(&self) {
        self.slot.lock().state = EntryState::Deleted;
    }

    /// Take a reference for a replaying caller.
    pub(crate) fn get(&self) {
        let prev = self.refs.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            crate::fail_stop(format_args!("revived released entry {}", self.key));
        }
    }

    /// Drop one reference; the last one hands the response back.
    pub(crate) fn put(&self, dispatch: &dyn Dispatch<R>) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        match prev {
            0 => crate::fail_stop(format_args!("entry {} refcount underflow", self.key)),
            1 => self.destroy(dispatch),
            _ => {}
        }
    }

    fn destroy(&self, dispatch: &dyn Dispatch<R>) {
        let (state, response) = {
            let mut slot = self.slot.lock();
            (slot.state, slot.response.take())
        };
        debug!(
            key = %self.key,
            ?state,
            age_us = u64::try_from(self.created_at.elapsed().as_micros()).unwrap_or(u64::MAX),
            "drc_entry_free"
        );
        if let Some(response) = response {
            dispatch.release_response(&self.call, response);
        }
    }
}

impl<R> fmt::Debug for DupReqEntry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DupReqEntry")
            .field("key", &self.key)
            .field("seq", &self.seq)
            .field("refs", &self.refs())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Cacheability, Dispatch};
    use drc_types::nfs3;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingRelease {
        released: AtomicUsize,
    }

    impl Dispatch<u32> for CountingRelease {
        fn classify(&self, _call: &RpcCall) -> Cacheability {
            Cacheability::Cacheable
        }

        fn release_response(&self, _call: &RpcCall, _response: Arc<u32>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key(xid: u32) -> EntryKey {
        EntryKey::new(None, Xid(xid), Checksum(0xabc), true)
    }

    #[test]
    fn checksum_participation_changes_identity() {
        let with = EntryKey::new(None, Xid(1), Checksum(5), true);
        let without = EntryKey::new(None, Xid(1), Checksum(5), false);
        assert_eq!(without.checksum, Checksum::ZERO);
        assert_ne!(with, without);
        assert_eq!(
            without.hash(),
            EntryKey::new(None, Xid(1), Checksum(9), false).hash()
        );
    }

    #[test]
    fn shared_keys_distinguish_peers() {
        let a = PeerAddr(SocketAddr::from((Ipv4Addr::LOCALHOST, 800)));
        let b = PeerAddr(SocketAddr::from((Ipv4Addr::LOCALHOST, 801)));
        let ka = EntryKey::new(Some(a), Xid(7), Checksum(1), true);
        let kb = EntryKey::new(Some(b), Xid(7), Checksum(1), true);
        assert_ne!(ka, kb);
        assert_ne!(ka.hash(), kb.hash());
    }

    #[test]
    fn response_released_once_at_zero() {
        let dispatch = CountingRelease::default();
        let entry = DupReqEntry::new(key(1), RpcCall::nfs3(nfs3::WRITE), 0);
        assert_eq!(entry.refs(), 2);
        let stored = entry.complete(42);
        assert_eq!(*stored, 42);
        drop(stored);

        entry.get();
        entry.put(&dispatch);
        entry.put(&dispatch);
        assert_eq!(dispatch.released.load(Ordering::SeqCst), 0);
        entry.put(&dispatch);
        assert_eq!(dispatch.released.load(Ordering::SeqCst), 1);
        assert_eq!(entry.refs(), 0);
    }

    #[test]
    fn deleted_entry_frees_without_response() {
        let dispatch = CountingRelease::default();
        let entry = DupReqEntry::<u32>::new(key(2), RpcCall::nfs3(nfs3::CREATE), 0);
        entry.mark_deleted();
        assert_eq!(entry.state(), EntryState::Deleted);
        entry.put(&dispatch);
        entry.put(&dispatch);
        assert_eq!(dispatch.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observe_reports_state() {
        let entry = DupReqEntry::new(key(3), RpcCall::nfs3(nfs3::SETATTR), 0);
        assert!(matches!(entry.observe(), Observed::Pending));
        let _ = entry.complete(9_u32);
        assert!(matches!(entry.observe(), Observed::Complete(r) if *r == 9));
    }

    #[test]
    #[should_panic(expected = "finishing entry")]
    fn completing_twice_is_fatal() {
        let entry = DupReqEntry::new(key(4), RpcCall::nfs3(nfs3::WRITE), 0);
        let _ = entry.complete(1_u32);
        let _ = entry.complete(2_u32);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn underflow_is_fatal() {
        let dispatch = CountingRelease::default();
        let entry = DupReqEntry::<u32>::new(key(5), RpcCall::nfs3(nfs3::WRITE), 0);
        entry.put(&dispatch);
        entry.put(&dispatch);
        entry.put(&dispatch);
    }
}
