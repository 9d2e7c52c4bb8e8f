//! Cache selection and the request lifecycle.
//!
//! [`DrcSubsystem`] is the process-wide context the transport layer shares
//! between its workers. A request flows through three handle types:
//!
//! ```text
//! start_request ──► Proceed(RequestSlot) ──finish──► ReplyHandle ──drop──► release
//!               │                        └─delete──► (nothing to send)
//!               ├─► Replay(ReplyHandle) ──drop──► release
//!               └─► BeingProcessed (send nothing)
//! ```
//!
//! Every handle that pins a cache or an entry gives its reference back on
//! drop, so the transport never does reference arithmetic itself.

use crate::config::DrcConfig;
use crate::dispatch::{Dispatch, NfsDispatchTable, is_compound};
use crate::drc::{Drc, DrcState, EntryRef, Lookup};
use crate::entry::{EntryKey, EntryState};
use crate::registry::DrcRegistry;
use crate::stats::{DrcStats, SubsystemStats};
use drc_error::{DrcError, Result};
use drc_types::{
    Checksum, CompoundShape, ConnectionId, DrcKind, PeerAddr, RpcCall, Transport, Xid,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

const SHARED_CACHE_ID: u64 = 0;

// ── Subsystem ──────────────────────────────────────────────────────────────

struct Subsystem<R> {
    config: DrcConfig,
    dispatch: Arc<dyn Dispatch<R>>,
    shared: Arc<Drc<R>>,
    registry: DrcRegistry<R>,
    /// Written under the registry lock.
    closed: AtomicBool,
    next_cache_id: AtomicU64,
}

impl<R> Subsystem<R> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrcError::unavailable("subsystem shut down"));
        }
        Ok(())
    }

    /// Drop one reference to `drc`, parking a per-connection cache that
    /// reaches zero.
    fn put_drc(&self, drc: &Arc<Drc<R>>) {
        let mut st = drc.lock_state();
        let Some(refcnt) = st.refcnt.checked_sub(1) else {
            drop(st);
            crate::fail_stop(format_args!("cache {} refcount underflow", drc.id()));
        };
        st.refcnt = refcnt;
        if refcnt > 0 || drc.kind().is_shared() {
            return;
        }
        drop(st);

        let mut reg = self.registry.lock();
        let mut st = drc.lock_state();
        // Revived or parked by someone else while no lock was held.
        if st.refcnt != 0 || st.recycle.is_some() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            drop(st);
            reg.untrack(drc);
            drop(reg);
            let purged = drc.purge();
            debug!(cache_id = drc.id(), purged, "drc_release_after_shutdown");
            return;
        }
        reg.park(drc, &mut st, Instant::now());
        drop(st);
        drop(reg);
        debug!(cache_id = drc.id(), peer = ?drc.peer(), "drc_park");
    }

    fn reap_expired(&self, now: Instant, force: bool) -> usize {
        let expired = self.registry.collect_expired(now, force);
        for drc in &expired {
            let _ = drc.purge();
        }
        expired.len()
    }

    fn close(&self) {
        let mut reg = self.registry.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let parked = reg.take_parked();
        drop(reg);

        let mut purged = 0;
        for drc in &parked {
            purged += drc.purge();
        }
        purged += self.shared.purge();
        info!(reaped = parked.len(), purged, "drc_subsystem: shut down");
    }
}

impl<R> Drop for Subsystem<R> {
    fn drop(&mut self) {
        self.close();
        // Handles acquired before shutdown may have inserted into the shared
        // cache after the close purge; nothing else can reach it now.
        let late = self.shared.purge();
        if late > 0 {
            debug!(late, "drc_subsystem: purged entries stored after shutdown");
        }
    }
}

fn add_refs<R>(st: &mut DrcState<R>, cache_id: u64, refs: u32) {
    match st.refcnt.checked_add(refs) {
        Some(refcnt) => st.refcnt = refcnt,
        None => crate::fail_stop(format_args!("cache {cache_id} refcount overflow")),
    }
}

fn get_drc<R>(drc: &Drc<R>, refs: u32) {
    let mut st = drc.lock_state();
    add_refs(&mut *st, drc.id(), refs);
}

/// Process-wide duplicate request cache context.
///
/// Cheap to clone; every clone, [`Connection`] and in-flight handle shares
/// one shared cache and one recycling registry.
pub struct DrcSubsystem<R> {
    inner: Arc<Subsystem<R>>,
}

impl<R> Clone for DrcSubsystem<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> DrcSubsystem<R> {
    /// Validate `config` and build the shared cache.
    pub fn new(config: DrcConfig, dispatch: Arc<dyn Dispatch<R>>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Drc::new(
            SHARED_CACHE_ID,
            DrcKind::Shared,
            None,
            *config.params_for(DrcKind::Shared),
            Arc::clone(&dispatch),
        )?);
        let registry = DrcRegistry::new(&config)?;
        info!(
            disabled = config.disabled,
            shared_size = config.shared.size,
            per_connection_size = config.per_connection.size,
            recycle_expire_secs = config.recycle_expire_secs,
            "drc_subsystem: initializing"
        );
        Ok(Self {
            inner: Arc::new(Subsystem {
                config,
                dispatch,
                shared,
                registry,
                closed: AtomicBool::new(false),
                next_cache_id: AtomicU64::new(SHARED_CACHE_ID + 1),
            }),
        })
    }

    /// Subsystem classifying with [`NfsDispatchTable`].
    pub fn with_nfs_dispatch(config: DrcConfig) -> Result<Self> {
        Self::new(config, Arc::new(NfsDispatchTable))
    }

    #[must_use]
    pub fn config(&self) -> &DrcConfig {
        &self.inner.config
    }

    /// Register a newly accepted stream connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId, peer: PeerAddr) -> Connection<R> {
        Connection {
            id,
            peer,
            attached: OnceLock::new(),
            subsystem: Arc::clone(&self.inner),
        }
    }

    /// Pin the cache that serves `req`.
    ///
    /// Datagrams share one cache. A stream connection gets its attached
    /// cache, a parked cache left behind by an earlier connection from the
    /// same peer, or a fresh one.
    pub fn acquire_drc(&self, req: &RequestDescriptor<'_, R>) -> Result<DrcHandle<R>> {
        let inner = &self.inner;
        if inner.config.disabled {
            return Err(DrcError::unavailable("caching disabled"));
        }
        inner.ensure_open()?;

        let drc = match req.origin {
            Origin::Datagram(_) => {
                get_drc(&inner.shared, 1);
                Arc::clone(&inner.shared)
            }
            Origin::Stream(conn) => {
                if !Arc::ptr_eq(&conn.subsystem, inner) {
                    return Err(DrcError::unavailable(format!(
                        "connection {} belongs to another subsystem",
                        conn.id.0
                    )));
                }
                match conn.attached.get() {
                    Some(drc) => {
                        get_drc(drc, 1);
                        Arc::clone(drc)
                    }
                    None => self.attach(conn, &req.call)?,
                }
            }
        };
        Ok(DrcHandle {
            subsystem: Arc::clone(inner),
            drc,
        })
    }

    /// Slow path of stream acquisition: find or build the connection's cache
    /// under the registry lock and attach it. Returns with the connection's
    /// reference and the caller's reference both taken.
    fn attach(&self, conn: &Connection<R>, call: &RpcCall) -> Result<Arc<Drc<R>>> {
        let inner = &self.inner;
        let mut spins = 0u32;
        let drc = loop {
            let mut reg = inner.registry.lock();
            inner.ensure_open()?;
            // Another request on this connection won the race.
            if let Some(drc) = conn.attached.get() {
                get_drc(drc, 1);
                return Ok(Arc::clone(drc));
            }

            let drc = if let Some(drc) = reg.lookup(conn.peer) {
                let mut st = drc.lock_state();
                if st.refcnt == 0 {
                    // Zero references but not parked yet: the last holder is
                    // between its release and the park.
                    let Some(marker) = st.recycle.take() else {
                        drop(st);
                        drop(reg);
                        spins += 1;
                        if spins > inner.config.max_revive_spins {
                            warn!(
                                cache_id = drc.id(),
                                peer = %conn.peer,
                                spins,
                                "drc_revive_spin_exhausted"
                            );
                            return Err(DrcError::unavailable(format!(
                                "cache {} for {} stuck between release and park",
                                drc.id(),
                                conn.peer
                            )));
                        }
                        std::thread::yield_now();
                        continue;
                    };
                    let _ = reg.unpark(marker);
                    debug!(cache_id = drc.id(), peer = %conn.peer, "drc_revive");
                } else {
                    debug!(
                        cache_id = drc.id(),
                        peer = %conn.peer,
                        refcnt = st.refcnt,
                        "drc_share_live"
                    );
                }
                add_refs(&mut *st, drc.id(), 2);
                drop(st);
                drc
            } else {
                let id = inner.next_cache_id.fetch_add(1, Ordering::Relaxed);
                let kind = DrcKind::for_call(Transport::Stream, call);
                let drc = Arc::new(Drc::new(
                    id,
                    kind,
                    Some(conn.peer),
                    *inner.config.params_for(kind),
                    Arc::clone(&inner.dispatch),
                )?);
                reg.track(&drc);
                get_drc(&drc, 2);
                drc
            };

            if conn.attached.set(Arc::clone(&drc)).is_err() {
                drop(reg);
                crate::fail_stop(format_args!(
                    "connection {} attached twice",
                    conn.id.0
                ));
            }
            drop(reg);
            break drc;
        };

        trace!(connection = conn.id.0, cache_id = drc.id(), "drc_attach");
        let _ = inner.reap_expired(Instant::now(), false);
        Ok(drc)
    }

    /// Classify `req`, pick its cache and look it up.
    ///
    /// Requests that are not cacheable, or that arrive while the cache
    /// cannot be engaged, come back as [`RequestSlot::Uncached`].
    pub fn start_request(&self, req: &RequestDescriptor<'_, R>) -> StartOutcome<R> {
        if !self.wants_cache(req) {
            trace!(call = %req.call, xid = %req.xid, "drc_bypass");
            return StartOutcome::Proceed(RequestSlot::Uncached(self.uncached(req.call)));
        }
        match self.acquire_drc(req) {
            Ok(handle) => handle.start(req),
            Err(err) => {
                warn!(
                    %err,
                    call = %req.call,
                    xid = %req.xid,
                    "drc_unavailable: executing uncached"
                );
                StartOutcome::Proceed(RequestSlot::Uncached(self.uncached(req.call)))
            }
        }
    }

    fn wants_cache(&self, req: &RequestDescriptor<'_, R>) -> bool {
        let inner = &self.inner;
        if inner.config.disabled || !inner.dispatch.classify(&req.call).is_cacheable() {
            return false;
        }
        if is_compound(&req.call) {
            let shape = req.compound.unwrap_or_default();
            return inner.dispatch.is_compound_cacheable(&req.call, &shape);
        }
        true
    }

    fn uncached(&self, call: RpcCall) -> UncachedRequest<R> {
        UncachedRequest {
            call,
            dispatch: Arc::clone(&self.inner.dispatch),
        }
    }

    #[must_use]
    pub fn stats(&self) -> SubsystemStats {
        SubsystemStats {
            disabled: self.inner.config.disabled,
            shared: self.inner.shared.stats(),
            registry: self.inner.registry.stats(),
        }
    }

    /// Reap parked caches idle past the expiry delta. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// [`Self::sweep_expired`] against an explicit clock reading.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        self.inner.reap_expired(now, true)
    }

    /// Refuse new acquisitions, reap every parked cache and purge the shared
    /// cache. Caches still pinned are purged when their last holder lets go.
    pub fn shutdown(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<R> fmt::Debug for DrcSubsystem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrcSubsystem")
            .field("config", &self.inner.config)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Connections and requests ───────────────────────────────────────────────

/// Per-connection state for a stream transport.
///
/// Holds the attach slot. Dropping the connection gives back its long-lived
/// cache reference, which parks the cache once in-flight requests finish.
pub struct Connection<R> {
    id: ConnectionId,
    peer: PeerAddr,
    attached: OnceLock<Arc<Drc<R>>>,
    subsystem: Arc<Subsystem<R>>,
}

impl<R> Connection<R> {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    /// Id of the cache attached by the first cached request, if any.
    #[must_use]
    pub fn attached_cache_id(&self) -> Option<u64> {
        self.attached.get().map(|drc| drc.id())
    }
}

impl<R> Drop for Connection<R> {
    fn drop(&mut self) {
        if let Some(drc) = self.attached.take() {
            trace!(connection = self.id.0, cache_id = drc.id(), "drc_detach");
            self.subsystem.put_drc(&drc);
        }
    }
}

impl<R> fmt::Debug for Connection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("attached", &self.attached_cache_id())
            .finish()
    }
}

/// Where a request came from.
pub enum Origin<'a, R> {
    Datagram(PeerAddr),
    Stream(&'a Connection<R>),
}

impl<R> Origin<'_, R> {
    #[must_use]
    pub fn peer(&self) -> PeerAddr {
        match self {
            Self::Datagram(peer) => *peer,
            Self::Stream(conn) => conn.peer,
        }
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        match self {
            Self::Datagram(_) => Transport::Datagram,
            Self::Stream(_) => Transport::Stream,
        }
    }
}

impl<R> Clone for Origin<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Origin<'_, R> {}

impl<R> fmt::Debug for Origin<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram(peer) => f.debug_tuple("Datagram").field(peer).finish(),
            Self::Stream(conn) => f.debug_tuple("Stream").field(&conn.id).finish(),
        }
    }
}

/// Everything the cache needs to know about one decoded request.
pub struct RequestDescriptor<'a, R> {
    pub origin: Origin<'a, R>,
    pub xid: Xid,
    /// Supplied by the transport; covers the request body.
    pub checksum: Checksum,
    pub call: RpcCall,
    /// COMPOUND lookahead, when the transport scanned one.
    pub compound: Option<CompoundShape>,
}

impl<'a, R> RequestDescriptor<'a, R> {
    #[must_use]
    pub fn datagram(peer: PeerAddr, xid: Xid, checksum: Checksum, call: RpcCall) -> Self {
        Self {
            origin: Origin::Datagram(peer),
            xid,
            checksum,
            call,
            compound: None,
        }
    }

    #[must_use]
    pub fn stream(conn: &'a Connection<R>, xid: Xid, checksum: Checksum, call: RpcCall) -> Self {
        Self {
            origin: Origin::Stream(conn),
            xid,
            checksum,
            call,
            compound: None,
        }
    }

    #[must_use]
    pub fn with_compound(mut self, shape: CompoundShape) -> Self {
        self.compound = Some(shape);
        self
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        self.origin.transport()
    }
}

impl<R> fmt::Debug for RequestDescriptor<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("origin", &self.origin)
            .field("xid", &self.xid)
            .field("checksum", &self.checksum)
            .field("call", &self.call)
            .field("compound", &self.compound)
            .finish()
    }
}

// ── Handles ────────────────────────────────────────────────────────────────

/// One pinned reference to a cache. Released on drop.
pub struct DrcHandle<R> {
    subsystem: Arc<Subsystem<R>>,
    drc: Arc<Drc<R>>,
}

impl<R> DrcHandle<R> {
    #[must_use]
    pub fn cache_id(&self) -> u64 {
        self.drc.id()
    }

    #[must_use]
    pub fn kind(&self) -> DrcKind {
        self.drc.kind()
    }

    #[must_use]
    pub fn stats(&self) -> DrcStats {
        self.drc.stats()
    }

    /// Keys in arrival order, oldest first.
    #[must_use]
    pub fn fifo_keys(&self) -> Vec<EntryKey> {
        self.drc.fifo_keys()
    }

    /// Look `req` up in this cache.
    ///
    /// The handle moves into the returned entry or reply handle, or is
    /// released here when the request is already executing.
    pub fn start(self, req: &RequestDescriptor<'_, R>) -> StartOutcome<R> {
        let key = self.drc.key_for(req.origin.peer(), req.xid, req.checksum);
        let lookup = self.drc.start(key, req.call);
        match lookup {
            Lookup::Miss(entry) => StartOutcome::Proceed(RequestSlot::Cached(EntryHandle {
                pending: Some((entry, self)),
            })),
            Lookup::Replay(entry, response) => StartOutcome::Replay(ReplyHandle {
                response: Some(response),
                origin: ReplyOrigin::Cached {
                    entry,
                    drc: self,
                    replayed: true,
                },
            }),
            Lookup::InProgress => StartOutcome::BeingProcessed,
        }
    }
}

impl<R> Drop for DrcHandle<R> {
    fn drop(&mut self) {
        self.subsystem.put_drc(&self.drc);
    }
}

impl<R> fmt::Debug for DrcHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrcHandle")
            .field("cache_id", &self.drc.id())
            .field("kind", &self.drc.kind())
            .finish_non_exhaustive()
    }
}

/// A pending cached request. Consume with [`finish`](Self::finish) or
/// [`delete`](Self::delete); dropping it unfinished deletes the entry so
/// retransmits are not blocked behind it.
pub struct EntryHandle<R> {
    pending: Option<(EntryRef<R>, DrcHandle<R>)>,
}

impl<R> EntryHandle<R> {
    fn parts(&self) -> &(EntryRef<R>, DrcHandle<R>) {
        self.pending
            .as_ref()
            .expect("entry handle is consumed only by value")
    }

    fn take(&mut self) -> (EntryRef<R>, DrcHandle<R>) {
        self.pending
            .take()
            .expect("entry handle is consumed only by value")
    }

    #[must_use]
    pub fn key(&self) -> EntryKey {
        *self.parts().0.key()
    }

    #[must_use]
    pub fn state(&self) -> EntryState {
        self.parts().0.state()
    }

    #[must_use]
    pub fn cache_id(&self) -> u64 {
        self.parts().1.cache_id()
    }

    /// Store `response` and hand it back for sending.
    pub fn finish(mut self, response: R) -> ReplyHandle<R> {
        let (entry, drc) = self.take();
        let response = drc.drc.finish(&entry, response);
        ReplyHandle {
            response: Some(response),
            origin: ReplyOrigin::Cached {
                entry,
                drc,
                replayed: false,
            },
        }
    }

    /// Abort path: nothing will be sent for this request.
    pub fn delete(mut self) {
        let (entry, drc) = self.take();
        let _ = drc.drc.delete(&entry);
        entry.put(drc.drc.dispatch());
    }
}

impl<R> Drop for EntryHandle<R> {
    fn drop(&mut self) {
        let Some((entry, drc)) = self.pending.take() else {
            return;
        };
        if std::thread::panicking() {
            return;
        }
        warn!(
            cache_id = drc.cache_id(),
            key = %entry.key(),
            call = %entry.call(),
            "drc_pending_abandoned"
        );
        let _ = drc.drc.delete(&entry);
        entry.put(drc.drc.dispatch());
    }
}

impl<R> fmt::Debug for EntryHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("EntryHandle");
        if let Some((entry, drc)) = &self.pending {
            let _ = s.field("cache_id", &drc.cache_id()).field("key", entry.key());
        }
        s.finish()
    }
}

/// A request executing without duplicate suppression.
pub struct UncachedRequest<R> {
    call: RpcCall,
    dispatch: Arc<dyn Dispatch<R>>,
}

impl<R> UncachedRequest<R> {
    #[must_use]
    pub fn call(&self) -> RpcCall {
        self.call
    }

    pub fn finish(self, response: R) -> ReplyHandle<R> {
        ReplyHandle {
            response: Some(Arc::new(response)),
            origin: ReplyOrigin::Uncached {
                call: self.call,
                dispatch: self.dispatch,
            },
        }
    }

    pub fn delete(self) {
        trace!(call = %self.call, "drc_uncached_abort");
    }
}

impl<R> fmt::Debug for UncachedRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncachedRequest")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

/// What the transport executes under after a `Proceed`.
#[derive(Debug)]
pub enum RequestSlot<R> {
    Cached(EntryHandle<R>),
    Uncached(UncachedRequest<R>),
}

impl<R> RequestSlot<R> {
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    #[must_use]
    pub fn key(&self) -> Option<EntryKey> {
        match self {
            Self::Cached(handle) => Some(handle.key()),
            Self::Uncached(_) => None,
        }
    }

    pub fn finish(self, response: R) -> ReplyHandle<R> {
        match self {
            Self::Cached(handle) => handle.finish(response),
            Self::Uncached(request) => request.finish(response),
        }
    }

    pub fn delete(self) {
        match self {
            Self::Cached(handle) => handle.delete(),
            Self::Uncached(request) => request.delete(),
        }
    }
}

enum ReplyOrigin<R> {
    Cached {
        entry: EntryRef<R>,
        drc: DrcHandle<R>,
        replayed: bool,
    },
    Uncached {
        call: RpcCall,
        dispatch: Arc<dyn Dispatch<R>>,
    },
}

/// A response ready to send. Releases the entry (or, uncached, the response
/// itself) on drop.
pub struct ReplyHandle<R> {
    response: Option<Arc<R>>,
    origin: ReplyOrigin<R>,
}

impl<R> ReplyHandle<R> {
    #[must_use]
    pub fn response(&self) -> &R {
        self.response
            .as_deref()
            .expect("reply response is taken only on drop")
    }

    /// Whether this answers a retransmit from the cache.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self.origin, ReplyOrigin::Cached { replayed: true, .. })
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self.origin, ReplyOrigin::Cached { .. })
    }

    #[must_use]
    pub fn key(&self) -> Option<EntryKey> {
        match &self.origin {
            ReplyOrigin::Cached { entry, .. } => Some(*entry.key()),
            ReplyOrigin::Uncached { .. } => None,
        }
    }
}

impl<R> Drop for ReplyHandle<R> {
    fn drop(&mut self) {
        let response = self.response.take();
        match &self.origin {
            ReplyOrigin::Cached { entry, drc, .. } => {
                drop(response);
                trace!(cache_id = drc.cache_id(), key = %entry.key(), "drc_release");
                entry.put(drc.drc.dispatch());
            }
            ReplyOrigin::Uncached { call, dispatch } => {
                if let Some(response) = response {
                    dispatch.release_response(call, response);
                }
            }
        }
    }
}

impl<R> fmt::Debug for ReplyHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("cached", &self.is_cached())
            .field("replay", &self.is_replay())
            .field("key", &self.key())
            .finish()
    }
}

/// Result of looking a request up.
#[derive(Debug)]
pub enum StartOutcome<R> {
    /// Execute the request, then finish or delete the slot.
    Proceed(RequestSlot<R>),
    /// Send the cached response; do not execute.
    Replay(ReplyHandle<R>),
    /// The identical request is executing; send nothing.
    BeingProcessed,
}

impl<R> StartOutcome<R> {
    #[must_use]
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed(_))
    }

    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay(_))
    }

    #[must_use]
    pub fn is_being_processed(&self) -> bool {
        matches!(self, Self::BeingProcessed)
    }

    #[must_use]
    pub fn into_slot(self) -> Option<RequestSlot<R>> {
        match self {
            Self::Proceed(slot) => Some(slot),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_reply(self) -> Option<ReplyHandle<R>> {
        match self {
            Self::Replay(reply) => Some(reply),
            _ => None,
        }
    }
}
