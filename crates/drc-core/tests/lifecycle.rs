use drc_core::{
    CacheParams, Cacheability, Dispatch, DrcConfig, DrcSubsystem, NfsDispatchTable,
    RequestDescriptor, RequestSlot, StartOutcome,
};
use drc_types::{Checksum, ConnectionId, PeerAddr, RpcCall, Xid, nfs3};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Counts responses handed back for teardown.
#[derive(Default)]
struct CountingDispatch {
    released: AtomicUsize,
}

impl CountingDispatch {
    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Dispatch<u64> for CountingDispatch {
    fn classify(&self, call: &RpcCall) -> Cacheability {
        NfsDispatchTable::classify_call(call)
    }

    fn release_response(&self, _call: &RpcCall, _response: Arc<u64>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn client(last_octet: u8, port: u16) -> PeerAddr {
    PeerAddr(SocketAddr::from(([172, 16, 0, last_octet], port)))
}

fn datagram(xid: u32) -> RequestDescriptor<'static, u64> {
    RequestDescriptor::datagram(
        client(1, 800),
        Xid(xid),
        Checksum(0xfeed_0000 | u64::from(xid)),
        RpcCall::nfs3(nfs3::WRITE),
    )
}

fn shared_sized(size: usize, hiwat: usize) -> DrcConfig {
    DrcConfig {
        shared: CacheParams {
            npart: 1,
            size,
            cachesz: 7,
            hiwat,
            checksum: true,
        },
        ..DrcConfig::default()
    }
}

fn subsystem(config: DrcConfig) -> DrcSubsystem<u64> {
    DrcSubsystem::with_nfs_dispatch(config).expect("subsystem")
}

fn proceed(outcome: StartOutcome<u64>) -> RequestSlot<u64> {
    match outcome {
        StartOutcome::Proceed(slot) => slot,
        StartOutcome::Replay(_) => panic!("expected proceed, got replay"),
        StartOutcome::BeingProcessed => panic!("expected proceed, got in-progress"),
    }
}

/// Execute one request end to end: start, finish, send.
fn execute(drc: &DrcSubsystem<u64>, req: &RequestDescriptor<'_, u64>) {
    drop(proceed(drc.start_request(req)).finish(u64::from(req.xid.0)));
}

fn shared_xids(drc: &DrcSubsystem<u64>) -> Vec<u32> {
    let handle = drc.acquire_drc(&datagram(0)).expect("shared cache");
    handle.fifo_keys().iter().map(|key| key.xid.0).collect()
}

// ── Duplicate detection ────────────────────────────────────────────────────

#[test]
fn concurrent_identical_starts_create_one_entry() {
    const THREADS: usize = 8;
    let drc = subsystem(DrcConfig::default());
    let req = datagram(42);
    let barrier = Barrier::new(THREADS);

    let outcomes: Vec<StartOutcome<u64>> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    drc.start_request(&req)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker"))
            .collect()
    });

    let mut slots = Vec::new();
    let mut in_progress = 0;
    for outcome in outcomes {
        match outcome {
            StartOutcome::Proceed(slot) => slots.push(slot),
            StartOutcome::BeingProcessed => in_progress += 1,
            StartOutcome::Replay(_) => panic!("nothing was finished yet"),
        }
    }
    assert_eq!(slots.len(), 1);
    assert_eq!(in_progress, THREADS - 1);
    drop(slots.pop().expect("creator").finish(7));

    // Once finished, every retransmit replays.
    let barrier = Barrier::new(THREADS);
    let replays: Vec<u64> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let reply = drc.start_request(&req).into_reply().expect("replay");
                    assert!(reply.is_replay());
                    *reply.response()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker"))
            .collect()
    });
    assert_eq!(replays, vec![7; THREADS]);

    let stats = drc.stats().shared;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, THREADS as u64);
    assert_eq!(stats.in_progress, (THREADS - 1) as u64);
    assert_eq!(stats.refcnt, 0);
}

#[test]
fn changed_checksum_is_a_new_request() {
    let drc = subsystem(DrcConfig::default());
    execute(&drc, &datagram(5));
    let mut reused = datagram(5);
    reused.checksum = Checksum(1);
    assert!(proceed(drc.start_request(&reused)).is_cached());
}

// ── Retirement ─────────────────────────────────────────────────────────────

#[test]
fn hard_cap_retires_first_inserted() {
    let drc = subsystem(shared_sized(4, 4));
    for xid in 1..=4 {
        execute(&drc, &datagram(xid));
    }
    assert_eq!(drc.stats().shared.retired, 0);

    execute(&drc, &datagram(5));
    let stats = drc.stats().shared;
    assert_eq!(stats.retired, 1);
    assert_eq!(stats.size, 4);
    assert_eq!(shared_xids(&drc), vec![2, 3, 4, 5]);

    // The retired request runs again; the others still replay.
    assert!(drc.start_request(&datagram(2)).is_replay());
    assert!(proceed(drc.start_request(&datagram(1))).is_cached());
}

#[test]
fn closed_window_above_watermark_retires_each_finish() {
    let drc = subsystem(shared_sized(4, 2));
    for xid in 1..=2 {
        execute(&drc, &datagram(xid));
    }
    assert_eq!(drc.stats().shared.retired, 0);

    // With no hits the window stays shut, so every finish past the
    // watermark trims the cache back down to it.
    for xid in 3..=5 {
        execute(&drc, &datagram(xid));
        assert_eq!(drc.stats().shared.size, 2);
    }
    let stats = drc.stats().shared;
    assert_eq!(stats.retired, 3);
    assert_eq!(stats.retire_window, 0);
    assert_eq!(shared_xids(&drc), vec![4, 5]);
}

#[test]
fn hard_cap_with_all_starts_first() {
    let drc = subsystem(shared_sized(4, 4));
    let slots: Vec<_> = (1..=5)
        .map(|xid| proceed(drc.start_request(&datagram(xid))))
        .collect();
    for slot in slots {
        drop(slot.finish(0));
    }
    assert_eq!(drc.stats().shared.retired, 1);
    assert_eq!(shared_xids(&drc), vec![2, 3, 4, 5]);
}

#[test]
fn retirement_follows_arrival_order() {
    let drc = subsystem(shared_sized(64, 8));
    let order = [9, 3, 17, 1, 12, 6, 20, 2, 15, 11, 4, 8];
    for xid in order {
        execute(&drc, &datagram(xid));
    }
    let retired = drc.stats().shared.retired;
    assert_eq!(retired, 4);
    assert_eq!(shared_xids(&drc), order[4..].to_vec());
}

#[test]
fn replay_hits_hold_the_window_open() {
    let drc = subsystem(shared_sized(32, 2));
    let hot = datagram(1000);
    execute(&drc, &hot);

    for _ in 0..20 {
        let reply = drc.start_request(&hot).into_reply().expect("replay");
        assert_eq!(*reply.response(), 1000);
    }
    let stats = drc.stats().shared;
    assert_eq!(stats.retire_window, 32);

    // Far above the watermark, but the window holds every entry.
    for xid in 1..=31 {
        execute(&drc, &datagram(xid));
    }
    let stats = drc.stats().shared;
    assert_eq!((stats.size, stats.retire_window, stats.retired), (32, 1, 0));

    // Window closed and over the cap: one batch from the head, hot key first.
    execute(&drc, &datagram(32));
    let stats = drc.stats().shared;
    assert_eq!(stats.retire_window, 0);
    assert_eq!(stats.retired, 6);
    assert_eq!(shared_xids(&drc).first(), Some(&6));
    assert!(proceed(drc.start_request(&hot)).is_cached());
}

// ── Recycling ──────────────────────────────────────────────────────────────

#[test]
fn reconnect_reuses_parked_cache() {
    let drc = subsystem(DrcConfig::default());
    let peer = client(9, 1020);
    let create = RpcCall::nfs3(nfs3::CREATE);

    let first = drc.connection(ConnectionId(1), peer);
    let req = RequestDescriptor::stream(&first, Xid(77), Checksum(5), create);
    execute(&drc, &req);
    let cache_id = first.attached_cache_id().expect("attached");
    drop(first);
    assert_eq!(drc.stats().registry.parked, 1);

    let second = drc.connection(ConnectionId(2), peer);
    let req = RequestDescriptor::stream(&second, Xid(77), Checksum(5), create);
    let handle = drc.acquire_drc(&req).expect("acquire");
    assert_eq!(handle.cache_id(), cache_id);
    assert_eq!(handle.stats().size, 1);
    assert!(handle.start(&req).is_replay());

    // A different peer never sees that history.
    let other = drc.connection(ConnectionId(3), client(10, 1020));
    let req = RequestDescriptor::stream(&other, Xid(77), Checksum(5), create);
    assert!(proceed(drc.start_request(&req)).is_cached());
    assert_ne!(other.attached_cache_id(), Some(cache_id));
}

#[test]
fn one_connection_one_cache() {
    let drc = subsystem(DrcConfig::default());
    let conn = drc.connection(ConnectionId(1), client(2, 700));
    let barrier = Barrier::new(6);
    thread::scope(|s| {
        for xid in 0..6 {
            let (drc, conn, barrier) = (&drc, &conn, &barrier);
            s.spawn(move || {
                barrier.wait();
                let call = RpcCall::nfs3(nfs3::MKDIR);
                let req = RequestDescriptor::stream(conn, Xid(xid), Checksum(1), call);
                execute(drc, &req);
            });
        }
    });
    let registry = drc.stats().registry;
    assert_eq!(registry.tracked, 1);
    let req = RequestDescriptor::stream(&conn, Xid(0), Checksum(1), RpcCall::nfs3(nfs3::MKDIR));
    let handle = drc.acquire_drc(&req).expect("acquire");
    assert_eq!(Some(handle.cache_id()), conn.attached_cache_id());
    assert_eq!(handle.stats().size, 6);
    // Connection reference plus this handle.
    assert_eq!(handle.stats().refcnt, 2);
}

#[test]
fn expired_cache_is_replaced() {
    let drc = subsystem(DrcConfig::default());
    let peer = client(3, 1021);
    let call = RpcCall::nfs3(nfs3::RENAME);

    let first = drc.connection(ConnectionId(1), peer);
    execute(&drc, &RequestDescriptor::stream(&first, Xid(1), Checksum(2), call));
    let cache_id = first.attached_cache_id().expect("attached");
    drop(first);

    let expire = Duration::from_secs(drc.config().recycle_expire_secs);
    assert_eq!(drc.sweep_expired_at(Instant::now() + expire / 2), 0);
    let past_expiry = Instant::now() + expire + Duration::from_secs(1);
    assert_eq!(drc.sweep_expired_at(past_expiry), 1);
    let registry = drc.stats().registry;
    assert_eq!((registry.tracked, registry.parked, registry.expired_total), (0, 0, 1));

    let second = drc.connection(ConnectionId(2), peer);
    let req = RequestDescriptor::stream(&second, Xid(1), Checksum(2), call);
    assert!(proceed(drc.start_request(&req)).is_cached());
    assert_ne!(second.attached_cache_id(), Some(cache_id));
}

#[test]
fn new_connections_sweep_opportunistically() {
    let drc = subsystem(DrcConfig {
        recycle_expire_secs: 0,
        expire_check_interval_secs: 0,
        ..DrcConfig::default()
    });
    let call = RpcCall::nfs3(nfs3::SETATTR);

    let idle = drc.connection(ConnectionId(1), client(4, 900));
    execute(&drc, &RequestDescriptor::stream(&idle, Xid(1), Checksum(1), call));
    drop(idle);
    assert_eq!(drc.stats().registry.parked, 1);
    thread::sleep(Duration::from_millis(5));

    let fresh = drc.connection(ConnectionId(2), client(5, 900));
    execute(&drc, &RequestDescriptor::stream(&fresh, Xid(1), Checksum(1), call));
    let registry = drc.stats().registry;
    assert_eq!(registry.parked, 0);
    assert_eq!(registry.expired_total, 1);
    assert_eq!(registry.tracked, 1);
}

// ── Teardown ───────────────────────────────────────────────────────────────

#[test]
fn responses_are_released_once() {
    let dispatch = Arc::new(CountingDispatch::default());
    let drc = DrcSubsystem::<u64>::new(DrcConfig::default(), Arc::clone(&dispatch) as _)
        .expect("subsystem");

    let req = datagram(1);
    execute(&drc, &req);
    for _ in 0..3 {
        drop(drc.start_request(&req).into_reply().expect("replay"));
    }
    // The index still holds the entry.
    assert_eq!(dispatch.released(), 0);

    // Aborted requests have nothing to release.
    proceed(drc.start_request(&datagram(2))).delete();
    assert_eq!(dispatch.released(), 0);

    // Uncached responses go straight back.
    let call = RpcCall::nfs3(nfs3::LOOKUP);
    let lookup = RequestDescriptor::datagram(client(1, 800), Xid(3), Checksum(3), call);
    drop(proceed(drc.start_request(&lookup)).finish(0));
    assert_eq!(dispatch.released(), 1);

    // A reply still being sent keeps its entry alive through shutdown.
    let held = drc.start_request(&req).into_reply().expect("replay");
    drc.shutdown();
    assert_eq!(dispatch.released(), 1);
    drop(held);
    assert_eq!(dispatch.released(), 2);
}

#[test]
fn connection_outliving_shutdown_is_purged_on_close() {
    let dispatch = Arc::new(CountingDispatch::default());
    let drc = DrcSubsystem::<u64>::new(DrcConfig::default(), Arc::clone(&dispatch) as _)
        .expect("subsystem");
    let conn = drc.connection(ConnectionId(1), client(6, 2000));
    let call = RpcCall::nfs3(nfs3::LINK);
    execute(&drc, &RequestDescriptor::stream(&conn, Xid(1), Checksum(1), call));

    drc.shutdown();
    assert_eq!(drc.stats().registry.tracked, 1);
    assert_eq!(dispatch.released(), 0);

    drop(conn);
    assert_eq!(drc.stats().registry.tracked, 0);
    assert_eq!(dispatch.released(), 1);
}

#[test]
fn core_params_drive_the_subsystem() {
    let config = DrcConfig::parse_core_params(
        "NFS_Core_Param {\n    DRC_Disabled = true;\n    Nb_Worker = 16;\n}\n",
    )
    .expect("parse");
    let drc = subsystem(config);
    assert!(!proceed(drc.start_request(&datagram(1))).is_cached());
    assert_eq!(drc.stats().shared.misses, 0);
}
