#![forbid(unsafe_code)]
//! Seeded multi-threaded workload for the duplicate request cache.
//!
//! Worker threads play a fixed population of clients. Each request picks a
//! client, a transport and a procedure; a share of requests retransmit a
//! recent transaction id instead of sending a new one. Workers check that
//! replays carry the original response and that no two workers ever execute
//! the same cached request at once.

use anyhow::{Context, Result, bail};
use drc_core::{
    Cacheability, Connection, Dispatch, DrcConfig, DrcSubsystem, NfsDispatchTable,
    RequestDescriptor, StartOutcome, SubsystemStats,
};
use drc_types::{Checksum, ConnectionId, PeerAddr, RpcCall, Transport, Xid, mix64, nfs3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Worker threads.
    pub threads: usize,
    /// Requests issued by each worker.
    pub requests_per_thread: u64,
    /// Seed for per-worker request generation.
    pub seed: u64,
    /// Distinct client addresses shared by all workers.
    pub clients: u16,
    /// Percentage of requests that resend a recent transaction id.
    pub retransmit_percent: u32,
    /// How far back a retransmit may reach, in transaction ids.
    pub retransmit_window: u32,
    /// Percentage of requests sent over a stream connection.
    pub stream_percent: u32,
    /// Percentage of executed requests aborted instead of answered.
    pub abort_percent: u32,
    /// A worker reopens its stream connection to a client after this many
    /// requests on it. Zero keeps connections open.
    pub reconnect_every: u64,
    pub drc: DrcConfig,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            requests_per_thread: 20_000,
            seed: 0xD2C0_5EED_0000_0001,
            clients: 8,
            retransmit_percent: 15,
            retransmit_window: 32,
            stream_percent: 50,
            abort_percent: 1,
            reconnect_every: 2_000,
            drc: DrcConfig::default(),
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be greater than zero");
        }
        if self.requests_per_thread == 0 {
            bail!("requests_per_thread must be greater than zero");
        }
        if self.clients == 0 {
            bail!("clients must be greater than zero");
        }
        for (name, value) in [
            ("retransmit_percent", self.retransmit_percent),
            ("stream_percent", self.stream_percent),
            ("abort_percent", self.abort_percent),
        ] {
            if value > 100 {
                bail!("{name} must be at most 100, got {value}");
            }
        }
        self.drc.validate().context("invalid drc configuration")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadReport {
    pub requests: u64,
    /// Requests executed under a fresh cache entry.
    pub proceeded: u64,
    pub replays: u64,
    /// Retransmits dropped because the original was still executing.
    pub in_progress: u64,
    /// Requests executed without the cache.
    pub uncached: u64,
    pub aborted: u64,
    pub reconnects: u64,
    /// Cached requests executed by two workers at once. Must be zero.
    pub double_misses: u64,
    /// Replays whose response did not match the original. Must be zero.
    pub mismatched_replays: u64,
    /// Entries retired across the shared and every per-connection cache.
    pub retired: u64,
    /// Responses produced (cached or not) versus handed back for teardown
    /// after shutdown. Equal unless a response leaked.
    pub responses_produced: u64,
    pub responses_released: u64,
    pub hit_rate: f64,
    pub elapsed_ms: u64,
    pub stats: SubsystemStats,
}

// ── Deterministic generation ───────────────────────────────────────────────

struct Rng64 {
    state: u64,
}

impl Rng64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive <= 1 {
            return 0;
        }
        self.next_u64() % upper_exclusive
    }

    fn percent(&mut self, percent: u32) -> bool {
        self.below(100) < u64::from(percent)
    }
}

fn client_addr(client: u16) -> PeerAddr {
    let [hi, lo] = client.to_be_bytes();
    PeerAddr(SocketAddr::from(([10, 77, hi, lo], 800 + client % 200)))
}

fn pick_call(rng: &mut Rng64) -> RpcCall {
    match rng.below(10) {
        0..=5 => RpcCall::nfs3(nfs3::WRITE),
        6 => RpcCall::nfs3(nfs3::CREATE),
        7 => RpcCall::nfs3(nfs3::REMOVE),
        _ => RpcCall::nfs3(nfs3::READ),
    }
}

/// Response body for a request; replays must reproduce it.
fn response_for(client: u16, transport: Transport, xid: u32) -> u64 {
    let lane = (u64::from(client) << 1) | u64::from(transport == Transport::Stream);
    mix64((lane << 32) | u64::from(xid))
}

// ── Shared run state ───────────────────────────────────────────────────────

/// Counts responses handed back to the dispatch table.
#[derive(Default)]
struct CountingDispatch {
    released: AtomicU64,
}

impl Dispatch<u64> for CountingDispatch {
    fn classify(&self, call: &RpcCall) -> Cacheability {
        NfsDispatchTable::classify_call(call)
    }

    fn release_response(&self, _call: &RpcCall, _response: Arc<u64>) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    proceeded: AtomicU64,
    replays: AtomicU64,
    in_progress: AtomicU64,
    uncached: AtomicU64,
    aborted: AtomicU64,
    reconnects: AtomicU64,
    double_misses: AtomicU64,
    mismatched_replays: AtomicU64,
    produced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Identity of a cached request across workers: client, transport, xid
/// and checksum.
type LaneKey = (u16, Transport, u32, u64);

struct Shared {
    drc: DrcSubsystem<u64>,
    counters: Counters,
    /// Next fresh transaction id per client.
    next_xid: Vec<AtomicU32>,
    executing: Mutex<HashSet<LaneKey>>,
    /// Highest retirement count observed per per-connection cache.
    connection_retired: Mutex<BTreeMap<u64, u64>>,
    next_connection: AtomicU64,
}

impl Shared {
    fn note_connection_retired(&self, conn: &Connection<u64>) {
        if conn.attached_cache_id().is_none() {
            return;
        }
        let call = RpcCall::nfs3(nfs3::WRITE);
        let probe = RequestDescriptor::stream(conn, Xid(0), Checksum::ZERO, call);
        let Ok(handle) = self.drc.acquire_drc(&probe) else {
            return;
        };
        let stats = handle.stats();
        drop(handle);
        let mut retired = self.connection_retired.lock();
        let seen = retired.entry(stats.cache_id).or_insert(0);
        *seen = (*seen).max(stats.retired);
    }
}

struct Worker<'a> {
    shared: &'a Shared,
    config: &'a WorkloadConfig,
    rng: Rng64,
    connections: Vec<Option<(Connection<u64>, u64)>>,
}

impl<'a> Worker<'a> {
    fn new(shared: &'a Shared, config: &'a WorkloadConfig, index: usize) -> Self {
        let salt = u64::try_from(index).unwrap_or(u64::MAX);
        Self {
            shared,
            config,
            rng: Rng64::new(config.seed ^ mix64(salt + 1)),
            connections: (0..config.clients).map(|_| None).collect(),
        }
    }

    fn pick_xid(&mut self, client: u16) -> u32 {
        let shared = self.shared;
        let counter = &shared.next_xid[usize::from(client)];
        if self.rng.percent(self.config.retransmit_percent) {
            let latest = counter.load(Ordering::Relaxed);
            if latest > 0 {
                let back = self.rng.below(u64::from(self.config.retransmit_window.max(1)));
                let back = u32::try_from(back).unwrap_or(0);
                return latest.saturating_sub(1).saturating_sub(back);
            }
        }
        counter.fetch_add(1, Ordering::Relaxed)
    }

    /// The worker's connection to `client`, reopened every
    /// `reconnect_every` requests.
    fn connection(&mut self, client: u16) -> &Connection<u64> {
        let slot = &mut self.connections[usize::from(client)];
        let limit = self.config.reconnect_every;
        let worn_out = limit > 0 && slot.as_ref().is_some_and(|(_, used)| *used >= limit);
        if let Some((conn, _)) = worn_out.then(|| slot.take()).flatten() {
            self.shared.note_connection_retired(&conn);
            debug!(connection = conn.id().0, client, "harness_reconnect");
            Counters::bump(&self.shared.counters.reconnects);
        }
        let (conn, used) = slot.get_or_insert_with(|| {
            let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
            (
                self.shared.drc.connection(ConnectionId(id), client_addr(client)),
                0,
            )
        });
        *used += 1;
        conn
    }

    fn run(mut self) {
        for _ in 0..self.config.requests_per_thread {
            self.one_request();
        }
        for (conn, _) in self.connections.iter().flatten() {
            self.shared.note_connection_retired(conn);
        }
    }

    fn one_request(&mut self) {
        let shared = self.shared;
        let counters = &shared.counters;
        Counters::bump(&counters.requests);

        let client = u16::try_from(self.rng.below(u64::from(self.config.clients))).unwrap_or(0);
        let transport = if self.rng.percent(self.config.stream_percent) {
            Transport::Stream
        } else {
            Transport::Datagram
        };
        let xid = self.pick_xid(client);
        let call = pick_call(&mut self.rng);
        let abort = self.rng.percent(self.config.abort_percent);
        let checksum = Checksum(mix64(u64::from(xid) ^ (u64::from(call.procedure) << 40)));
        let expected = response_for(client, transport, xid);
        let lane = (client, transport, xid, checksum.0);

        let req = match transport {
            Transport::Datagram => {
                RequestDescriptor::datagram(client_addr(client), Xid(xid), checksum, call)
            }
            Transport::Stream => {
                RequestDescriptor::stream(self.connection(client), Xid(xid), checksum, call)
            }
        };

        match shared.drc.start_request(&req) {
            StartOutcome::Proceed(slot) => {
                let cached = slot.is_cached();
                if cached {
                    Counters::bump(&counters.proceeded);
                    if !shared.executing.lock().insert(lane) {
                        Counters::bump(&counters.double_misses);
                    }
                } else {
                    Counters::bump(&counters.uncached);
                }
                thread::yield_now();
                if cached {
                    shared.executing.lock().remove(&lane);
                }
                if abort {
                    Counters::bump(&counters.aborted);
                    slot.delete();
                } else {
                    Counters::bump(&counters.produced);
                    drop(slot.finish(expected));
                }
            }
            StartOutcome::Replay(reply) => {
                Counters::bump(&counters.replays);
                if *reply.response() != expected {
                    Counters::bump(&counters.mismatched_replays);
                }
            }
            StartOutcome::BeingProcessed => Counters::bump(&counters.in_progress),
        }
    }
}

/// Run `config` to completion, shut the subsystem down and report.
pub fn run_workload(config: &WorkloadConfig) -> Result<WorkloadReport> {
    config.validate()?;
    let dispatch = Arc::new(CountingDispatch::default());
    let drc = DrcSubsystem::<u64>::new(config.drc.clone(), Arc::clone(&dispatch) as _)
        .context("failed to build duplicate request cache")?;
    let shared = Shared {
        drc,
        counters: Counters::default(),
        next_xid: (0..config.clients).map(|_| AtomicU32::new(1)).collect(),
        executing: Mutex::new(HashSet::new()),
        connection_retired: Mutex::new(BTreeMap::new()),
        next_connection: AtomicU64::new(1),
    };

    info!(
        threads = config.threads,
        requests_per_thread = config.requests_per_thread,
        clients = config.clients,
        seed = config.seed,
        "harness_workload_start"
    );
    let start = Instant::now();
    thread::scope(|s| {
        for index in 0..config.threads {
            let worker = Worker::new(&shared, config, index);
            s.spawn(move || worker.run());
        }
    });
    let elapsed = start.elapsed();

    let stats = shared.drc.stats();
    shared.drc.shutdown();
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    let c = &shared.counters;
    let connection_retired: u64 = shared.connection_retired.lock().values().sum();
    let proceeded = load(&c.proceeded);
    let replays = load(&c.replays);

    let report = WorkloadReport {
        requests: load(&c.requests),
        proceeded,
        replays,
        in_progress: load(&c.in_progress),
        uncached: load(&c.uncached),
        aborted: load(&c.aborted),
        reconnects: load(&c.reconnects),
        double_misses: load(&c.double_misses),
        mismatched_replays: load(&c.mismatched_replays),
        retired: stats.shared.retired + connection_retired,
        responses_produced: load(&c.produced),
        responses_released: dispatch.released.load(Ordering::Relaxed),
        hit_rate: hit_rate(replays, proceeded),
        elapsed_ms: duration_ms(elapsed),
        stats,
    };
    info!(
        requests = report.requests,
        replays = report.replays,
        double_misses = report.double_misses,
        elapsed_ms = report.elapsed_ms,
        "harness_workload_done"
    );
    Ok(report)
}

#[expect(clippy::cast_precision_loss)] // reporting only
fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

// ── Configuration files ────────────────────────────────────────────────────

/// Load a [`DrcConfig`] from JSON (`.json`) or an `NFS_Core_Param` block.
pub fn load_drc_config(path: &Path) -> Result<DrcConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config = if path.extension().is_some_and(|ext| ext == "json") {
        let config: DrcConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        config.validate()?;
        config
    } else {
        DrcConfig::parse_core_params(&text)
            .with_context(|| format!("invalid core parameters in {}", path.display()))?
    };
    Ok(config)
}

pub fn load_workload_config(path: &Path) -> Result<WorkloadConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}
