#![forbid(unsafe_code)]
//! Whole-subsystem runs driven through the harness: concurrent clients over
//! both transports, retransmissions, aborts and reconnects.

use drc_harness::{WorkloadConfig, WorkloadReport, load_workload_config, run_workload};
use std::path::{Path, PathBuf};

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

fn assert_consistent(report: &WorkloadReport, expected_requests: u64) {
    assert_eq!(report.requests, expected_requests);
    assert_eq!(
        report.proceeded + report.replays + report.in_progress + report.uncached,
        report.requests,
        "every request ends in exactly one outcome"
    );
    assert_eq!(report.double_misses, 0, "a cached request executed twice at once");
    assert_eq!(report.mismatched_replays, 0, "a replay carried the wrong response");
    assert_eq!(
        report.responses_produced, report.responses_released,
        "every response is handed back once the subsystem shuts down"
    );
}

#[test]
fn contended_fixture_workload_is_consistent() {
    let config = load_workload_config(&fixture_path("workload_contended.json")).expect("fixture");
    assert_eq!(config.threads, 6);
    assert_eq!(config.drc.shared.hiwat, 64);

    let report = run_workload(&config).expect("run");
    assert_consistent(&report, 18_000);
    assert!(report.replays > 0, "retransmissions should replay");
    assert!(report.reconnects > 0, "stream connections should be reopened");
    assert!(report.aborted > 0);
    assert!(report.retired > 0, "small caches must retire entries");
    assert!(report.stats.shared.size <= report.stats.shared.max_size);
}

#[test]
fn datagram_only_workload() {
    let config = WorkloadConfig {
        threads: 4,
        requests_per_thread: 2_000,
        clients: 2,
        stream_percent: 0,
        ..WorkloadConfig::default()
    };
    let report = run_workload(&config).expect("run");
    assert_consistent(&report, 8_000);
    assert_eq!(report.reconnects, 0);
    assert_eq!(report.stats.registry.tracked, 0);
}

#[test]
fn stream_only_workload_recycles_connection_caches() {
    let config = WorkloadConfig {
        threads: 3,
        requests_per_thread: 2_000,
        clients: 3,
        stream_percent: 100,
        reconnect_every: 40,
        ..WorkloadConfig::default()
    };
    let report = run_workload(&config).expect("run");
    assert_consistent(&report, 6_000);
    assert!(report.reconnects > 0);
    // No datagram traffic ever reached the shared cache.
    assert_eq!(report.stats.shared.misses, 0);
    // One live or parked cache per client address at most.
    assert!(report.stats.registry.tracked <= 3);
}

#[test]
fn single_thread_runs_are_reproducible() {
    let config = WorkloadConfig {
        threads: 1,
        requests_per_thread: 1_500,
        seed: 0xFEED,
        clients: 5,
        ..WorkloadConfig::default()
    };
    let first = run_workload(&config).expect("first run");
    let second = run_workload(&config).expect("second run");
    assert_consistent(&first, 1_500);
    assert_eq!(first.proceeded, second.proceeded);
    assert_eq!(first.replays, second.replays);
    assert_eq!(first.uncached, second.uncached);
    assert_eq!(first.aborted, second.aborted);
    assert_eq!(first.retired, second.retired);
}

#[test]
fn invalid_workload_is_rejected() {
    let config = WorkloadConfig {
        stream_percent: 150,
        ..WorkloadConfig::default()
    };
    let err = run_workload(&config).expect_err("invalid workload");
    assert!(format!("{err:#}").contains("stream_percent"));
}
