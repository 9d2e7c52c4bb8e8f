#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use drc_core::DrcConfig;
use drc_harness::{WorkloadConfig, load_drc_config, load_workload_config, run_workload};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("run") => run_cmd(&args[1..]),
        Some("config") => config_cmd(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn run_cmd(args: &[String]) -> Result<()> {
    let mut config = WorkloadConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let value = || {
            args.get(index + 1)
                .with_context(|| format!("{flag} requires a value"))
        };
        match flag {
            "--workload" => {
                config = load_workload_config(Path::new(value()?))?;
            }
            "--drc-config" => {
                config.drc = load_drc_config(Path::new(value()?))?;
            }
            "--threads" => {
                config.threads = value()?.parse().context("invalid --threads value")?;
            }
            "--requests" => {
                config.requests_per_thread =
                    value()?.parse().context("invalid --requests value")?;
            }
            "--seed" => {
                config.seed = parse_seed(value()?)?;
            }
            "--clients" => {
                config.clients = value()?.parse().context("invalid --clients value")?;
            }
            "--retransmit" => {
                config.retransmit_percent =
                    value()?.parse().context("invalid --retransmit value")?;
            }
            "--stream" => {
                config.stream_percent = value()?.parse().context("invalid --stream value")?;
            }
            "--abort" => {
                config.abort_percent = value()?.parse().context("invalid --abort value")?;
            }
            "--reconnect-every" => {
                config.reconnect_every =
                    value()?.parse().context("invalid --reconnect-every value")?;
            }
            _ => bail!("unknown run option: {flag}"),
        }
        index += 2;
    }

    let report = run_workload(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.double_misses > 0 || report.mismatched_replays > 0 {
        bail!(
            "cache misbehaved: {} double misses, {} mismatched replays",
            report.double_misses,
            report.mismatched_replays
        );
    }
    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.with_context(|| format!("invalid --seed value: {raw}"))
}

fn config_cmd(args: &[String]) -> Result<()> {
    let config = match args.first() {
        Some(path) => load_drc_config(Path::new(path))?,
        None => DrcConfig::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn print_usage() {
    eprintln!("drc-harness: duplicate request cache workload runner");
    eprintln!();
    eprintln!("usage:");
    eprintln!("  drc-harness run [options]        run a workload and print the JSON report");
    eprintln!("  drc-harness config [FILE]        print the effective cache configuration");
    eprintln!("  drc-harness help");
    eprintln!();
    eprintln!("run options:");
    eprintln!("  --workload FILE         workload configuration (JSON)");
    eprintln!("  --drc-config FILE       cache configuration (JSON or NFS_Core_Param block)");
    eprintln!("  --threads N             worker threads");
    eprintln!("  --requests N            requests per worker");
    eprintln!("  --seed N                generation seed (decimal or 0x-prefixed hex)");
    eprintln!("  --clients N             distinct client addresses");
    eprintln!("  --retransmit PCT        share of requests that resend a recent xid");
    eprintln!("  --stream PCT            share of requests sent over stream connections");
    eprintln!("  --abort PCT             share of executed requests aborted");
    eprintln!("  --reconnect-every N     requests per stream connection before reopening");
    eprintln!();
    eprintln!("RUST_LOG controls log verbosity (default: info).");
}
