//! pipebench: pipelined, per-core RPC throughput benchmark client.
//!
//! Spawns one client shard per online core. Shard `i` benchmarks against
//! the `i`-th entry of `--tcp-remotes`; shards without an assigned remote
//! log a warning and stop. Ctrl-C requests a graceful stop on every shard;
//! each still produces its final report.

mod affinity;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pipebench::{Client, ClientConfig, Error, SessionConfig, StopHandle};

#[derive(Parser, Debug)]
#[command(name = "pipebench")]
#[command(about = "Pipelined RPC throughput benchmark client")]
struct Cli {
    /// How many bytes to send with each request (includes the 16-byte header)
    #[arg(long, default_value_t = 512)]
    request_size: u32,

    /// How many requests the server acks at once
    #[arg(long, default_value_t = 5)]
    ack_count: u32,

    /// How much data we allow to go un-acked, in MiB
    #[arg(long, default_value_t = 200)]
    pipeline_depth_mbytes: u32,

    /// How many requests we allow to go un-acked
    #[arg(long, default_value_t = 10)]
    pipeline_depth_count: u32,

    /// Ask the server to echo request payloads in its acks
    #[arg(long)]
    echo_mode: bool,

    /// Space-separated bootstrap endpoint URLs, one per core,
    /// e.g. 'tcp://192.168.1.2:12345'
    #[arg(long, num_args = 0.., value_delimiter = ' ')]
    tcp_remotes: Vec<String>,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 30)]
    test_duration_s: u64,

    /// Pin shard i to core i
    #[arg(long)]
    pin_cores: bool,
}

static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SIGINT_SEEN.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

struct ShardOutcome {
    shard_id: usize,
    had_remote: bool,
    result: Result<pipebench::Report, Error>,
}

/// Failed shards that had an assigned remote; shards beyond the remote
/// list warn and stop on their own without affecting the exit code.
fn startup_failures(outcomes: &[ShardOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|outcome| outcome.had_remote && outcome.result.is_err())
        .count()
}

fn exit_code(outcomes: &[ShardOutcome]) -> ExitCode {
    if startup_failures(outcomes) > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.tcp_remotes.is_empty() {
        error!("no --tcp-remotes configured, nothing to benchmark");
        return ExitCode::FAILURE;
    }

    let config = ClientConfig::new()
        .with_session(
            SessionConfig::new()
                .with_echo_mode(cli.echo_mode)
                .with_response_size(cli.request_size)
                .with_pipeline_size(cli.pipeline_depth_mbytes.saturating_mul(1024 * 1024))
                .with_pipeline_count(cli.pipeline_depth_count)
                .with_ack_count(cli.ack_count),
        )
        .with_tcp_remotes(cli.tcp_remotes.clone())
        .with_test_duration(Duration::from_secs(cli.test_duration_s));

    let total_cores = affinity::num_online_cores();
    let active_cores = cli.tcp_remotes.len().min(total_cores);
    info!(total_cores, active_cores, "starting benchmark shards");

    install_sigint_handler();
    let stop = StopHandle::new();
    {
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.is_stopped() {
                if SIGINT_SEEN.load(Ordering::SeqCst) {
                    info!("interrupt received, stopping all shards");
                    stop.stop();
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });
    }

    let pin_cores = cli.pin_cores;
    let mut shards = Vec::with_capacity(total_cores);
    for shard_id in 0..total_cores {
        let config = config.clone();
        let stop = stop.clone();
        let had_remote = shard_id < cli.tcp_remotes.len();
        shards.push(
            thread::Builder::new()
                .name(format!("shard-{shard_id}"))
                .spawn(move || {
                    if pin_cores {
                        affinity::pin_shard(shard_id);
                    }
                    let mut client = Client::new(shard_id, total_cores, config, stop);
                    ShardOutcome { shard_id, had_remote, result: client.run() }
                })
                .expect("spawn shard thread"),
        );
    }

    let mut outcomes = Vec::with_capacity(total_cores);
    for (shard_id, shard) in shards.into_iter().enumerate() {
        match shard.join() {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => {
                error!(shard = shard_id, "shard thread panicked");
                outcomes.push(ShardOutcome {
                    shard_id,
                    had_remote: true,
                    result: Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "shard thread panicked",
                    ))),
                });
            }
        }
    }
    stop.stop();

    let mut acked_requests_per_sec = 0.0f64;
    let mut acked_gbit_per_sec = 0.0f64;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => {
                acked_requests_per_sec += report.requests_per_sec;
                acked_gbit_per_sec += report.gbit_per_sec;
            }
            Err(e) => {
                if outcome.had_remote {
                    warn!(shard = outcome.shard_id, error = %e, "shard failed");
                }
            }
        }
    }

    info!(
        "aggregate acked throughput: {acked_requests_per_sec:.0} requests per sec, \
         {acked_gbit_per_sec:.3} GBit per sec"
    );

    exit_code(&outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pipebench::Report;

    #[test]
    fn test_flag_defaults() {
        let cli = Cli::parse_from(["pipebench"]);
        assert_eq!(cli.request_size, 512);
        assert_eq!(cli.ack_count, 5);
        assert_eq!(cli.pipeline_depth_mbytes, 200);
        assert_eq!(cli.pipeline_depth_count, 10);
        assert!(!cli.echo_mode);
        assert!(cli.tcp_remotes.is_empty());
        assert_eq!(cli.test_duration_s, 30);
        assert!(!cli.pin_cores);
    }

    #[test]
    fn test_tcp_remotes_space_delimited() {
        let cli = Cli::parse_from([
            "pipebench",
            "--tcp-remotes",
            "tcp://192.168.1.2:12345 tcp://192.168.1.3:12345",
        ]);
        assert_eq!(
            cli.tcp_remotes,
            vec!["tcp://192.168.1.2:12345", "tcp://192.168.1.3:12345"]
        );
    }

    fn empty_report(shard_id: usize) -> Report {
        Report {
            shard_id,
            session_id: 1,
            remote: None,
            total_size: 0,
            total_count: 0,
            unacked_size: 0,
            unacked_count: 0,
            actual_duration: Duration::ZERO,
            gbit_per_sec: 0.0,
            requests_per_sec: 0.0,
            steady_requests_per_sec: None,
            latency_p50_us: 0,
            latency_p90_us: 0,
            latency_p99_us: 0,
            latency_max_us: 0,
            latency_samples: 0,
        }
    }

    fn outcome(shard_id: usize, had_remote: bool, ok: bool) -> ShardOutcome {
        let result = if ok {
            Ok(empty_report(shard_id))
        } else {
            Err(Error::NoRemoteEndpoint(shard_id))
        };
        ShardOutcome { shard_id, had_remote, result }
    }

    #[test]
    fn test_exit_code_counts_only_shards_with_remotes() {
        // Shards beyond the remote list fail their own startup but do not
        // make the run fail.
        let outcomes = vec![outcome(0, true, true), outcome(1, false, false)];
        assert_eq!(startup_failures(&outcomes), 0);

        let outcomes = vec![outcome(0, true, false), outcome(1, false, false)];
        assert_eq!(startup_failures(&outcomes), 1);
    }

    #[test]
    fn test_exit_code_all_assigned_shards_clean() {
        let outcomes = vec![
            outcome(0, true, true),
            outcome(1, true, true),
            outcome(2, false, false),
        ];
        assert_eq!(startup_failures(&outcomes), 0);
    }

    #[test]
    fn test_exit_code_empty_outcomes_is_clean() {
        assert_eq!(startup_failures(&[]), 0);
    }
}
