//! The per-shard benchmark client: discovery, session handshake, the
//! pipelined bench loop, and lifecycle.
//!
//! One `Client` runs per shard thread. All mutable state is shard-local;
//! the sender loop and the ACK observer cooperate through a shared session
//! object behind an `Rc<RefCell<…>>`. The only cross-thread object is the
//! [`StopHandle`] used to request a graceful stop from outside.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{ClientConfig, SESSION_CONFIG_SIZE};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::latency::{LatencyRecorder, LatencyRing};
use crate::metrics::SessionMetrics;
use crate::retry::ExponentialBackoff;
use crate::session::{BenchSession, SendWaiter};
use crate::throughput::ThroughputWindows;
use crate::timing::OneshotTimer;
use crate::transport::Transport;
use crate::wire::{self, Ack, RequestHeader, SessionAck, REQUEST_HEADER_SIZE};

/// Wall-clock length of one throughput window.
const WINDOW_INTERVAL: Duration = Duration::from_secs(1);

/// Windows trimmed from each end for the steady-state rate.
const WINDOW_TRIM: usize = 1;

/// Cross-thread handle requesting a cooperative stop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Create a handle with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Running,
    Stopped,
}

enum SendAction {
    Send,
    Suspended,
}

/// State shared between the sender loop and the ACK observer. Shard-local.
struct Shared {
    session: BenchSession,
    ring: LatencyRing,
    waiter: SendWaiter,
    stopped: bool,
    metrics: Option<SessionMetrics>,
    recorder: LatencyRecorder,
    windows: ThroughputWindows,
}

/// Final per-shard figures, also written to the log.
#[derive(Debug, Clone)]
pub struct Report {
    /// Shard that produced this report.
    pub shard_id: usize,
    /// Server-assigned session id; zero if the handshake never completed.
    pub session_id: u64,
    /// Resolved data endpoint URL.
    pub remote: Option<String>,
    /// Cumulative bytes issued.
    pub total_size: u64,
    /// Cumulative requests issued.
    pub total_count: u64,
    /// Bytes still in flight at stop.
    pub unacked_size: u64,
    /// Requests still in flight at stop.
    pub unacked_count: u64,
    /// Measured benchmark duration.
    pub actual_duration: Duration,
    /// Acked bandwidth, gigabits per second.
    pub gbit_per_sec: f64,
    /// Acked request rate.
    pub requests_per_sec: f64,
    /// Trimmed steady-state request rate, when enough windows closed.
    pub steady_requests_per_sec: Option<f64>,
    /// Latency quantiles in microseconds, from the ack-time samples.
    pub latency_p50_us: u64,
    /// p90 latency in microseconds.
    pub latency_p90_us: u64,
    /// p99 latency in microseconds.
    pub latency_p99_us: u64,
    /// Largest latency sample in microseconds.
    pub latency_max_us: u64,
    /// Number of latency samples.
    pub latency_samples: u64,
}

/// A pipelined benchmark client bound to one shard.
pub struct Client {
    shard_id: usize,
    total_cores: usize,
    config: ClientConfig,
    transport: Rc<Transport>,
    shared: Rc<RefCell<Shared>>,
    scratch: Vec<u8>,
    stop: StopHandle,
    timer: OneshotTimer,
    state: Lifecycle,
    actual_duration: Duration,
}

impl Client {
    /// Create a client for `shard_id` of `total_cores`.
    pub fn new(shard_id: usize, total_cores: usize, config: ClientConfig, stop: StopHandle) -> Self {
        let session = config.session;
        let scratch = vec![0u8; session.response_size as usize];
        let shared = Shared {
            session: BenchSession::new(session),
            ring: LatencyRing::new(session.pipeline_count.max(1)),
            waiter: SendWaiter::new(),
            stopped: false,
            metrics: None,
            recorder: LatencyRecorder::new(),
            windows: ThroughputWindows::new(WINDOW_INTERVAL),
        };
        Self {
            shard_id,
            total_cores,
            config,
            transport: Rc::new(Transport::new()),
            shared: Rc::new(RefCell::new(shared)),
            scratch,
            stop,
            timer: OneshotTimer::new(),
            state: Lifecycle::Uninitialized,
            actual_duration: Duration::ZERO,
        }
    }

    /// The resolved data endpoint URL, once discovery has run.
    pub fn remote_url(&self) -> Option<String> {
        self.shared
            .borrow()
            .session
            .client
            .as_ref()
            .map(|ep| ep.url().to_string())
    }

    /// The server-assigned session id; zero before the handshake.
    pub fn session_id(&self) -> u64 {
        self.shared.borrow().session.session_id
    }

    /// Run the full benchmark: discovery, handshake, bench loop, report.
    ///
    /// Startup failures are returned after the (empty) report is logged; a
    /// stop requested at any point yields a clean `Ok`.
    pub fn run(&mut self) -> Result<Report> {
        self.state = Lifecycle::Running;
        info!(shard = self.shard_id, "starting benchmark client");

        let outcome = self.start();
        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => {
                debug!(shard = self.shard_id, "stopped during startup");
                Ok(())
            }
            Err(e) => {
                warn!(shard = self.shard_id, error = %e, "unable to execute benchmark");
                Err(e)
            }
        };

        info!(shard = self.shard_id, "done with benchmark");
        let report = self.build_report();
        self.log_report(&report);
        self.graceful_stop();
        outcome.map(|_| report)
    }

    fn start(&mut self) -> Result<()> {
        self.discovery()?;
        if self.is_stopping() {
            return Ok(());
        }
        info!(shard = self.shard_id, "setup complete, starting session");
        self.start_session()?;
        if self.is_stopping() {
            return Ok(());
        }
        self.benchmark()
    }

    fn is_stopping(&self) -> bool {
        self.stop.is_stopped() || self.shared.borrow().stopped
    }

    /// Resolve the data endpoint from this shard's bootstrap endpoint.
    pub fn discovery(&mut self) -> Result<()> {
        let shard = self.shard_id;
        info!(shard, "performing service discovery");
        let url = self.config.tcp_remotes.get(shard).cloned().ok_or_else(|| {
            warn!(shard, "no remote endpoint defined for this shard");
            Error::NoRemoteEndpoint(shard)
        })?;
        let bootstrap = self.transport.endpoint(&url)?;

        let transport = Rc::clone(&self.transport);
        let stop = self.stop.clone();
        let mut retry = ExponentialBackoff::new()
            .with_retries(10)
            .with_start_timeout(Duration::from_millis(10))
            .with_rate(3);
        let data_url = retry.run(|_remaining, timeout| {
            if stop.is_stopped() {
                info!(shard, "stopping retry since we were stopped");
                return Err(Error::Cancelled);
            }
            let response = transport.send_request(
                wire::GET_DATA_URL,
                transport.new_payload(0),
                &bootstrap,
                timeout,
            )?;
            if response.is_empty() {
                warn!(shard, "remote end did not provide a data endpoint");
                return Err(Error::EmptyResponse);
            }
            String::from_utf8(response.into_bytes()).map_err(|_| Error::MalformedRecord("data url"))
        })?;

        info!(shard, url = data_url.as_str(), "found remote data endpoint");
        let client = self.transport.endpoint(&data_url)?;
        self.shared.borrow_mut().session.client = Some(client);
        Ok(())
    }

    /// Send the session configuration and record the assigned session id.
    pub fn start_session(&mut self) -> Result<()> {
        let shard = self.shard_id;
        let active_cores = self.config.tcp_remotes.len().min(self.total_cores);
        let client = {
            let sh = &mut *self.shared.borrow_mut();
            sh.ring = LatencyRing::new(sh.session.config.pipeline_count.max(1));
            sh.session.last_acked_total = 0;
            sh.recorder.clear();
            sh.metrics = Some(SessionMetrics::new(
                self.total_cores,
                active_cores,
                &sh.session.config,
            )?);
            sh.session.client.clone().ok_or(Error::NoRemoteSession)?
        };

        let mut payload = self.transport.new_payload(SESSION_CONFIG_SIZE);
        payload.put(&self.config.session.to_bytes());
        let response = self.transport.send_request(
            wire::START_SESSION,
            payload,
            &client,
            Duration::from_secs(1),
        )?;
        if self.is_stopping() {
            return Ok(());
        }
        if response.is_empty() {
            warn!(shard, "remote end did not start a session");
            return Err(Error::NoRemoteSession);
        }
        let ack = SessionAck::from_bytes(response.bytes())?;

        let sh = &mut *self.shared.borrow_mut();
        sh.session.session_id = ack.session_id;
        if let Some(metrics) = &sh.metrics {
            metrics.set_session_id(ack.session_id);
        }
        info!(shard, session_id = ack.session_id, "starting session");
        Ok(())
    }

    /// Drive the pipelined send/ack loop until the timer fires or a stop is
    /// requested.
    pub fn benchmark(&mut self) -> Result<()> {
        let shard = self.shard_id;
        let remote = self
            .shared
            .borrow()
            .session
            .client
            .clone()
            .ok_or(Error::NoRemoteSession)?;
        info!(shard, remote = remote.url(), "starting benchmark loop");

        let shared = Rc::clone(&self.shared);
        self.transport.register_observer(
            wire::ACK,
            Some(Box::new(move |payload| {
                let now = Instant::now();
                let ack = match Ack::from_bytes(payload.bytes()) {
                    Ok(ack) => ack,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable ack");
                        return;
                    }
                };
                let sh = &mut *shared.borrow_mut();
                let Shared { session, ring, waiter, metrics, recorder, windows, .. } = sh;

                let prev_acked_count = session.total_count - session.unacked_count;
                let prev_acked_size = session.total_size - session.unacked_size;
                let applied = session.apply_ack(&ack, now, ring, |latency| {
                    recorder.record(latency);
                    if let Some(metrics) = metrics.as_ref() {
                        metrics.observe_latency(latency);
                    }
                });
                if !applied {
                    return;
                }

                if let Some(metrics) = metrics.as_ref() {
                    metrics.set_pipeline(
                        (session.config.pipeline_count as u64).saturating_sub(session.unacked_count),
                        (session.config.pipeline_size as u64).saturating_sub(session.unacked_size),
                    );
                }
                let newly_acked = ack.total_count.saturating_sub(prev_acked_count);
                let newly_acked_bytes = ack.total_size.saturating_sub(prev_acked_size);
                if newly_acked > 0 {
                    if let Some(window) = windows.record(newly_acked, newly_acked_bytes) {
                        debug!(
                            window = window.index,
                            requests = window.requests,
                            rate = window.rate(),
                            "throughput window closed"
                        );
                    }
                }
                if waiter.is_pending() {
                    waiter.fulfil();
                }
            })),
        );
        self.transport.register_low_memory_observer(Some(Box::new(move |requested| {
            warn!(shard, requested, "transport reports memory pressure");
        })));

        self.shared.borrow_mut().windows = ThroughputWindows::new(WINDOW_INTERVAL);
        self.timer.arm(self.config.test_duration);

        let started = Instant::now();
        let result = self.bench_loop(&remote);
        self.actual_duration = started.elapsed();
        self.shared.borrow_mut().windows.finish();
        self.timer.cancel();
        result
    }

    fn bench_loop(&mut self, remote: &Endpoint) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                self.enter_stopped();
            }
            if self.timer.fire() {
                debug!(shard = self.shard_id, "test duration elapsed");
                self.enter_stopped();
            }

            if self.shared.borrow().stopped {
                break;
            }

            // Drain inbound acks before deciding whether to send.
            self.transport.poll()?;

            let action = {
                let sh = &mut *self.shared.borrow_mut();
                if sh.stopped {
                    break;
                }
                if sh.waiter.is_pending() {
                    SendAction::Suspended
                } else if sh.session.can_send() {
                    SendAction::Send
                } else {
                    sh.waiter.install();
                    SendAction::Suspended
                }
            };
            match action {
                SendAction::Send => self.send_one(remote)?,
                SendAction::Suspended => std::hint::spin_loop(),
            }
        }
        Ok(())
    }

    /// Issue one request: header, zero padding, fire-and-forget send.
    fn send_one(&mut self, remote: &Endpoint) -> Result<()> {
        let response_size = self.config.session.response_size as usize;
        let padding = REQUEST_HEADER_SIZE;
        assert!(
            padding < response_size,
            "request size {response_size} does not fit the {padding}-byte header"
        );

        let mut payload = self.transport.new_payload(response_size);
        {
            let sh = &mut *self.shared.borrow_mut();
            let req_num = sh.session.note_send();
            let hdr = RequestHeader { session_id: sh.session.session_id, total_count: req_num };
            payload.put(&hdr.to_bytes());
            payload.put(&self.scratch[..response_size - padding]);
            sh.ring.stamp(req_num, Instant::now());
            if let Some(metrics) = &sh.metrics {
                metrics.record_send(response_size as u64);
                metrics.set_pipeline(
                    (sh.session.config.pipeline_count as u64)
                        .saturating_sub(sh.session.unacked_count),
                    (sh.session.config.pipeline_size as u64)
                        .saturating_sub(sh.session.unacked_size),
                );
            }
        }
        self.transport.send(wire::REQUEST, payload, remote)
    }

    fn enter_stopped(&self) {
        let sh = &mut *self.shared.borrow_mut();
        if !sh.stopped {
            sh.stopped = true;
            if sh.waiter.is_pending() {
                sh.waiter.fulfil();
            }
        }
    }

    /// Idempotent stop: tears down observers, flips the stop flag, and
    /// wakes a suspended sender.
    pub fn graceful_stop(&mut self) {
        if self.state == Lifecycle::Stopped {
            return;
        }
        info!(shard = self.shard_id, "stop");
        self.enter_stopped();
        self.transport.register_observer(wire::ACK, None);
        self.transport.register_low_memory_observer(None);
        self.state = Lifecycle::Stopped;
    }

    fn build_report(&self) -> Report {
        let sh = self.shared.borrow();
        let secs = self.actual_duration.as_secs_f64();
        let acked_bytes = sh.session.total_size - sh.session.unacked_size;
        let acked_count = sh.session.total_count - sh.session.unacked_count;
        let gib = (1024u64 * 1024 * 1024) as f64;
        let (gbit_per_sec, requests_per_sec) = if secs > 0.0 {
            ((acked_bytes as f64 / gib) / secs * 8.0, acked_count as f64 / secs)
        } else {
            (0.0, 0.0)
        };
        Report {
            shard_id: self.shard_id,
            session_id: sh.session.session_id,
            remote: sh.session.client.as_ref().map(|ep| ep.url().to_string()),
            total_size: sh.session.total_size,
            total_count: sh.session.total_count,
            unacked_size: sh.session.unacked_size,
            unacked_count: sh.session.unacked_count,
            actual_duration: self.actual_duration,
            gbit_per_sec,
            requests_per_sec,
            steady_requests_per_sec: sh.windows.steady_rate(WINDOW_TRIM),
            latency_p50_us: sh.recorder.quantile_us(0.50),
            latency_p90_us: sh.recorder.quantile_us(0.90),
            latency_p99_us: sh.recorder.quantile_us(0.99),
            latency_max_us: sh.recorder.max_us(),
            latency_samples: sh.recorder.count(),
        }
    }

    fn log_report(&self, report: &Report) {
        let shard = self.shard_id;
        info!(shard, "session_id={}", report.session_id);
        info!(shard, "remote={}", report.remote.as_deref().unwrap_or("-"));
        info!(
            shard,
            "total_size={} ({:.3} GBit per sec)", report.total_size, report.gbit_per_sec
        );
        info!(
            shard,
            "total_count={} ({:.0} per sec)", report.total_count, report.requests_per_sec
        );
        info!(shard, "unacked_size={}", report.unacked_size);
        info!(shard, "unacked_count={}", report.unacked_count);
        info!(shard, "test_duration={}ms", report.actual_duration.as_millis());
        if report.latency_samples > 0 {
            info!(
                shard,
                "latency_us p50={} p90={} p99={} max={} samples={}",
                report.latency_p50_us,
                report.latency_p90_us,
                report.latency_p99_us,
                report.latency_max_us,
                report.latency_samples
            );
        }
        if let Some(steady) = report.steady_requests_per_sec {
            info!(shard, "steady_state_rate={:.0} per sec", steady);
        }
    }
}
