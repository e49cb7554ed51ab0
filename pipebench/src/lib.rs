//! # pipebench — pipelined RPC throughput benchmark client
//!
//! Measures sustainable request rate, bandwidth, and end-to-end latency
//! against a remote ack server by keeping a configurable window of
//! requests in flight per shard and consuming batched acknowledgements.
//!
//! ## Architecture
//!
//! Each CPU shard runs an independent client on its own thread; no state
//! is shared across shards. A shard's life is a straight line:
//!
//! 1. **Discovery** — resolve the data endpoint from the shard's bootstrap
//!    endpoint under a bounded-retry backoff driver.
//! 2. **Handshake** — send the session configuration, receive a session id.
//! 3. **Bench loop** — issue requests while the dual credit budget (bytes
//!    and count) has headroom, suspend on a one-shot awakener when it does
//!    not, and resume as batched acks restore credit.
//! 4. **Report** — log totals, rates, and latency quantiles.
//!
//! The crate is organized as follows:
//!
//! - [`config`]: session and client configuration
//! - [`wire`]: frame header, verbs, and fixed-layout records
//! - [`endpoint`]: URL-addressed remote endpoints
//! - [`transport`]: shard-local polled TCP message transport
//! - [`retry`]: single-use bounded-retry backoff driver
//! - [`session`]: credit accounting and ack validation
//! - [`latency`]: issue-time ring and quantile recorder
//! - [`metrics`]: prometheus binding for the session metrics
//! - [`throughput`]: windowed steady-state rate tracking
//! - [`timing`]: one-shot benchmark timer
//! - [`client`]: the per-shard benchmark client

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod latency;
pub mod metrics;
pub mod retry;
pub mod session;
pub mod throughput;
pub mod timing;
pub mod transport;
pub mod wire;

// Re-export main types
pub use client::{Client, Report, StopHandle};
pub use config::{ClientConfig, SessionConfig};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use latency::{LatencyRecorder, LatencyRing};
pub use metrics::SessionMetrics;
pub use retry::ExponentialBackoff;
pub use session::{BenchSession, SendWaiter};
pub use throughput::ThroughputWindows;
pub use transport::{Payload, Transport};
