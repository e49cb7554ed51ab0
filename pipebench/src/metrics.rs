//! Prometheus binding for the per-session counters, gauges, and the
//! request-latency histogram.

use std::collections::HashMap;
use std::time::Duration;

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry,
    TextEncoder,
};

use crate::config::SessionConfig;
use crate::error::{Error, Result};

fn metrics_err(err: prometheus::Error) -> Error {
    Error::Metrics(err.to_string())
}

/// Session metrics, tagged with `total_cores` and `active_cores`.
///
/// A fresh binding is created on every session start so that a restart
/// clears the previous registration.
pub struct SessionMetrics {
    registry: Registry,
    ack_batch_size: IntGauge,
    session_id: IntGauge,
    total_count: IntCounter,
    total_bytes: IntCounter,
    pipeline_depth: IntGauge,
    pipeline_bytes: IntGauge,
    request_latency: Histogram,
}

impl SessionMetrics {
    /// Register the session metric family.
    pub fn new(total_cores: usize, active_cores: usize, config: &SessionConfig) -> Result<Self> {
        let labels = HashMap::from([
            ("total_cores".to_string(), total_cores.to_string()),
            ("active_cores".to_string(), active_cores.to_string()),
        ]);
        let registry = Registry::new_custom(Some("session".to_string()), Some(labels))
            .map_err(metrics_err)?;

        let ack_batch_size =
            IntGauge::new("ack_batch_size", "How many requests the server acks at once")
                .map_err(metrics_err)?;
        let session_id =
            IntGauge::new("session_id", "Server-assigned session id").map_err(metrics_err)?;
        let total_count =
            IntCounter::new("total_count", "Total number of requests").map_err(metrics_err)?;
        let total_bytes =
            IntCounter::new("total_bytes", "Total data bytes sent").map_err(metrics_err)?;
        let pipeline_depth =
            IntGauge::new("pipeline_depth", "Available pipeline depth").map_err(metrics_err)?;
        let pipeline_bytes =
            IntGauge::new("pipeline_bytes", "Available pipeline bytes").map_err(metrics_err)?;
        let request_latency = Histogram::with_opts(
            HistogramOpts::new("request_latency", "Latency of acked requests in seconds")
                .buckets(exponential_buckets(1e-6, 2.0, 24).map_err(metrics_err)?),
        )
        .map_err(metrics_err)?;

        registry.register(Box::new(ack_batch_size.clone())).map_err(metrics_err)?;
        registry.register(Box::new(session_id.clone())).map_err(metrics_err)?;
        registry.register(Box::new(total_count.clone())).map_err(metrics_err)?;
        registry.register(Box::new(total_bytes.clone())).map_err(metrics_err)?;
        registry.register(Box::new(pipeline_depth.clone())).map_err(metrics_err)?;
        registry.register(Box::new(pipeline_bytes.clone())).map_err(metrics_err)?;
        registry.register(Box::new(request_latency.clone())).map_err(metrics_err)?;

        ack_batch_size.set(config.ack_count as i64);
        pipeline_depth.set(config.pipeline_count as i64);
        pipeline_bytes.set(config.pipeline_size as i64);

        Ok(Self {
            registry,
            ack_batch_size,
            session_id,
            total_count,
            total_bytes,
            pipeline_depth,
            pipeline_bytes,
            request_latency,
        })
    }

    /// Record the session id assigned by the handshake.
    pub fn set_session_id(&self, session_id: u64) {
        self.session_id.set(session_id as i64);
    }

    /// The configured ack batching hint.
    pub fn ack_batch_size(&self) -> i64 {
        self.ack_batch_size.get()
    }

    /// Account for one issued request.
    pub fn record_send(&self, bytes: u64) {
        self.total_count.inc();
        self.total_bytes.inc_by(bytes);
    }

    /// Update the available-credit gauges.
    pub fn set_pipeline(&self, depth_available: u64, bytes_available: u64) {
        self.pipeline_depth.set(depth_available as i64);
        self.pipeline_bytes.set(bytes_available as i64);
    }

    /// Record one request latency sample.
    pub fn observe_latency(&self, latency: Duration) {
        self.request_latency.observe(latency.as_secs_f64());
    }

    /// Text-encode the registry for scraping or snapshotting.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut out = Vec::new();
        TextEncoder::new().encode(&families, &mut out).map_err(metrics_err)?;
        String::from_utf8(out).map_err(|e| Error::Metrics(e.to_string()))
    }
}
