//! Configuration types for the benchmark client.

use std::time::Duration;

use crate::error::{Error, Result};

/// Encoded size of [`SessionConfig`] on the wire.
pub const SESSION_CONFIG_SIZE: usize = 20;

/// Session configuration, negotiated with the server at session start.
///
/// Immutable after construction. The same record is sent verbatim as the
/// `START_SESSION` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// If true, the server echoes request payloads in its acks.
    pub echo_mode: bool,
    /// Bytes per request, including the 16-byte request header.
    pub response_size: u32,
    /// Maximum bytes of un-acked data (byte credit).
    pub pipeline_size: u32,
    /// Maximum number of un-acked requests (count credit).
    pub pipeline_count: u32,
    /// Server-side batching hint: acks coalesce this many requests.
    pub ack_count: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            echo_mode: false,
            response_size: 512,
            pipeline_size: 200 * 1024 * 1024,
            pipeline_count: 10,
            ack_count: 5,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set echo mode.
    pub fn with_echo_mode(mut self, echo_mode: bool) -> Self {
        self.echo_mode = echo_mode;
        self
    }

    /// Set the request size in bytes.
    pub fn with_response_size(mut self, response_size: u32) -> Self {
        self.response_size = response_size;
        self
    }

    /// Set the pipeline byte credit.
    pub fn with_pipeline_size(mut self, pipeline_size: u32) -> Self {
        self.pipeline_size = pipeline_size;
        self
    }

    /// Set the pipeline request credit.
    pub fn with_pipeline_count(mut self, pipeline_count: u32) -> Self {
        self.pipeline_count = pipeline_count;
        self
    }

    /// Set the ack batching hint.
    pub fn with_ack_count(mut self, ack_count: u32) -> Self {
        self.ack_count = ack_count;
        self
    }

    /// Encode the record: `echo_mode u8`, 3 pad bytes, then four `u32`
    /// fields, little-endian.
    pub fn to_bytes(&self) -> [u8; SESSION_CONFIG_SIZE] {
        let mut buf = [0u8; SESSION_CONFIG_SIZE];
        buf[0] = self.echo_mode as u8;
        buf[4..8].copy_from_slice(&self.response_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pipeline_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pipeline_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.ack_count.to_le_bytes());
        buf
    }

    /// Decode a record previously produced by [`SessionConfig::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SESSION_CONFIG_SIZE {
            return Err(Error::MalformedRecord("session config"));
        }
        let u32_at = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        Ok(Self {
            echo_mode: bytes[0] != 0,
            response_size: u32_at(4),
            pipeline_size: u32_at(8),
            pipeline_count: u32_at(12),
            ack_count: u32_at(16),
        })
    }
}

/// Everything one shard needs to run a benchmark session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session parameters sent to the server.
    pub session: SessionConfig,
    /// Bootstrap endpoint URLs, one per shard; the shard id selects the entry.
    pub tcp_remotes: Vec<String>,
    /// How long to run the benchmark.
    pub test_duration: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            tcp_remotes: Vec::new(),
            test_duration: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session parameters.
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the per-shard bootstrap endpoint list.
    pub fn with_tcp_remotes(mut self, tcp_remotes: Vec<String>) -> Self {
        self.tcp_remotes = tcp_remotes;
        self
    }

    /// Set the benchmark duration.
    pub fn with_test_duration(mut self, test_duration: Duration) -> Self {
        self.test_duration = test_duration;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_roundtrip() {
        let config = SessionConfig::new()
            .with_echo_mode(true)
            .with_response_size(4096)
            .with_pipeline_size(64 * 1024 * 1024)
            .with_pipeline_count(32)
            .with_ack_count(8);

        let bytes = config.to_bytes();
        assert_eq!(bytes.len(), SESSION_CONFIG_SIZE);
        assert_eq!(SessionConfig::from_bytes(&bytes).unwrap(), config);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.response_size, 512);
        assert_eq!(config.pipeline_size, 200 * 1024 * 1024);
        assert_eq!(config.pipeline_count, 10);
        assert_eq!(config.ack_count, 5);
        assert!(!config.echo_mode);
    }

    #[test]
    fn test_session_config_short_buffer() {
        assert!(SessionConfig::from_bytes(&[0u8; 4]).is_err());
    }
}
