//! Topology configuration. Only the parts the acknowledgement engine needs are modelled: the
//! wiring between components, the global and per-sink acknowledgement switches, and per-sink
//! batching and retry settings.
//!
//! The configuration is JSON, either read from a file or passed base64 encoded through the
//! `ACKFLOW_TOPOLOGY` environment variable.

use std::env;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Result;
use crate::error::Error;

const ENV_TOPOLOGY: &str = "ACKFLOW_TOPOLOGY";

pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 500;
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 100;
const DEFAULT_MAX_RETRY_ATTEMPTS: u16 = 5;
const DEFAULT_INITIAL_RETRY_INTERVAL_MS: u32 = 100;
const DEFAULT_MAX_RETRY_INTERVAL_MS: u32 = 10_000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.0;
const DEFAULT_MEMORY_BUFFER_CAPACITY: usize = 10_000;
const DEFAULT_COALESCE_COUNT: usize = 10;

/// Global `acknowledgements` section, applies to every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct AcknowledgementsConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl AcknowledgementsConfig {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Per-sink `acknowledgements` section, overrides the global default when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct SinkAcknowledgements {
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Retry settings of a sink. Retries are bounded so a destination that is gone for good ends up
/// failing its shares instead of holding them forever.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub initial_interval_ms: u32,
    pub max_interval_ms: u32,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_interval_ms: DEFAULT_INITIAL_RETRY_INTERVAL_MS,
            max_interval_ms: DEFAULT_MAX_RETRY_INTERVAL_MS,
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

/// Runtime options of one sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkOptions {
    pub batch_size: usize,
    pub chunk_timeout: Duration,
    pub retry: RetryConfig,
    /// per-sink override of the global acknowledgement default
    pub acknowledgements: Option<bool>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_timeout: Duration::from_millis(DEFAULT_CHUNK_TIMEOUT_MS),
            retry: RetryConfig::default(),
            acknowledgements: None,
        }
    }
}

impl SinkOptions {
    pub fn acknowledgements(mut self, enabled: bool) -> Self {
        self.acknowledgements = Some(enabled);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn batching(mut self, batch_size: usize, chunk_timeout: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.chunk_timeout = chunk_timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformKind {
    Passthrough,
    SplitLines,
    Coalesce {
        #[serde(default = "default_coalesce_count")]
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformConfig {
    pub name: String,
    pub inputs: Vec<String>,
    #[serde(flatten)]
    pub kind: TransformKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkKind {
    Log,
    Blackhole,
    MemoryBuffer {
        #[serde(default = "default_memory_buffer_capacity")]
        capacity: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    pub inputs: Vec<String>,
    #[serde(flatten)]
    pub kind: SinkKind,
    #[serde(default)]
    pub acknowledgements: SinkAcknowledgements,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
}

impl SinkConfig {
    pub fn options(&self) -> SinkOptions {
        SinkOptions {
            batch_size: self.batch_size.max(1),
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
            retry: self.retry.clone(),
            acknowledgements: self.acknowledgements.enabled,
        }
    }
}

/// The whole topology as written by the user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub acknowledgements: AcknowledgementsConfig,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    pub sinks: Vec<SinkConfig>,
}

impl TopologyConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to base64 decode topology: {e:?}")))?;
        let raw = String::from_utf8(decoded)
            .map_err(|e| Error::Config(format!("Topology is not valid utf-8: {e:?}")))?;
        Self::from_json(&raw)
    }

    /// Loads the topology from the `ACKFLOW_TOPOLOGY` environment variable.
    pub fn from_env() -> Result<Self> {
        let encoded = env::var(ENV_TOPOLOGY)
            .map_err(|_| Error::Config(format!("{ENV_TOPOLOGY} is not set")))?;
        Self::from_base64(&encoded)
    }
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_chunk_timeout_ms() -> u64 {
    DEFAULT_CHUNK_TIMEOUT_MS
}

fn default_memory_buffer_capacity() -> usize {
    DEFAULT_MEMORY_BUFFER_CAPACITY
}

fn default_coalesce_count() -> usize {
    DEFAULT_COALESCE_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"{
        "acknowledgements": { "enabled": true },
        "sources": [{ "name": "in" }],
        "transforms": [
            { "name": "lines", "inputs": ["in"], "type": "split_lines" },
            { "name": "agg", "inputs": ["lines"], "type": "coalesce", "count": 3 }
        ],
        "sinks": [
            { "name": "out", "inputs": ["lines"], "type": "blackhole",
              "retry": { "max_attempts": 2 } },
            { "name": "buf", "inputs": ["agg"], "type": "memory_buffer",
              "acknowledgements": { "enabled": false }, "batch_size": 10 },
            { "name": "console", "inputs": ["in"], "type": "log" }
        ]
    }"#;

    #[test]
    fn test_parse_topology() {
        let config = TopologyConfig::from_json(TOPOLOGY).unwrap();
        assert!(config.acknowledgements.enabled);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(
            config.transforms[1].kind,
            TransformKind::Coalesce { count: 3 }
        );
        assert_eq!(config.transforms[0].kind, TransformKind::SplitLines);

        let out = &config.sinks[0];
        assert_eq!(out.kind, SinkKind::Blackhole);
        assert_eq!(out.retry.max_attempts, 2);
        assert_eq!(out.retry.factor, DEFAULT_RETRY_FACTOR);
        assert_eq!(out.options().acknowledgements, None);

        let buf = &config.sinks[1];
        assert_eq!(
            buf.kind,
            SinkKind::MemoryBuffer {
                capacity: DEFAULT_MEMORY_BUFFER_CAPACITY
            }
        );
        assert_eq!(buf.options().acknowledgements, Some(false));
        assert_eq!(buf.options().batch_size, 10);
    }

    #[test]
    fn test_parse_base64() {
        let encoded = BASE64_STANDARD.encode(TOPOLOGY);
        let config = TopologyConfig::from_base64(&encoded).unwrap();
        assert_eq!(config.sinks.len(), 3);
    }

    #[test]
    fn test_acknowledgements_default_off() {
        let config = TopologyConfig::from_json(
            r#"{ "sources": [{ "name": "in" }], "sinks": [{ "name": "out", "inputs": ["in"], "type": "log" }] }"#,
        )
        .unwrap();
        assert!(!config.acknowledgements.enabled);
        assert!(config.transforms.is_empty());
    }

    #[test]
    fn test_demo_topology() {
        let config =
            TopologyConfig::from_json(include_str!("../../demos/topology.json")).unwrap();
        assert_eq!(config.sinks.len(), 3);
        assert_eq!(config.sinks[1].kind, SinkKind::MemoryBuffer { capacity: 1000 });
        assert_eq!(config.sinks[2].options().acknowledgements, Some(false));
    }

    #[test]
    fn test_invalid_topology() {
        let err = TopologyConfig::from_json(r#"{ "sources": [] }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(TopologyConfig::from_base64("not base64 !!").is_err());
    }
}
