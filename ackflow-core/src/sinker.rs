//! Sinks and the adapters that turn their delivery confirmation into share resolutions.
//!
//! A sink only knows how to write a batch of [EventData] somewhere and declares what its
//! destination can confirm ([AckCapability]). The [SinkAckAdapter] built from that capability
//! decides when the shares covering the batch are resolved, and how.

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::ack::{ShareBatch, ShareOutcome};
use crate::config::RetryConfig;
use crate::event::{ComponentKey, EventData};
use crate::sinker::backoff::Exponential;

mod actor;
mod backoff;

/// Blackhole sink, accepts everything and confirms it right away.
mod blackhole;

/// In-memory queue sink standing in for a durable buffer.
mod buffer;

/// Log sink prints out the events it receives.
mod log;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) use actor::SinkActor;
pub use blackhole::BlackholeSink;
pub use buffer::{BufferReader, MemoryBuffer};
pub use log::LogSink;

/// What a sink's destination can tell us about delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCapability {
    /// destination confirms each write (e.g. HTTP 2xx, broker ack).
    ProtocolAck,
    /// events are handed to a durable buffer, persisting them is all we wait for.
    BufferPersist,
    /// fire and forget.
    Unsupported,
}

/// Error returned by a sink write. It never leaves the adapter, it only decides whether the batch
/// is retried or its shares fail.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message} (retryable: {retryable})")]
pub struct DeliveryError {
    pub retryable: bool,
    pub message: String,
}

impl DeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Set of items to be implemented by a sink.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink {
    fn capability(&self) -> AckCapability;

    /// Writes the batch. `Ok` means the destination confirmed (or accepted, depending on the
    /// capability) every event of the batch.
    async fn write(&mut self, events: &[EventData]) -> Result<(), DeliveryError>;
}

/// Resolves the shares of each batch according to the sink's capability.
#[derive(Debug, Clone)]
pub enum SinkAckAdapter {
    ProtocolAck { retry: RetryConfig },
    BufferPersist { retry: RetryConfig },
    Unsupported,
}

impl SinkAckAdapter {
    pub fn new(capability: AckCapability, retry: &RetryConfig) -> Self {
        match capability {
            AckCapability::ProtocolAck => SinkAckAdapter::ProtocolAck {
                retry: retry.clone(),
            },
            AckCapability::BufferPersist => SinkAckAdapter::BufferPersist {
                retry: retry.clone(),
            },
            AckCapability::Unsupported => SinkAckAdapter::Unsupported,
        }
    }

    pub fn capability(&self) -> AckCapability {
        match self {
            SinkAckAdapter::ProtocolAck { .. } => AckCapability::ProtocolAck,
            SinkAckAdapter::BufferPersist { .. } => AckCapability::BufferPersist,
            SinkAckAdapter::Unsupported => AckCapability::Unsupported,
        }
    }

    /// Writes one batch and resolves its shares. Every share in `shares` is resolved by the time
    /// this returns. Returns the outcome the shares were resolved with.
    pub async fn deliver<S: Sink>(
        &self,
        sink_name: &ComponentKey,
        sink: &mut S,
        events: &[EventData],
        shares: &ShareBatch,
        cancel: &CancellationToken,
    ) -> ShareOutcome {
        let outcome = match self {
            SinkAckAdapter::Unsupported => {
                // nothing to wait for, the source is released before the write even starts
                shares.resolve(ShareOutcome::Acked);
                if let Err(e) = sink.write(events).await {
                    error!(sink = %sink_name, ?e, "Write to unacknowledged sink failed");
                }
                return ShareOutcome::Acked;
            }
            SinkAckAdapter::ProtocolAck { retry } => {
                match write_with_retry(sink_name, sink, events, retry, cancel).await {
                    Ok(()) => ShareOutcome::Acked,
                    Err(_) => ShareOutcome::Failed,
                }
            }
            SinkAckAdapter::BufferPersist { retry } => {
                match write_with_retry(sink_name, sink, events, retry, cancel).await {
                    Ok(()) => ShareOutcome::Dropped,
                    Err(_) => ShareOutcome::Failed,
                }
            }
        };
        shares.resolve(outcome);
        outcome
    }
}

/// Writes the batch until it succeeds, hits a non-retryable error, runs out of retries or is
/// cancelled.
async fn write_with_retry<S: Sink>(
    sink_name: &ComponentKey,
    sink: &mut S,
    events: &[EventData],
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), DeliveryError> {
    let mut backoff = Exponential::from(retry);
    loop {
        let err = match sink.write(events).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.retryable => {
                error!(sink = %sink_name, ?e, count = events.len(), "Non-retryable delivery error");
                return Err(e);
            }
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            warn!(sink = %sink_name, "Cancellation received, stopping retry loop");
            return Err(err);
        }

        let Some(delay) = backoff.next() else {
            error!(
                sink = %sink_name,
                retry_attempts = backoff.attempt(),
                ?err,
                count = events.len(),
                "Retries exhausted"
            );
            return Err(err);
        };
        warn!(sink = %sink_name, retry_attempt = backoff.attempt(), ?err, "Retrying due to retryable error.");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                warn!(sink = %sink_name, "Cancellation received while backing off");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ack::{AckToken, TokenState};
    use crate::sinker::test_utils::ScriptedSink;

    fn fast_retry(max_attempts: u16) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_interval_ms: 1,
            max_interval_ms: 5,
            ..Default::default()
        }
    }

    fn batch(token: &AckToken, sink: &str, n: usize) -> ShareBatch {
        let holders: Vec<_> = (0..n).map(|_| ComponentKey::from(sink)).collect();
        ShareBatch::new(token.add_shares(&holders).unwrap())
    }

    fn events(n: usize) -> Vec<EventData> {
        (0..n).map(|i| EventData::new(format!("event-{i}"))).collect()
    }

    #[tokio::test]
    async fn test_protocol_ack_retries_then_acks() {
        let name = ComponentKey::from("http");
        let mut sink = ScriptedSink::new(AckCapability::ProtocolAck).script(vec![
            Err(DeliveryError::retryable("503")),
            Err(DeliveryError::retryable("503")),
        ]);
        let adapter = SinkAckAdapter::new(AckCapability::ProtocolAck, &fast_retry(3));
        let (token, rx) = AckToken::new("in");
        let shares = batch(&token, "http", 2);

        let outcome = adapter
            .deliver(&name, &mut sink, &events(2), &shares, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ShareOutcome::Acked);
        assert_eq!(sink.attempts(), 3);
        assert!(shares.is_empty());
        assert_eq!(rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_protocol_ack_fatal_error_fails() {
        let name = ComponentKey::from("http");
        let mut sink = ScriptedSink::new(AckCapability::ProtocolAck)
            .script(vec![Err(DeliveryError::fatal("400"))]);
        let adapter = SinkAckAdapter::new(AckCapability::ProtocolAck, &fast_retry(3));
        let (token, rx) = AckToken::new("in");
        let shares = batch(&token, "http", 1);

        let outcome = adapter
            .deliver(&name, &mut sink, &events(1), &shares, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ShareOutcome::Failed);
        assert_eq!(sink.attempts(), 1);
        assert_eq!(rx.recv().await, TokenState::Failed);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let name = ComponentKey::from("http");
        let mut sink = ScriptedSink::new(AckCapability::ProtocolAck)
            .script(vec![Err(DeliveryError::retryable("timeout")); 10]);
        let adapter = SinkAckAdapter::new(AckCapability::ProtocolAck, &fast_retry(2));
        let (token, rx) = AckToken::new("in");
        let shares = batch(&token, "http", 1);

        let outcome = adapter
            .deliver(&name, &mut sink, &events(1), &shares, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ShareOutcome::Failed);
        // first attempt plus two retries
        assert_eq!(sink.attempts(), 3);
        assert_eq!(rx.recv().await, TokenState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_stops_retrying() {
        let name = ComponentKey::from("http");
        let mut sink = ScriptedSink::new(AckCapability::ProtocolAck)
            .script(vec![Err(DeliveryError::retryable("timeout")); 10]);
        let retry = RetryConfig {
            max_attempts: 10,
            initial_interval_ms: 10_000,
            max_interval_ms: 10_000,
            ..Default::default()
        };
        let adapter = SinkAckAdapter::new(AckCapability::ProtocolAck, &retry);
        let (token, rx) = AckToken::new("in");
        let shares = batch(&token, "http", 1);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            adapter.deliver(&name, &mut sink, &events(1), &shares, &cancel),
        )
        .await
        .expect("cancellation should cut the backoff short");

        assert_eq!(outcome, ShareOutcome::Failed);
        assert_eq!(rx.recv().await, TokenState::Failed);
    }

    #[tokio::test]
    async fn test_buffer_persist_resolves_dropped() {
        let name = ComponentKey::from("buffer");
        let (mut sink, mut reader) = MemoryBuffer::new(4);
        let adapter = SinkAckAdapter::new(AckCapability::BufferPersist, &fast_retry(1));
        let (token, rx) = AckToken::new("in");
        let shares = batch(&token, "buffer", 2);

        let outcome = adapter
            .deliver(&name, &mut sink, &events(2), &shares, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ShareOutcome::Dropped);
        // acknowledged while the events still sit in the buffer
        assert_eq!(rx.recv().await, TokenState::Resolved);
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.recv().await.unwrap().payload, "event-0");
    }

    #[tokio::test]
    async fn test_unsupported_acks_before_write() {
        let name = ComponentKey::from("console");
        let mut sink = ScriptedSink::new(AckCapability::Unsupported)
            .script(vec![Err(DeliveryError::fatal("stdout closed"))]);
        let adapter = SinkAckAdapter::new(AckCapability::Unsupported, &fast_retry(3));
        let (token, rx) = AckToken::new("in");
        let shares = batch(&token, "console", 1);

        let outcome = adapter
            .deliver(&name, &mut sink, &events(1), &shares, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ShareOutcome::Acked);
        assert_eq!(sink.attempts(), 1);
        assert_eq!(rx.recv().await, TokenState::Resolved);
    }
}
