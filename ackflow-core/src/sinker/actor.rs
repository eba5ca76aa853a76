use std::time::Duration;

use tokio::pin;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::ack::{Obligation, ObligationShare, ShareBatch};
use crate::config::SinkOptions;
use crate::event::{ComponentKey, Event, EventData};
use crate::sinker::{Sink, SinkAckAdapter};

/// Drives one sink. Events are read from the input channel in batches of up to `batch_size`,
/// waiting at most `chunk_timeout` for a batch to fill, and every batch goes through the
/// [SinkAckAdapter] before the next one is read.
pub(crate) struct SinkActor<S> {
    name: ComponentKey,
    sink: S,
    adapter: SinkAckAdapter,
    batch_size: usize,
    chunk_timeout: Duration,
    cancel: CancellationToken,
}

impl<S> SinkActor<S>
where
    S: Sink,
{
    pub(crate) fn new(
        name: ComponentKey,
        sink: S,
        options: &SinkOptions,
        cancel: CancellationToken,
    ) -> Self {
        let adapter = SinkAckAdapter::new(sink.capability(), &options.retry);
        Self {
            name,
            sink,
            adapter,
            batch_size: options.batch_size.max(1),
            chunk_timeout: options.chunk_timeout,
            cancel,
        }
    }

    /// Runs until the input is closed. Each batch has all of its shares resolved before the next
    /// one is read, so once this returns nothing handed to the sink is left pending. Stops with
    /// [crate::Error::TokenAlreadyTerminal] when an event arrives with a root token that is
    /// already terminal; the shares of that batch fail as they are dropped.
    pub(crate) async fn run(mut self, input: mpsc::Receiver<Event>) -> Result<()> {
        info!(sink = %self.name, capability = ?self.adapter.capability(), batch_size = self.batch_size, chunk_timeout = ?self.chunk_timeout, "Starting sink");

        let chunk_stream =
            ReceiverStream::new(input).chunks_timeout(self.batch_size, self.chunk_timeout);
        pin!(chunk_stream);

        while let Some(batch) = chunk_stream.next().await {
            if batch.is_empty() {
                continue;
            }

            let (events, shares) = self.split_batch(batch)?;
            let outcome = self
                .adapter
                .deliver(&self.name, &mut self.sink, &events, &shares, &self.cancel)
                .await;
            debug!(sink = %self.name, count = events.len(), ?outcome, "Batch delivered");
        }

        info!(sink = %self.name, "Sink input closed, stopping");
        Ok(())
    }

    fn split_batch(&self, batch: Vec<Event>) -> Result<(Vec<EventData>, ShareBatch)> {
        let shares = ShareBatch::default();
        let mut events = Vec::with_capacity(batch.len());
        for event in batch {
            let (data, _source, obligation) = event.into_parts();
            if let Some(share) = self.take_share(obligation)? {
                shares.push(share);
            }
            events.push(data);
        }
        Ok((events, shares))
    }

    /// The share this sink has to resolve for an event, if any.
    fn take_share(&self, obligation: Obligation) -> Result<Option<ObligationShare>> {
        match obligation {
            Obligation::Untracked => Ok(None),
            Obligation::Share(share) => Ok(Some(share)),
            // a root token only reaches a sink when nothing fanned it out, take the one share
            Obligation::Root(token) => {
                let share = token.add_share(self.name.clone()).inspect_err(|e| {
                    error!(sink = %self.name, ?e, "Event reached the sink with a terminal token");
                })?;
                Ok(Some(share))
            }
        }
    }
}
