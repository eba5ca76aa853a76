use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::EventData;
use crate::sinker::{AckCapability, DeliveryError, Sink};

/// Bounded in-memory queue used as a stand-in for a durable buffer. A batch is persisted as a
/// whole or not at all: a full buffer is a retryable error, a buffer whose reader is gone is a
/// fatal one.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    tx: mpsc::Sender<EventData>,
}

/// Consumer side of a [MemoryBuffer], i.e. whatever drains the buffer downstream. What happens
/// after an event was read from here has no bearing on its acknowledgement.
#[derive(Debug)]
pub struct BufferReader {
    rx: mpsc::Receiver<EventData>,
}

impl MemoryBuffer {
    pub fn new(capacity: usize) -> (Self, BufferReader) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, BufferReader { rx })
    }
}

impl Sink for MemoryBuffer {
    fn capability(&self) -> AckCapability {
        AckCapability::BufferPersist
    }

    async fn write(&mut self, events: &[EventData]) -> Result<(), DeliveryError> {
        if events.is_empty() {
            return Ok(());
        }
        if events.len() > self.tx.max_capacity() {
            return Err(DeliveryError::fatal(format!(
                "batch of {} events can never fit a buffer of {}",
                events.len(),
                self.tx.max_capacity()
            )));
        }
        let permits = match self.tx.try_reserve_many(events.len()) {
            Ok(permits) => permits,
            Err(TrySendError::Full(())) => {
                return Err(DeliveryError::retryable(format!(
                    "buffer is full, {} slots free",
                    self.tx.capacity()
                )));
            }
            Err(TrySendError::Closed(())) => {
                return Err(DeliveryError::fatal("buffer reader is gone"));
            }
        };
        for (permit, event) in permits.zip(events) {
            permit.send(event.clone());
        }
        Ok(())
    }
}

impl BufferReader {
    pub async fn recv(&mut self) -> Option<EventData> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventData> {
        self.rx.try_recv().ok()
    }

    /// Events persisted and not read yet.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(n: usize) -> Vec<EventData> {
        (0..n).map(|i| EventData::new(format!("e{i}"))).collect()
    }

    #[tokio::test]
    async fn test_persist_and_read() {
        let (mut buffer, mut reader) = MemoryBuffer::new(3);
        assert_eq!(buffer.capability(), AckCapability::BufferPersist);
        buffer.write(&events(2)).await.unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.recv().await.unwrap().payload, "e0");
        assert_eq!(reader.try_recv().unwrap().payload, "e1");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_full_buffer_is_retryable() {
        let (mut buffer, mut reader) = MemoryBuffer::new(3);
        buffer.write(&events(2)).await.unwrap();

        // all or nothing
        let err = buffer.write(&events(2)).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(reader.len(), 2);

        reader.recv().await.unwrap();
        buffer.write(&events(2)).await.unwrap();
        assert_eq!(reader.len(), 3);
    }

    #[tokio::test]
    async fn test_closed_buffer_is_fatal() {
        let (mut buffer, reader) = MemoryBuffer::new(3);
        drop(reader);
        let err = buffer.write(&events(1)).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_fatal() {
        let (mut buffer, _reader) = MemoryBuffer::new(1);
        let err = buffer.write(&events(2)).await.unwrap_err();
        assert!(!err.retryable);
    }
}
