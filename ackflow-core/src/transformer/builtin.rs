use bytes::{BufMut, BytesMut};

use crate::Result;
use crate::event::EventData;
use crate::transformer::{Transform, TransformPolicy};

/// Forwards every event as is.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn policy(&self) -> TransformPolicy {
        TransformPolicy::Identity
    }

    async fn transform(&mut self, event: EventData) -> Result<Vec<EventData>> {
        Ok(vec![event])
    }

    async fn flush(&mut self) -> Result<Vec<EventData>> {
        Ok(Vec::new())
    }
}

/// Splits the payload on `\n`, one event per non-empty line. Keys and event time are kept.
#[derive(Debug, Default)]
pub struct LineSplitter;

impl Transform for LineSplitter {
    fn policy(&self) -> TransformPolicy {
        TransformPolicy::Fanning
    }

    async fn transform(&mut self, event: EventData) -> Result<Vec<EventData>> {
        let mut outputs = Vec::new();
        let mut start = 0;
        let payload = &event.payload;
        for end in payload
            .iter()
            .enumerate()
            .filter_map(|(i, b)| (*b == b'\n').then_some(i))
            .chain(std::iter::once(payload.len()))
        {
            if end > start {
                outputs.push(EventData {
                    payload: payload.slice(start..end),
                    ..event.clone()
                });
            }
            start = end + 1;
        }
        Ok(outputs)
    }

    async fn flush(&mut self) -> Result<Vec<EventData>> {
        Ok(Vec::new())
    }
}

/// Merges every `count` events into one, payloads joined by `\n`. The merged event has the keys
/// and the event time of the last event of the group. Whatever is left is emitted on flush.
#[derive(Debug)]
pub struct Coalesce {
    count: usize,
    pending: Vec<EventData>,
}

impl Coalesce {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            count,
            pending: Vec::with_capacity(count),
        }
    }

    fn merge(&mut self) -> Option<EventData> {
        let last = self.pending.last()?.clone();
        let size = self.pending.iter().map(|e| e.payload.len() + 1).sum();
        let mut payload = BytesMut::with_capacity(size);
        for (i, event) in self.pending.drain(..).enumerate() {
            if i > 0 {
                payload.put_u8(b'\n');
            }
            payload.put_slice(&event.payload);
        }
        Some(EventData {
            payload: payload.freeze(),
            ..last
        })
    }
}

impl Transform for Coalesce {
    fn policy(&self) -> TransformPolicy {
        TransformPolicy::Lossy
    }

    async fn transform(&mut self, event: EventData) -> Result<Vec<EventData>> {
        self.pending.push(event);
        if self.pending.len() < self.count {
            return Ok(Vec::new());
        }
        Ok(self.merge().into_iter().collect())
    }

    async fn flush(&mut self) -> Result<Vec<EventData>> {
        Ok(self.merge().into_iter().collect())
    }
}
