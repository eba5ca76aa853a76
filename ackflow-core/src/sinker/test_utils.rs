use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::EventData;
use crate::sinker::{AckCapability, DeliveryError, Sink};

/// Sink whose writes follow a script. Each write pops the next scripted result, an exhausted
/// script means success. Clones share their state so a test can keep one to inspect.
#[derive(Clone)]
pub(crate) struct ScriptedSink {
    capability: AckCapability,
    delay: Duration,
    script: Arc<Mutex<VecDeque<Result<(), DeliveryError>>>>,
    written: Arc<Mutex<Vec<EventData>>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedSink {
    pub(crate) fn new(capability: AckCapability) -> Self {
        Self {
            capability,
            delay: Duration::ZERO,
            script: Arc::new(Mutex::new(VecDeque::new())),
            written: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn script(self, results: Vec<Result<(), DeliveryError>>) -> Self {
        self.script.lock().extend(results);
        self
    }

    /// Time every write takes before the destination answers.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn written(&self) -> Vec<EventData> {
        self.written.lock().clone()
    }
}

impl Sink for ScriptedSink {
    fn capability(&self) -> AckCapability {
        self.capability
    }

    async fn write(&mut self, events: &[EventData]) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = self.script.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.written.lock().extend_from_slice(events);
        }
        result
    }
}
