use crate::event::EventData;
use crate::sinker::{AckCapability, DeliveryError, Sink};

/// Prints every event. There is no destination to confirm anything, events are acknowledged as
/// soon as they reach this sink.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn capability(&self) -> AckCapability {
        AckCapability::Unsupported
    }

    async fn write(&mut self, events: &[EventData]) -> Result<(), DeliveryError> {
        for event in events {
            tracing::info!(
                "Payload - {} Keys - {} EventTime - {}",
                String::from_utf8_lossy(&event.payload),
                event.keys.join(","),
                event.event_time.timestamp_millis(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LogSink;
    use crate::event::EventData;
    use crate::sinker::{AckCapability, Sink};

    #[tokio::test]
    async fn test_log_sink() {
        let mut sink = LogSink;
        let events = vec![
            EventData::new("Hello, World!").with_keys(vec!["k1".to_string()]),
            EventData::new("Hello, again!"),
        ];
        assert_eq!(sink.capability(), AckCapability::Unsupported);
        assert!(sink.write(&events).await.is_ok());
    }
}
