use crate::event::EventData;
use crate::sinker::{AckCapability, DeliveryError, Sink};

/// Blackhole is a sink to emulate /dev/null whose destination confirms every write.
#[derive(Debug, Default)]
pub struct BlackholeSink;

impl Sink for BlackholeSink {
    fn capability(&self) -> AckCapability {
        AckCapability::ProtocolAck
    }

    async fn write(&mut self, _events: &[EventData]) -> Result<(), DeliveryError> {
        Ok(())
    }
}
