//! Event is the unit that flows from a source, through the transforms, to the sinks. The payload
//! part ([EventData]) is what transforms and sinks see, while the [Obligation] part stays with the
//! pipeline and is what the sinks eventually resolve so the source can be acknowledged.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::ack::{AckToken, Obligation};

/// Name of a source, transform or sink in the topology.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey(Arc<str>);

impl ComponentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for ComponentKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&String> for ComponentKey {
    fn from(value: &String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

/// The observable part of an event.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    /// keys of the event
    pub keys: Arc<[String]>,
    /// actual payload of the event
    pub payload: Bytes,
    /// event time of the event
    pub event_time: DateTime<Utc>,
}

impl EventData {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            keys: Arc::from([]),
            payload: payload.into(),
            event_time: Utc::now(),
        }
    }

    pub fn with_keys(mut self, keys: impl Into<Arc<[String]>>) -> Self {
        self.keys = keys.into();
        self
    }
}

impl Default for EventData {
    fn default() -> Self {
        Self::new(Bytes::new())
    }
}

/// An [EventData] moving through the pipeline together with the delivery obligation it carries.
#[derive(Debug)]
pub struct Event {
    pub data: EventData,
    /// source the event (or the event it was derived from) was read from.
    pub source: ComponentKey,
    pub obligation: Obligation,
}

impl Event {
    pub fn new(data: EventData, source: ComponentKey, obligation: Obligation) -> Self {
        Self {
            data,
            source,
            obligation,
        }
    }

    /// Event whose delivery nobody waits for.
    pub fn untracked(data: EventData, source: ComponentKey) -> Self {
        Self::new(data, source, Obligation::Untracked)
    }

    /// Event entering the pipeline with a freshly created token.
    pub fn with_token(data: EventData, source: ComponentKey, token: AckToken) -> Self {
        Self::new(data, source, Obligation::from(token))
    }

    pub fn into_parts(self) -> (EventData, ComponentKey, Obligation) {
        (self.data, self.source, self.obligation)
    }
}
