//! ackflow moves events from sources, through transforms, to sinks and tells each source, exactly
//! once per event, whether its events were delivered.
//!
//! The acknowledgement engine lives in [ack]. [sinker] turns the delivery confirmation of each
//! kind of sink into share resolutions, [transformer] carries obligations through transform
//! stages, and [topology] wires everything together from a [TopologyConfig] or by hand.

pub use crate::error::{Error, Result};

mod error;

/// End-to-end delivery acknowledgement: tokens, shares, fan-out and the per-source router.
pub mod ack;

/// Topology configuration.
pub mod config;

pub mod event;

mod metrics;
pub use metrics::encode_metrics;

/// Sinks and their acknowledgement adapters.
pub mod sinker;

/// Transform stages and their acknowledgement policies.
pub mod transformer;

pub mod topology;

pub use config::TopologyConfig;
pub use topology::{SourceHandle, Topology, TopologyBuilder};
