//! End-to-end delivery acknowledgement. When an event enters the pipeline from a source that has
//! acknowledgements enabled on at least one path, the [AckRouter] creates an [AckToken] for it.
//! As the event is copied to several destinations, the [FanoutTracker] turns the token into one
//! [ObligationShare] per copy. Sinks resolve their shares once the destination confirmed delivery
//! (or a buffer persisted the event), and when the last share is gone the router reports the final
//! [TokenState] back to the source, exactly once.
//!
//! Nothing here persists. A token lives as long as the events that carry its shares.

mod config;
mod fanout;
mod router;
mod token;

pub(crate) use config::SourcePaths;
pub use config::{AckConfig, UnsupportedPair};
pub use fanout::FanoutTracker;
pub use router::{AckCallback, AckRouter};
pub use token::{
    AckReceiver, AckReport, AckToken, Obligation, ObligationShare, ShareBatch, ShareOutcome,
    TokenId, TokenState,
};
