//! Acknowledgement metrics, kept in a process wide [prometheus_client] registry.

use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::ack::ShareOutcome;
use crate::error::{Error, Result};
use crate::event::ComponentKey;

const REGISTRY_GLOBAL_PREFIX: &str = "ackflow";

const SOURCE_LABEL: &str = "source";
const HOLDER_LABEL: &str = "holder";
const OUTCOME_LABEL: &str = "outcome";

// counters (the `_total` suffix is added by the client library)
const TOKENS_CREATED: &str = "tokens_created";
const TOKENS_RESOLVED: &str = "tokens_resolved";
const TOKENS_FAILED: &str = "tokens_failed";
const SHARES_RESOLVED: &str = "shares_resolved";

// gauge
const TOKENS_IN_FLIGHT: &str = "tokens_in_flight";

// timer
const TOKEN_RESOLUTION_TIME: &str = "token_resolution_time";

/// The global register of all metrics.
struct GlobalRegistry {
    // It is okay to use a blocking mutex because each metric registers only one time.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

pub(crate) type Labels = Vec<(String, String)>;

/// Metrics of the acknowledgement engine, labelled by source (tokens) or by holder and outcome
/// (shares).
pub(crate) struct AckMetrics {
    pub(crate) tokens_created: Family<Labels, Counter>,
    pub(crate) tokens_resolved: Family<Labels, Counter>,
    pub(crate) tokens_failed: Family<Labels, Counter>,
    pub(crate) shares_resolved: Family<Labels, Counter>,
    pub(crate) tokens_in_flight: Family<Labels, Gauge>,
    pub(crate) resolution_time: Family<Labels, Histogram>,
}

/// Exponential bucket distribution with range, the final +Inf bucket is implicit.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let length = length.max(2);
    let min = if min > 0.0 { min } else { 1.0 };
    let growth_factor = (max / min).powf(1.0 / (length as f64 - 1.0));

    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}

impl AckMetrics {
    fn new() -> Self {
        let metrics = Self {
            tokens_created: Family::<Labels, Counter>::default(),
            tokens_resolved: Family::<Labels, Counter>::default(),
            tokens_failed: Family::<Labels, Counter>::default(),
            shares_resolved: Family::<Labels, Counter>::default(),
            tokens_in_flight: Family::<Labels, Gauge>::default(),
            // 100 microseconds to 15 minutes
            resolution_time: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60000000.0 * 15.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            TOKENS_CREATED,
            "A Counter to keep track of the tokens created for events entering the pipeline",
            metrics.tokens_created.clone(),
        );
        registry.register(
            TOKENS_RESOLVED,
            "A Counter to keep track of the tokens acknowledged back to their source",
            metrics.tokens_resolved.clone(),
        );
        registry.register(
            TOKENS_FAILED,
            "A Counter to keep track of the tokens reported as not delivered to their source",
            metrics.tokens_failed.clone(),
        );
        registry.register(
            SHARES_RESOLVED,
            "A Counter to keep track of the obligation shares resolved, by holder and outcome",
            metrics.shares_resolved.clone(),
        );
        registry.register(
            TOKENS_IN_FLIGHT,
            "A Gauge to keep track of the tokens waiting for their shares to resolve",
            metrics.tokens_in_flight.clone(),
        );
        registry.register(
            TOKEN_RESOLUTION_TIME,
            "A Histogram to keep track of the time (in microseconds) from token creation to its terminal state",
            metrics.resolution_time.clone(),
        );
        metrics
    }
}

static ACK_METRICS: OnceLock<AckMetrics> = OnceLock::new();

pub(crate) fn ack_metrics() -> &'static AckMetrics {
    ACK_METRICS.get_or_init(AckMetrics::new)
}

pub(crate) fn source_labels(source: &ComponentKey) -> Labels {
    vec![(SOURCE_LABEL.to_string(), source.to_string())]
}

pub(crate) fn share_labels(holder: &ComponentKey, outcome: ShareOutcome) -> Labels {
    vec![
        (HOLDER_LABEL.to_string(), holder.to_string()),
        (OUTCOME_LABEL.to_string(), outcome.as_str().to_string()),
    ]
}

/// Renders every registered metric in the Prometheus text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the families exist even if nothing was recorded yet
    ack_metrics();
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_ack_families() {
        let source = ComponentKey::from("metrics-test");
        ack_metrics()
            .tokens_created
            .get_or_create(&source_labels(&source))
            .inc();

        let encoded = encode_metrics().unwrap();
        assert!(encoded.contains("ackflow_tokens_created_total"));
        assert!(encoded.contains("source=\"metrics-test\""));
        assert!(encoded.contains("ackflow_token_resolution_time"));
    }

    #[test]
    fn test_buckets_are_increasing() {
        let buckets: Vec<f64> = exponential_buckets_range(100.0, 1000.0, 4).collect();
        assert_eq!(buckets.len(), 4);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }
}
