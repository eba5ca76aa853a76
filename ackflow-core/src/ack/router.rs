use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::debug;

use crate::ack::{AckConfig, AckReceiver, AckReport, AckToken, TokenId, TokenState};
use crate::error::{Error, Result};
use crate::event::ComponentKey;
use crate::metrics::{ack_metrics, source_labels};

/// Invoked once per token of a source when the token turns terminal.
pub type AckCallback = Arc<dyn Fn(&AckReport) + Send + Sync>;

/// Registration of one source. It only knows the ids of its live tokens, the tokens point at
/// the entry and never the other way around.
struct SourceEntry {
    key: ComponentKey,
    active: bool,
    on_ack: RwLock<Option<AckCallback>>,
    in_flight: Mutex<HashMap<TokenId, DateTime<Utc>>>,
}

impl SourceEntry {
    fn finalize(&self, report: AckReport, respond_to: oneshot::Sender<TokenState>) {
        self.in_flight.lock().remove(&report.token);

        let labels = source_labels(&self.key);
        let metrics = ack_metrics();
        metrics.tokens_in_flight.get_or_create(&labels).dec();
        metrics
            .resolution_time
            .get_or_create(&labels)
            .observe(report.elapsed.as_micros() as f64);
        match report.state {
            TokenState::Failed => metrics.tokens_failed.get_or_create(&labels).inc(),
            _ => metrics.tokens_resolved.get_or_create(&labels).inc(),
        };
        debug!(source = %self.key, token = %report.token, state = %report.state, elapsed = ?report.elapsed, "Token finalized");

        let on_ack = self.on_ack.read().as_ref().map(Arc::clone);
        if let Some(on_ack) = on_ack {
            on_ack(&report);
        }
        // the source may have stopped waiting, that is fine
        let _ = respond_to.send(report.state);
    }
}

/// Per-source registry of acknowledgement callbacks and live tokens.
///
/// Tokens are only created for sources that have at least one acknowledged sink ahead of them,
/// every other source gets a sentinel that is resolved before it is even returned.
#[derive(Clone)]
pub struct AckRouter {
    config: Arc<AckConfig>,
    sources: Arc<RwLock<HashMap<ComponentKey, Arc<SourceEntry>>>>,
}

impl AckRouter {
    pub fn new(config: AckConfig) -> Self {
        Self {
            config: Arc::new(config),
            sources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &AckConfig {
        &self.config
    }

    pub fn compute_effective(&self, source: &ComponentKey, sink: &ComponentKey) -> bool {
        self.config.compute_effective(source, sink)
    }

    /// Registers `source` with a callback that fires exactly once per token of that source. A
    /// second registration replaces the callback, tokens already in flight report to the new one.
    pub fn register_source<F>(&self, source: impl Into<ComponentKey>, on_ack: F)
    where
        F: Fn(&AckReport) + Send + Sync + 'static,
    {
        self.register(source.into(), Some(Arc::new(on_ack)));
    }

    pub(crate) fn register(&self, source: ComponentKey, on_ack: Option<AckCallback>) {
        let mut sources = self.sources.write();
        if let Some(entry) = sources.get(&source) {
            if on_ack.is_some() {
                *entry.on_ack.write() = on_ack;
            }
            return;
        }
        let active = self.config.is_active(&source);
        debug!(%source, active, "Registering source");
        sources.insert(
            source.clone(),
            Arc::new(SourceEntry {
                key: source,
                active,
                on_ack: RwLock::new(on_ack),
                in_flight: Mutex::new(HashMap::new()),
            }),
        );
    }

    /// Creates the token for an event (or group of events) entering the pipeline from `source`.
    pub fn create(&self, source: &ComponentKey) -> Result<(AckToken, AckReceiver)> {
        let entry = self
            .sources
            .read()
            .get(source)
            .map(Arc::clone)
            .ok_or_else(|| Error::Topology(format!("source {source} is not registered")))?;

        if !entry.active {
            return Ok((
                AckToken::sentinel(),
                AckReceiver::ready(TokenState::Resolved),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let finalize_entry = Arc::clone(&entry);
        let token = AckToken::with_finalizer(
            source.clone(),
            Box::new(move |report| finalize_entry.finalize(report, tx)),
        );
        if let (Some(id), Some(created_at)) = (token.id(), token.created_at()) {
            entry.in_flight.lock().insert(id, created_at);
        }

        let labels = source_labels(source);
        ack_metrics().tokens_created.get_or_create(&labels).inc();
        ack_metrics().tokens_in_flight.get_or_create(&labels).inc();
        Ok((token, AckReceiver::waiting(rx)))
    }

    /// Number of tokens of `source` that are not terminal yet.
    pub fn in_flight(&self, source: &ComponentKey) -> usize {
        self.sources
            .read()
            .get(source)
            .map_or(0, |entry| entry.in_flight.lock().len())
    }

    /// Ids of the live tokens of `source`, oldest first.
    pub fn pending_tokens(&self, source: &ComponentKey) -> Vec<TokenId> {
        let Some(entry) = self.sources.read().get(source).map(Arc::clone) else {
            return Vec::new();
        };
        let mut pending: Vec<_> = entry.in_flight.lock().keys().copied().collect();
        pending.sort();
        pending
    }
}
