use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;

use crate::event::ComponentKey;
use crate::sinker::AckCapability;

/// Sinks reachable from each component, per source. The source itself is one of the components.
pub(crate) type SourcePaths = HashMap<ComponentKey, HashMap<ComponentKey, BTreeSet<ComponentKey>>>;

/// An acknowledged (source, sink) pair where the sink cannot confirm delivery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnsupportedPair {
    pub source: ComponentKey,
    pub sink: ComponentKey,
}

/// Effective acknowledgement settings of a built topology.
///
/// The global default and the per-sink overrides are given up front, the per (source, sink)
/// values are computed once when the topology is built and never change afterwards. A different
/// setting needs a new topology.
#[derive(Debug, Clone, Default)]
pub struct AckConfig {
    global_default: bool,
    overrides: HashMap<ComponentKey, bool>,
    effective: HashMap<(ComponentKey, ComponentKey), bool>,
    /// per source, the components that lead to at least one acknowledged sink able to confirm
    /// delivery
    tracked: HashMap<ComponentKey, HashSet<ComponentKey>>,
    unsupported: Vec<UnsupportedPair>,
}

impl AckConfig {
    pub fn new(global_default: bool) -> Self {
        Self {
            global_default,
            ..Default::default()
        }
    }

    pub fn with_override(mut self, sink: impl Into<ComponentKey>, enabled: Option<bool>) -> Self {
        let sink = sink.into();
        match enabled {
            Some(enabled) => {
                self.overrides.insert(sink, enabled);
            }
            None => {
                self.overrides.remove(&sink);
            }
        }
        self
    }

    pub fn sink_override(&self, sink: &ComponentKey) -> Option<bool> {
        self.overrides.get(sink).copied()
    }

    /// Per-sink override if set, else the global default. Served from the snapshot when the pair
    /// was seen at build time.
    pub fn compute_effective(&self, source: &ComponentKey, sink: &ComponentKey) -> bool {
        self.effective
            .get(&(source.clone(), sink.clone()))
            .copied()
            .unwrap_or_else(|| self.sink_override(sink).unwrap_or(self.global_default))
    }

    /// Whether events from `source` need a real token at all.
    pub fn is_active(&self, source: &ComponentKey) -> bool {
        self.tracks(source, source)
    }

    /// Whether an event from `source` entering `component` still has an acknowledged sink ahead
    /// that can confirm delivery. Paths ending only in `Unsupported` sinks are acknowledged when
    /// the event is handed to them, they never hold a share.
    pub fn tracks(&self, source: &ComponentKey, component: &ComponentKey) -> bool {
        self.tracked
            .get(source)
            .is_some_and(|components| components.contains(component))
    }

    /// Pairs that asked for acknowledgements against a sink that cannot give them.
    pub fn unsupported_pairs(&self) -> &[UnsupportedPair] {
        &self.unsupported
    }

    /// Computes and caches every (source, sink) value, and logs a warning once per acknowledged
    /// pair whose sink has no delivery confirmation. Such sinks do not make a component tracked.
    pub(crate) fn snapshot(
        mut self,
        paths: &SourcePaths,
        capabilities: &HashMap<ComponentKey, AckCapability>,
    ) -> Self {
        let mut unsupported = BTreeSet::new();
        for (source, components) in paths {
            let mut tracked = HashSet::new();
            for (component, sinks) in components {
                for sink in sinks {
                    let enabled = self.sink_override(sink).unwrap_or(self.global_default);
                    self.effective
                        .insert((source.clone(), sink.clone()), enabled);
                    if !enabled {
                        continue;
                    }
                    if capabilities.get(sink) == Some(&AckCapability::Unsupported) {
                        unsupported.insert(UnsupportedPair {
                            source: source.clone(),
                            sink: sink.clone(),
                        });
                        continue;
                    }
                    tracked.insert(component.clone());
                }
            }
            self.tracked.insert(source.clone(), tracked);
        }

        for pair in &unsupported {
            warn!(
                source = %pair.source,
                sink = %pair.sink,
                "Acknowledgements are enabled but the sink cannot confirm delivery, events are acknowledged as soon as they reach it"
            );
        }
        self.unsupported = unsupported.into_iter().collect();
        self
    }
}
