//! Builds and runs a topology of sources, transforms and sinks.
//!
//! Every transform and sink runs as its own tokio task reading from a bounded channel. Sources are
//! driven by the caller through a [SourceHandle]. When the topology is built the acknowledgement
//! settings of every (source, sink) pair are computed once, from the paths that actually exist
//! between them, and frozen into the [AckRouter] shared by all components.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::ack::{
    AckCallback, AckConfig, AckReceiver, AckReport, AckRouter, SourcePaths, TokenState,
};
use crate::config::{
    DEFAULT_CHANNEL_CAPACITY, SinkKind, SinkOptions, TopologyConfig, TransformKind,
};
use crate::error::Error;
use crate::event::{ComponentKey, Event, EventData};
use crate::sinker::{
    AckCapability, BlackholeSink, BufferReader, LogSink, MemoryBuffer, Sink, SinkActor,
};
use crate::transformer::{
    Coalesce, LineSplitter, Passthrough, Transform, TransformPolicy, TransformStage,
};

/// Runtime fan-out of a component to its outputs.
pub(crate) mod fanout;

pub use fanout::{ControlChannel, ControlMessage};
use fanout::Fanout;

type TransformSpawner =
    Box<dyn FnOnce(mpsc::Receiver<Event>, Fanout) -> JoinHandle<Result<()>> + Send>;
type SinkSpawner =
    Box<dyn FnOnce(mpsc::Receiver<Event>, CancellationToken) -> JoinHandle<Result<()>> + Send>;

struct SourceSpec {
    name: ComponentKey,
    on_ack: Option<AckCallback>,
}

struct TransformSpec {
    name: ComponentKey,
    inputs: Vec<ComponentKey>,
    policy: TransformPolicy,
    spawn: TransformSpawner,
}

struct SinkSpec {
    name: ComponentKey,
    inputs: Vec<ComponentKey>,
    capability: AckCapability,
    acknowledgements: Option<bool>,
    spawn: SinkSpawner,
}

/// TopologyBuilder collects the components and their inputs, and builds a running [Topology].
pub struct TopologyBuilder {
    acknowledgements: bool,
    channel_capacity: usize,
    sources: Vec<SourceSpec>,
    transforms: Vec<TransformSpec>,
    sinks: Vec<SinkSpec>,
    buffers: HashMap<ComponentKey, BufferReader>,
}

impl TopologyBuilder {
    /// `acknowledgements` is the global default, sinks may override it.
    pub fn new(acknowledgements: bool) -> Self {
        Self {
            acknowledgements,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            sources: Vec::new(),
            transforms: Vec::new(),
            sinks: Vec::new(),
            buffers: HashMap::new(),
        }
    }

    /// Builder with every component of the configuration, using the built-in transforms and sinks.
    pub fn from_config(config: &TopologyConfig) -> Self {
        let mut builder = TopologyBuilder::new(config.acknowledgements.enabled)
            .channel_capacity(config.channel_capacity);

        for source in &config.sources {
            builder = builder.source(&source.name);
        }

        for transform in &config.transforms {
            let inputs: Vec<&str> = transform.inputs.iter().map(String::as_str).collect();
            builder = match transform.kind {
                TransformKind::Passthrough => {
                    builder.transform(&transform.name, &inputs, Passthrough)
                }
                TransformKind::SplitLines => {
                    builder.transform(&transform.name, &inputs, LineSplitter)
                }
                TransformKind::Coalesce { count } => {
                    builder.transform(&transform.name, &inputs, Coalesce::new(count))
                }
            };
        }

        for sink in &config.sinks {
            let inputs: Vec<&str> = sink.inputs.iter().map(String::as_str).collect();
            let options = sink.options();
            builder = match sink.kind {
                SinkKind::Log => builder.sink(&sink.name, &inputs, LogSink, options),
                SinkKind::Blackhole => builder.sink(&sink.name, &inputs, BlackholeSink, options),
                SinkKind::MemoryBuffer { capacity } => {
                    let (buffer, reader) = MemoryBuffer::new(capacity);
                    builder
                        .buffers
                        .insert(ComponentKey::from(&sink.name), reader);
                    builder.sink(&sink.name, &inputs, buffer, options)
                }
            };
        }
        builder
    }

    /// Capacity of the channel in front of every transform and sink.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn source(mut self, name: impl Into<ComponentKey>) -> Self {
        self.sources.push(SourceSpec {
            name: name.into(),
            on_ack: None,
        });
        self
    }

    /// Source whose callback fires exactly once per token, when the token turns terminal.
    pub fn source_with_callback<F>(mut self, name: impl Into<ComponentKey>, on_ack: F) -> Self
    where
        F: Fn(&AckReport) + Send + Sync + 'static,
    {
        self.sources.push(SourceSpec {
            name: name.into(),
            on_ack: Some(Arc::new(on_ack)),
        });
        self
    }

    pub fn transform<T>(
        mut self,
        name: impl Into<ComponentKey>,
        inputs: &[&str],
        transform: T,
    ) -> Self
    where
        T: Transform + Send + 'static,
    {
        let name = name.into();
        let policy = transform.policy();
        let stage_name = name.clone();
        self.transforms.push(TransformSpec {
            name,
            inputs: inputs.iter().map(|i| ComponentKey::from(*i)).collect(),
            policy,
            spawn: Box::new(move |input, output| {
                let stage = TransformStage::new(stage_name, transform, output);
                tokio::spawn(stage.run(input))
            }),
        });
        self
    }

    pub fn sink<S>(
        mut self,
        name: impl Into<ComponentKey>,
        inputs: &[&str],
        sink: S,
        options: SinkOptions,
    ) -> Self
    where
        S: Sink + Send + 'static,
    {
        let name = name.into();
        let capability = sink.capability();
        let acknowledgements = options.acknowledgements;
        let actor_name = name.clone();
        self.sinks.push(SinkSpec {
            name,
            inputs: inputs.iter().map(|i| ComponentKey::from(*i)).collect(),
            capability,
            acknowledgements,
            spawn: Box::new(move |input, cancel| {
                let actor = SinkActor::new(actor_name, sink, &options, cancel);
                tokio::spawn(actor.run(input))
            }),
        });
        self
    }

    /// Validates the graph, computes the acknowledgement snapshot and starts every transform and
    /// sink. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Topology> {
        let graph = self.validate()?;

        let source_keys: Vec<ComponentKey> = self.sources.iter().map(|s| s.name.clone()).collect();
        let paths = graph.source_paths(&source_keys);
        let capabilities: HashMap<ComponentKey, AckCapability> = self
            .sinks
            .iter()
            .map(|sink| (sink.name.clone(), sink.capability))
            .collect();
        let config = self
            .sinks
            .iter()
            .fold(AckConfig::new(self.acknowledgements), |config, sink| {
                config.with_override(sink.name.clone(), sink.acknowledgements)
            })
            .snapshot(&paths, &capabilities);

        let router = AckRouter::new(config);
        for source in &self.sources {
            router.register(source.name.clone(), source.on_ack.clone());
        }

        // one input channel per transform and sink
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let consumers = self
            .transforms
            .iter()
            .map(|t| &t.name)
            .chain(self.sinks.iter().map(|s| &s.name));
        for name in consumers {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            senders.insert(name.clone(), tx);
            receivers.insert(name.clone(), rx);
        }

        // one fan-out per source and transform, holding the only senders of its outputs
        let mut fanouts = HashMap::new();
        let mut controls = HashMap::new();
        for name in source_keys
            .iter()
            .chain(self.transforms.iter().map(|t| &t.name))
        {
            let (mut fanout, control) = Fanout::new(name.clone(), router.clone());
            for output in graph.outputs_of(name) {
                let sender = senders.get(output).ok_or_else(|| {
                    Error::Topology(format!("no input channel for {output}"))
                })?;
                fanout.add(output.clone(), sender.clone())?;
            }
            info!(component = %name, outputs = fanout.len(), "Wired component");
            fanouts.insert(name.clone(), fanout);
            controls.insert(name.clone(), control);
        }
        drop(senders);

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.sinks.len() + self.transforms.len());
        for sink in self.sinks {
            let input = receivers
                .remove(&sink.name)
                .ok_or_else(|| Error::Topology(format!("no input channel for {}", sink.name)))?;
            tasks.push((sink.name, (sink.spawn)(input, cancel.clone())));
        }
        for transform in self.transforms {
            let input = receivers.remove(&transform.name).ok_or_else(|| {
                Error::Topology(format!("no input channel for {}", transform.name))
            })?;
            let output = fanouts.remove(&transform.name).ok_or_else(|| {
                Error::Topology(format!("no fan-out for {}", transform.name))
            })?;
            info!(transform = %transform.name, policy = %transform.policy, "Spawning transform");
            tasks.push((transform.name, (transform.spawn)(input, output)));
        }

        let mut sources = HashMap::new();
        for key in source_keys {
            let fanout = fanouts
                .remove(&key)
                .ok_or_else(|| Error::Topology(format!("no fan-out for {key}")))?;
            sources.insert(
                key.clone(),
                SourceHandle {
                    key,
                    router: router.clone(),
                    fanout,
                },
            );
        }

        Ok(Topology {
            router,
            sources,
            controls,
            buffers: self.buffers,
            tasks,
            cancel,
        })
    }

    /// Checks names, inputs and cycles, and returns the downstream graph.
    fn validate(&self) -> Result<Graph> {
        let mut kinds: HashMap<&ComponentKey, Kind> = HashMap::new();
        let names = self
            .sources
            .iter()
            .map(|s| (&s.name, Kind::Source))
            .chain(self.transforms.iter().map(|t| (&t.name, Kind::Transform)))
            .chain(self.sinks.iter().map(|s| (&s.name, Kind::Sink)));
        for (name, kind) in names {
            if kinds.insert(name, kind).is_some() {
                return Err(Error::Topology(format!(
                    "component name {name} is used more than once"
                )));
            }
        }
        if self.sources.is_empty() {
            return Err(Error::Topology("topology has no source".to_string()));
        }

        let mut outputs: HashMap<ComponentKey, Vec<ComponentKey>> = HashMap::new();
        let consumers = self
            .transforms
            .iter()
            .map(|t| (&t.name, &t.inputs))
            .chain(self.sinks.iter().map(|s| (&s.name, &s.inputs)));
        for (name, inputs) in consumers {
            if inputs.is_empty() {
                return Err(Error::Topology(format!("{name} has no inputs")));
            }
            let mut seen = HashSet::new();
            for input in inputs {
                match kinds.get(input) {
                    None => {
                        return Err(Error::Topology(format!(
                            "{name} has unknown input {input}"
                        )));
                    }
                    Some(Kind::Sink) => {
                        return Err(Error::Topology(format!(
                            "{name} cannot read from sink {input}"
                        )));
                    }
                    Some(Kind::Source | Kind::Transform) => {}
                }
                if !seen.insert(input) {
                    return Err(Error::Topology(format!(
                        "{name} lists input {input} more than once"
                    )));
                }
                outputs.entry(input.clone()).or_default().push(name.clone());
            }
        }

        let graph = Graph {
            outputs,
            sinks: self.sinks.iter().map(|s| s.name.clone()).collect(),
        };
        graph.check_acyclic(self.transforms.iter().map(|t| &t.name))?;
        Ok(graph)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Source,
    Transform,
    Sink,
}

/// Downstream edges of a validated topology.
struct Graph {
    outputs: HashMap<ComponentKey, Vec<ComponentKey>>,
    sinks: HashSet<ComponentKey>,
}

impl Graph {
    fn outputs_of(&self, component: &ComponentKey) -> &[ComponentKey] {
        self.outputs.get(component).map(Vec::as_slice).unwrap_or_default()
    }

    fn check_acyclic<'a>(&self, transforms: impl Iterator<Item = &'a ComponentKey>) -> Result<()> {
        let mut done = HashSet::new();
        for transform in transforms {
            let mut visiting = HashSet::new();
            self.visit(transform, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        component: &ComponentKey,
        visiting: &mut HashSet<ComponentKey>,
        done: &mut HashSet<ComponentKey>,
    ) -> Result<()> {
        if done.contains(component) {
            return Ok(());
        }
        if !visiting.insert(component.clone()) {
            return Err(Error::Topology(format!(
                "cycle detected through {component}"
            )));
        }
        for output in self.outputs_of(component) {
            self.visit(output, visiting, done)?;
        }
        visiting.remove(component);
        done.insert(component.clone());
        Ok(())
    }

    /// Sinks reachable from `component`, itself included when it is a sink.
    fn reachable_sinks(
        &self,
        component: &ComponentKey,
        memo: &mut HashMap<ComponentKey, BTreeSet<ComponentKey>>,
    ) -> BTreeSet<ComponentKey> {
        if let Some(sinks) = memo.get(component) {
            return sinks.clone();
        }
        let mut sinks = BTreeSet::new();
        if self.sinks.contains(component) {
            sinks.insert(component.clone());
        }
        for output in self.outputs_of(component) {
            sinks.extend(self.reachable_sinks(output, memo));
        }
        memo.insert(component.clone(), sinks.clone());
        sinks
    }

    /// For every source, the components its events can reach (the source included) and the
    /// sinks ahead of each of them.
    fn source_paths(&self, sources: &[ComponentKey]) -> SourcePaths {
        let mut memo = HashMap::new();
        let mut paths = SourcePaths::new();
        for source in sources {
            let mut components = HashMap::new();
            let mut queue = VecDeque::from([source.clone()]);
            while let Some(component) = queue.pop_front() {
                if components.contains_key(&component) {
                    continue;
                }
                queue.extend(self.outputs_of(&component).iter().cloned());
                let sinks = self.reachable_sinks(&component, &mut memo);
                components.insert(component, sinks);
            }
            paths.insert(source.clone(), components);
        }
        paths
    }
}

/// Entry point of one source into a running topology.
pub struct SourceHandle {
    key: ComponentKey,
    router: AckRouter,
    fanout: Fanout,
}

impl SourceHandle {
    pub fn key(&self) -> &ComponentKey {
        &self.key
    }

    /// Sends one event. The returned receiver yields the terminal state of its token; it is
    /// ready at once when no acknowledged sink is reachable from this source.
    pub async fn send(&mut self, data: EventData) -> Result<AckReceiver> {
        let (token, rx) = self.router.create(&self.key)?;
        self.fanout
            .send(Event::with_token(data, self.key.clone(), token))
            .await?;
        Ok(rx)
    }

    /// Sends a group of events covered by a single token, e.g. one request carrying many events.
    pub async fn send_batch(&mut self, batch: Vec<EventData>) -> Result<AckReceiver> {
        let (token, rx) = self.router.create(&self.key)?;
        if batch.is_empty() {
            token.resolve_unshared();
            return Ok(rx);
        }
        let holders = vec![self.key.clone(); batch.len()];
        let shares = token.add_shares(&holders)?;
        for (data, share) in batch.into_iter().zip(shares) {
            self.fanout
                .send(Event::new(data, self.key.clone(), share.into()))
                .await?;
        }
        Ok(rx)
    }

    /// Sends one event and waits, without a deadline, for its terminal state.
    pub async fn send_and_wait(&mut self, data: EventData) -> Result<TokenState> {
        let rx = self.send(data).await?;
        Ok(rx.recv().await)
    }
}

/// A running topology.
pub struct Topology {
    router: AckRouter,
    sources: HashMap<ComponentKey, SourceHandle>,
    controls: HashMap<ComponentKey, ControlChannel>,
    buffers: HashMap<ComponentKey, BufferReader>,
    tasks: Vec<(ComponentKey, JoinHandle<Result<()>>)>,
    cancel: CancellationToken,
}

impl Topology {
    pub fn router(&self) -> &AckRouter {
        &self.router
    }

    pub fn take_source(&mut self, name: &str) -> Option<SourceHandle> {
        self.sources.remove(&ComponentKey::from(name))
    }

    /// Control channel of the fan-out of a source or transform.
    pub fn control(&self, name: &str) -> Option<ControlChannel> {
        self.controls.get(&ComponentKey::from(name)).cloned()
    }

    /// Reader of a `memory_buffer` sink created from configuration.
    pub fn take_buffer(&mut self, name: &str) -> Option<BufferReader> {
        self.buffers.remove(&ComponentKey::from(name))
    }

    /// Makes sinks stop retrying, whatever they are still retrying is failed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Closes the sources that were not taken and waits for every transform and sink to drain.
    /// Sources taken with [Topology::take_source] have to be dropped first. Every share still in
    /// the pipeline is resolved by the time this returns.
    pub async fn shutdown(mut self) -> Result<()> {
        self.sources.clear();

        let mut result = Ok(());
        for (name, handle) in self.tasks.drain(..) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Forwarder(format!("{name} task failed: {e}"))),
            };
            if let Err(e) = outcome {
                error!(component = %name, ?e, "Component stopped with an error");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!("Topology stopped");
        result
    }
}
