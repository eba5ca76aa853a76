use std::fmt;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::Result;
use crate::ack::{FanoutTracker, Obligation, ShareOutcome};
use crate::event::{ComponentKey, Event, EventData};
use crate::topology::fanout::Fanout;

/// Built-in transforms.
mod builtin;

pub use builtin::{Coalesce, LineSplitter, Passthrough};

/// How the outputs of a transform relate to its input, which decides what happens to the
/// obligation the input carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformPolicy {
    /// one output per input, the obligation moves to the output untouched.
    Identity,
    /// any number of outputs per input, each output holds a share of the input's obligation.
    Fanning,
    /// outputs cannot be traced back to inputs, the input's obligation is discharged on entry.
    Lossy,
}

impl fmt::Display for TransformPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformPolicy::Identity => write!(f, "identity"),
            TransformPolicy::Fanning => write!(f, "fanning"),
            TransformPolicy::Lossy => write!(f, "lossy"),
        }
    }
}

/// Set of items to be implemented by a transform.
#[trait_variant::make(Transform: Send)]
pub trait LocalTransform {
    /// Declared once, read when the stage starts.
    fn policy(&self) -> TransformPolicy;

    async fn transform(&mut self, event: EventData) -> Result<Vec<EventData>>;

    /// Called once the input is closed, returns whatever the transform still holds.
    async fn flush(&mut self) -> Result<Vec<EventData>>;
}

/// Runs one transform and forwards its outputs downstream.
pub(crate) struct TransformStage<T> {
    name: ComponentKey,
    transform: T,
    policy: TransformPolicy,
    tracker: FanoutTracker,
    output: Fanout,
    /// source of the last input, used for the outputs of the final flush.
    last_source: Option<ComponentKey>,
}

impl<T> TransformStage<T>
where
    T: Transform,
{
    pub(crate) fn new(name: ComponentKey, transform: T, output: Fanout) -> Self {
        let policy = transform.policy();
        Self {
            tracker: FanoutTracker::new(name.clone()),
            name,
            transform,
            policy,
            output,
            last_source: None,
        }
    }

    /// Processes the input until it is closed. Stops early only when no output is left to send
    /// to, or on a fan-out invariant violation.
    pub(crate) async fn run(mut self, mut input: mpsc::Receiver<Event>) -> Result<()> {
        info!(transform = %self.name, policy = %self.policy, "Starting transform");

        while let Some(event) = input.recv().await {
            self.process(event).await?;
        }

        let flushed = match self.transform.flush().await {
            Ok(flushed) => flushed,
            Err(e) => {
                error!(transform = %self.name, ?e, "Failed to flush transform");
                Vec::new()
            }
        };
        if let Some(source) = self.last_source.take() {
            for data in flushed {
                self.output
                    .send(Event::untracked(data, source.clone()))
                    .await?;
            }
        }

        info!(transform = %self.name, "Transform input closed, stopping");
        Ok(())
    }

    async fn process(&mut self, event: Event) -> Result<()> {
        let (data, source, obligation) = event.into_parts();
        self.last_source = Some(source.clone());

        if self.policy == TransformPolicy::Lossy {
            // the stage may hold, merge or drop the event, nobody can wait on it past this point
            obligation.resolve(ShareOutcome::Acked);
            let outputs = match self.transform.transform(data).await {
                Ok(outputs) => outputs,
                Err(e) => {
                    error!(transform = %self.name, ?e, "Transform failed");
                    return Ok(());
                }
            };
            for data in outputs {
                self.output
                    .send(Event::untracked(data, source.clone()))
                    .await?;
            }
            return Ok(());
        }

        let outputs = match self.transform.transform(data).await {
            Ok(outputs) => outputs,
            Err(e) => {
                error!(transform = %self.name, ?e, token = ?obligation.token_id(), "Transform failed, failing the event");
                obligation.resolve(ShareOutcome::Failed);
                return Ok(());
            }
        };

        let obligations = self.split(obligation, outputs.len())?;
        for (data, obligation) in outputs.into_iter().zip(obligations) {
            self.output
                .send(Event::new(data, source.clone(), obligation))
                .await?;
        }
        Ok(())
    }

    /// One obligation per output.
    fn split(&self, obligation: Obligation, outputs: usize) -> Result<Vec<Obligation>> {
        if self.policy == TransformPolicy::Identity {
            if outputs == 1 {
                return Ok(vec![obligation]);
            }
            if outputs > 1 {
                warn!(transform = %self.name, outputs, "Identity transform produced several outputs, splitting the obligation");
            }
        }
        let holders = vec![self.name.clone(); outputs];
        self.tracker.fan_out(obligation, &holders)
    }
}
