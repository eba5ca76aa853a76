use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::Result;
use crate::ack::{AckRouter, FanoutTracker, Obligation, ShareOutcome};
use crate::error::Error;
use crate::event::{ComponentKey, Event};

/// Changes the outputs of a running [Fanout].
pub enum ControlMessage {
    Add(ComponentKey, mpsc::Sender<Event>),
    Remove(ComponentKey),
    /// Swaps the sender of an existing output. `None` pauses the output: the fan-out holds the
    /// next event until a `Some` arrives for that output.
    Replace(ComponentKey, Option<mpsc::Sender<Event>>),
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlMessage::")?;
        match self {
            Self::Add(id, _) => write!(f, "Add({id})"),
            Self::Remove(id) => write!(f, "Remove({id})"),
            Self::Replace(id, _) => write!(f, "Replace({id})"),
        }
    }
}

pub type ControlChannel = mpsc::UnboundedSender<ControlMessage>;

/// Sends each event of a component to every one of its outputs.
///
/// The obligation of the event is split across the outputs that lead to an acknowledged sink for
/// the event's source; every other output gets an untracked copy. Outputs added at runtime are not
/// part of the acknowledgement snapshot taken when the topology was built, they always get
/// untracked copies. While an output is paused the event waits at the fan-out, before any share is
/// issued for it.
pub(crate) struct Fanout {
    component: ComponentKey,
    tracker: FanoutTracker,
    router: AckRouter,
    outputs: Vec<(ComponentKey, Option<mpsc::Sender<Event>>)>,
    control_channel: mpsc::UnboundedReceiver<ControlMessage>,
}

impl Fanout {
    pub(crate) fn new(component: ComponentKey, router: AckRouter) -> (Self, ControlChannel) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let fanout = Self {
            tracker: FanoutTracker::new(component.clone()),
            component,
            router,
            outputs: Vec::new(),
            control_channel: control_rx,
        };
        (fanout, control_tx)
    }

    /// Adds an output, the name must be unique within this fan-out.
    pub(crate) fn add(&mut self, id: ComponentKey, output: mpsc::Sender<Event>) -> Result<()> {
        if self.outputs.iter().any(|(n, _)| n == &id) {
            return Err(Error::Topology(format!(
                "duplicate output {id} in fan-out of {}",
                self.component
            )));
        }
        self.outputs.push((id, Some(output)));
        Ok(())
    }

    fn remove(&mut self, id: &ComponentKey) {
        match self.outputs.iter().position(|(n, _)| n == id) {
            Some(i) => {
                self.outputs.remove(i);
            }
            None => warn!(component = %self.component, output = %id, "No such output to remove"),
        }
    }

    fn replace(&mut self, id: &ComponentKey, output: Option<mpsc::Sender<Event>>) {
        match self.outputs.iter_mut().find(|(n, _)| n == id) {
            Some((_, existing)) => *existing = output,
            None => warn!(component = %self.component, output = %id, "No such output to replace"),
        }
    }

    fn apply(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Add(id, output) => {
                if let Err(e) = self.add(id, output) {
                    warn!(component = %self.component, ?e, "Ignoring output");
                }
            }
            ControlMessage::Remove(id) => self.remove(&id),
            ControlMessage::Replace(id, output) => self.replace(&id, output),
        }
    }

    fn process_control_messages(&mut self) {
        loop {
            match self.control_channel.try_recv() {
                Ok(message) => self.apply(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }

    fn is_paused(&self) -> bool {
        self.outputs.iter().any(|(_, output)| output.is_none())
    }

    /// Waits on the control channel until no output is paused.
    async fn wait_for_outputs(&mut self) -> Result<()> {
        while self.is_paused() {
            debug!(component = %self.component, "Output paused, waiting for its replacement");
            match self.control_channel.recv().await {
                Some(message) => self.apply(message),
                None => {
                    return Err(Error::Forwarder(format!(
                        "an output of {} is paused and its control channel is closed",
                        self.component
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Sends the event to every output. An output whose receiver is gone is removed and the copy
    /// meant for it is failed. Errors when that leaves no output at all, or when the event carries
    /// a token that is already terminal. Waits first while any output is paused.
    pub(crate) async fn send(&mut self, event: Event) -> Result<()> {
        self.process_control_messages();
        self.wait_for_outputs().await?;

        let (data, source, obligation) = event.into_parts();
        let config = self.router.config();
        let tracked: Vec<ComponentKey> = self
            .outputs
            .iter()
            .filter(|(id, output)| output.is_some() && config.tracks(&source, id))
            .map(|(id, _)| id.clone())
            .collect();
        let mut shares = self.tracker.fan_out(obligation, &tracked)?.into_iter();

        let mut closed = Vec::new();
        for (id, output) in &self.outputs {
            let Some(output) = output else {
                continue;
            };
            let obligation = if tracked.contains(id) {
                shares.next().unwrap_or(Obligation::Untracked)
            } else {
                Obligation::Untracked
            };
            let event = Event::new(data.clone(), source.clone(), obligation);
            if let Err(mpsc::error::SendError(event)) = output.send(event).await {
                warn!(component = %self.component, output = %id, token = ?event.obligation.token_id(), "Output is closed, failing its copy of the event");
                event.obligation.resolve(ShareOutcome::Failed);
                closed.push(id.clone());
            }
        }

        if closed.is_empty() {
            return Ok(());
        }
        for id in &closed {
            self.remove(id);
        }
        if self.outputs.is_empty() {
            return Err(Error::Forwarder(format!(
                "every output of {} is closed",
                self.component
            )));
        }
        debug!(component = %self.component, remaining = self.outputs.len(), "Removed closed outputs");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::ack::{AckConfig, AckToken, TokenState};
    use crate::event::EventData;
    use crate::sinker::AckCapability;

    fn key(name: &str) -> ComponentKey {
        ComponentKey::from(name)
    }

    /// in -> {a, b}, acknowledgements on for `a` only.
    fn router() -> AckRouter {
        let paths = HashMap::from([(
            key("in"),
            HashMap::from([
                (key("in"), BTreeSet::from([key("a"), key("b")])),
                (key("a"), BTreeSet::from([key("a")])),
                (key("b"), BTreeSet::from([key("b")])),
            ]),
        )]);
        let capabilities = HashMap::from([
            (key("a"), AckCapability::ProtocolAck),
            (key("b"), AckCapability::ProtocolAck),
        ]);
        let config = AckConfig::new(true)
            .with_override("b", Some(false))
            .snapshot(&paths, &capabilities);
        AckRouter::new(config)
    }

    fn tracked_event() -> (Event, crate::ack::AckReceiver) {
        let (token, rx) = AckToken::new("in");
        (Event::with_token(EventData::new("hi"), key("in"), token), rx)
    }

    #[tokio::test]
    async fn test_splits_across_tracked_outputs_only() {
        let (mut fanout, _control) = Fanout::new(key("in"), router());
        let (a_tx, mut a_rx) = mpsc::channel(1);
        let (b_tx, mut b_rx) = mpsc::channel(1);
        fanout.add(key("a"), a_tx).unwrap();
        fanout.add(key("b"), b_tx).unwrap();

        let (event, mut ack_rx) = tracked_event();
        fanout.send(event).await.unwrap();

        let a = a_rx.recv().await.unwrap();
        let b = b_rx.recv().await.unwrap();
        assert!(a.obligation.is_tracked());
        assert!(!b.obligation.is_tracked());
        assert_eq!(b.data.payload, "hi");

        drop(b);
        assert_eq!(ack_rx.try_recv(), None);
        a.obligation.resolve(ShareOutcome::Acked);
        assert_eq!(ack_rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_closed_output_fails_and_is_removed() {
        let (mut fanout, _control) = Fanout::new(key("in"), router());
        let (a_tx, a_rx) = mpsc::channel(1);
        let (b_tx, mut b_rx) = mpsc::channel(1);
        fanout.add(key("a"), a_tx).unwrap();
        fanout.add(key("b"), b_tx).unwrap();
        drop(a_rx);

        let (event, ack_rx) = tracked_event();
        fanout.send(event).await.unwrap();
        assert_eq!(fanout.len(), 1);
        assert_eq!(ack_rx.recv().await, TokenState::Failed);
        assert!(b_rx.recv().await.is_some());

        drop(b_rx);
        let (event, ack_rx) = tracked_event();
        assert!(fanout.send(event).await.is_err());
        // `b` is untracked, nothing was waiting on it
        assert_eq!(ack_rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_control_messages() {
        let (mut fanout, control) = Fanout::new(key("in"), router());
        let (a_tx, mut a_rx) = mpsc::channel(1);
        fanout.add(key("a"), a_tx).unwrap();

        let (extra_tx, mut extra_rx) = mpsc::channel(1);
        control
            .send(ControlMessage::Add(key("extra"), extra_tx))
            .unwrap();
        control.send(ControlMessage::Remove(key("a"))).unwrap();

        let (event, ack_rx) = tracked_event();
        fanout.send(event).await.unwrap();
        assert_eq!(fanout.len(), 1);
        assert!(!extra_rx.recv().await.unwrap().obligation.is_tracked());
        // removed output does not get anything, the sender was dropped with it
        assert!(a_rx.recv().await.is_none());
        assert_eq!(ack_rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_replace_output() {
        let (mut fanout, control) = Fanout::new(key("in"), router());
        let (a_tx, mut old_a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        fanout.add(key("a"), a_tx).unwrap();
        fanout.add(key("b"), b_tx).unwrap();

        for payload in ["one", "two"] {
            fanout
                .send(Event::untracked(EventData::new(payload), key("in")))
                .await
                .unwrap();
        }

        let (new_a_tx, mut new_a_rx) = mpsc::channel(4);
        control
            .send(ControlMessage::Replace(key("a"), Some(new_a_tx)))
            .unwrap();
        let (event, ack_rx) = tracked_event();
        fanout.send(event).await.unwrap();
        assert_eq!(fanout.len(), 2);

        // the old output got everything sent before the swap, and was closed by it
        assert_eq!(old_a_rx.recv().await.unwrap().data.payload, "one");
        assert_eq!(old_a_rx.recv().await.unwrap().data.payload, "two");
        assert!(old_a_rx.recv().await.is_none());

        for payload in ["one", "two", "hi"] {
            assert_eq!(b_rx.recv().await.unwrap().data.payload, payload);
        }

        let replaced = new_a_rx.recv().await.unwrap();
        assert_eq!(replaced.data.payload, "hi");
        assert!(replaced.obligation.is_tracked());
        replaced.obligation.resolve(ShareOutcome::Acked);
        assert_eq!(ack_rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_paused_output_holds_events() {
        let (mut fanout, control) = Fanout::new(key("in"), router());
        let (a_tx, old_a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        fanout.add(key("a"), a_tx).unwrap();
        fanout.add(key("b"), b_tx).unwrap();

        control.send(ControlMessage::Replace(key("a"), None)).unwrap();
        drop(old_a_rx);

        let (event, mut ack_rx) = tracked_event();
        let handle = tokio::spawn(async move { fanout.send(event).await.map(|()| fanout) });

        // nothing leaves the fan-out while `a` is paused
        assert!(
            timeout(Duration::from_millis(50), b_rx.recv())
                .await
                .is_err()
        );
        assert_eq!(ack_rx.try_recv(), None);

        let (new_a_tx, mut new_a_rx) = mpsc::channel(4);
        control
            .send(ControlMessage::Replace(key("a"), Some(new_a_tx)))
            .unwrap();
        let fanout = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(fanout.len(), 2);

        assert!(b_rx.recv().await.is_some());
        new_a_rx
            .recv()
            .await
            .unwrap()
            .obligation
            .resolve(ShareOutcome::Acked);
        assert_eq!(ack_rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_paused_output_without_control_channel() {
        let (mut fanout, control) = Fanout::new(key("in"), router());
        let (a_tx, _a_rx) = mpsc::channel(4);
        fanout.add(key("a"), a_tx).unwrap();
        control.send(ControlMessage::Replace(key("a"), None)).unwrap();
        drop(control);

        let (event, ack_rx) = tracked_event();
        assert!(matches!(
            fanout.send(event).await,
            Err(Error::Forwarder(_))
        ));
        // the event never left the fan-out, its token was dropped unrouted
        assert_eq!(ack_rx.recv().await, TokenState::Failed);
    }

    #[test]
    fn test_duplicate_output() {
        let (mut fanout, _control) = Fanout::new(key("in"), router());
        let (tx, _rx) = mpsc::channel(1);
        fanout.add(key("a"), tx.clone()).unwrap();
        assert!(fanout.add(key("a"), tx).is_err());
    }
}
