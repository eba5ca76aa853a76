//! [AckToken] and [ObligationShare] primitives.
//!
//! A token is created when an event enters the pipeline. Every place that has to confirm delivery
//! of that event (a sink, or an intermediate split) holds one [ObligationShare]. The token turns
//! `Resolved` when the last share is resolved without any failure, or `Failed` as soon as one share
//! fails. Whichever happens first runs the token's finalizer, exactly once.
//!
//! The outstanding share count and the terminal state are packed into a single atomic word, so an
//! `add` can never interleave with the "last share resolved" transition.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Error, Result};
use crate::event::ComponentKey;
use crate::metrics::{ack_metrics, share_labels};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

const RESOLVED: u64 = 1 << 63;
const FAILED: u64 = 1 << 62;
const TERMINAL: u64 = RESOLVED | FAILED;
const OUTSTANDING: u64 = !TERMINAL;

/// Monotonic id of an [AckToken], unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(u64);

impl TokenId {
    fn next() -> Self {
        Self(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of an [AckToken].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    /// every share resolved as `Acked` or `Dropped`.
    Resolved,
    /// at least one share resolved as `Failed`.
    Failed,
}

impl TokenState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TokenState::Pending)
    }

    fn from_word(word: u64) -> Self {
        if word & RESOLVED != 0 {
            TokenState::Resolved
        } else if word & FAILED != 0 {
            TokenState::Failed
        } else {
            TokenState::Pending
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenState::Pending => write!(f, "pending"),
            TokenState::Resolved => write!(f, "resolved"),
            TokenState::Failed => write!(f, "failed"),
        }
    }
}

/// How the holder of an [ObligationShare] discharged it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// destination confirmed delivery.
    Acked,
    /// dropped by policy (e.g. persisted into a buffer), counts as success.
    Dropped,
    /// delivery will not happen.
    Failed,
}

impl ShareOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, ShareOutcome::Failed)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ShareOutcome::Acked => "acked",
            ShareOutcome::Dropped => "dropped",
            ShareOutcome::Failed => "failed",
        }
    }
}

/// Handed to the finalizer of a token once it turns terminal.
#[derive(Debug, Clone)]
pub struct AckReport {
    pub token: TokenId,
    pub source: ComponentKey,
    pub state: TokenState,
    pub created_at: DateTime<Utc>,
    pub elapsed: Duration,
}

pub(crate) type Finalizer = Box<dyn FnOnce(AckReport) + Send>;

struct TokenInner {
    id: TokenId,
    source: ComponentKey,
    created_at: DateTime<Utc>,
    started: Instant,
    /// terminal bits | outstanding share count
    word: AtomicU64,
    finalizer: Mutex<Option<Finalizer>>,
}

impl TokenInner {
    fn state(&self) -> TokenState {
        TokenState::from_word(self.word.load(Ordering::Acquire))
    }

    fn outstanding(&self) -> u64 {
        self.word.load(Ordering::Acquire) & OUTSTANDING
    }

    /// Adds `n` shares, refusing once the token is terminal.
    fn try_add(&self, n: u64) -> Result<()> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & TERMINAL != 0 {
                return Err(Error::TokenAlreadyTerminal { token: self.id });
            }
            match self.word.compare_exchange_weak(
                current,
                current + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Adds `n` shares on behalf of a live share. The token cannot be `Resolved` while that share
    /// is outstanding, but it may already be `Failed`; the new shares still have to be accounted.
    fn add_from_share(&self, n: u64) {
        self.word.fetch_add(n, Ordering::AcqRel);
    }

    fn release(&self, outcome: ShareOutcome) {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let outstanding = current & OUTSTANDING;
            debug_assert!(outstanding > 0, "share released more often than added");
            let remaining = outstanding.saturating_sub(1);
            let terminal = current & TERMINAL;
            let next = match outcome {
                _ if terminal != 0 => terminal | remaining,
                ShareOutcome::Failed => FAILED | remaining,
                ShareOutcome::Acked | ShareOutcome::Dropped if remaining == 0 => RESOLVED,
                ShareOutcome::Acked | ShareOutcome::Dropped => remaining,
            };
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if terminal == 0 && next & TERMINAL != 0 {
                        self.finish(TokenState::from_word(next));
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves a token that never issued a share straight to `state`. Returns whether this call
    /// made the token terminal.
    fn settle_unshared(&self, state: TokenState) -> bool {
        let bit = match state {
            TokenState::Resolved => RESOLVED,
            TokenState::Failed => FAILED,
            TokenState::Pending => return false,
        };
        if self
            .word
            .compare_exchange(0, bit, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.finish(state);
            return true;
        }
        false
    }

    fn fail(&self) {
        let mut current = self.word.load(Ordering::Acquire);
        while current & TERMINAL == 0 {
            match self.word.compare_exchange_weak(
                current,
                current | FAILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.finish(TokenState::Failed);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn finish(&self, state: TokenState) {
        let Some(finalizer) = self.finalizer.lock().take() else {
            return;
        };
        finalizer(AckReport {
            token: self.id,
            source: self.source.clone(),
            state,
            created_at: self.created_at,
            elapsed: self.started.elapsed(),
        });
    }
}

/// Delivery obligation of one logical event (or group of events).
///
/// A sentinel token (see [AckToken::sentinel]) tracks nothing: it is always `Resolved`, allocates
/// nothing and its shares are no-ops. It is what a source gets when acknowledgements are disabled
/// on every path it feeds.
pub struct AckToken {
    inner: Option<Arc<TokenInner>>,
}

impl AckToken {
    /// Creates a standalone token. Its terminal state is delivered on the returned receiver.
    pub fn new(source: impl Into<ComponentKey>) -> (Self, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        let token = Self::with_finalizer(
            source.into(),
            Box::new(move |report: AckReport| {
                let _ = tx.send(report.state);
            }),
        );
        (token, AckReceiver::waiting(rx))
    }

    pub(crate) fn with_finalizer(source: ComponentKey, finalizer: Finalizer) -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                id: TokenId::next(),
                source,
                created_at: Utc::now(),
                started: Instant::now(),
                word: AtomicU64::new(0),
                finalizer: Mutex::new(Some(finalizer)),
            })),
        }
    }

    pub fn sentinel() -> Self {
        Self { inner: None }
    }

    pub fn is_sentinel(&self) -> bool {
        self.inner.is_none()
    }

    pub fn id(&self) -> Option<TokenId> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.inner.as_ref().map(|inner| inner.created_at)
    }

    pub fn state(&self) -> TokenState {
        self.inner
            .as_ref()
            .map_or(TokenState::Resolved, |inner| inner.state())
    }

    /// Number of shares issued and not yet resolved.
    pub fn outstanding(&self) -> u64 {
        self.inner.as_ref().map_or(0, |inner| inner.outstanding())
    }

    /// Issues one share to `holder`.
    pub fn add_share(&self, holder: impl Into<ComponentKey>) -> Result<ObligationShare> {
        let holder = holder.into();
        let Some(inner) = &self.inner else {
            return Ok(ObligationShare::sentinel(holder));
        };
        inner.try_add(1)?;
        Ok(ObligationShare::new(Arc::clone(inner), holder))
    }

    /// Issues one share per holder, incrementing the outstanding count once for all of them.
    pub fn add_shares(&self, holders: &[ComponentKey]) -> Result<Vec<ObligationShare>> {
        let Some(inner) = &self.inner else {
            return Ok(holders.iter().cloned().map(ObligationShare::sentinel).collect());
        };
        if holders.is_empty() {
            return Ok(Vec::new());
        }
        inner.try_add(holders.len() as u64)?;
        Ok(holders
            .iter()
            .map(|holder| ObligationShare::new(Arc::clone(inner), holder.clone()))
            .collect())
    }

    /// Resolves a token that was routed to no destination at all. If shares were already issued
    /// they decide the outcome and this is a no-op.
    pub fn resolve_unshared(self) {
        if let Some(inner) = &self.inner {
            inner.settle_unshared(TokenState::Resolved);
        }
    }

    /// Fails the token regardless of its outstanding shares.
    pub fn fail(self) {
        if let Some(inner) = &self.inner {
            inner.fail();
        }
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "AckToken(sentinel)"),
            Some(inner) => f
                .debug_struct("AckToken")
                .field("id", &inner.id)
                .field("source", &inner.source)
                .field("state", &inner.state())
                .field("outstanding", &inner.outstanding())
                .finish(),
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        // a token that never issued a share and was never settled would leave its source waiting
        // forever.
        if let Some(inner) = &self.inner {
            if inner.settle_unshared(TokenState::Failed) {
                warn!(token = %inner.id, source = %inner.source, "Token dropped before it was routed, reporting failure");
            }
        }
    }
}

/// One destination's outstanding promise on an [AckToken].
///
/// Resolving consumes the share. A share dropped without being resolved fails its token, so a
/// lost share can never leave the source waiting.
#[must_use = "dropping an unresolved share fails its token"]
pub struct ObligationShare {
    token: Option<Arc<TokenInner>>,
    holder: ComponentKey,
}

impl ObligationShare {
    fn new(token: Arc<TokenInner>, holder: ComponentKey) -> Self {
        Self {
            token: Some(token),
            holder,
        }
    }

    fn sentinel(holder: ComponentKey) -> Self {
        Self {
            token: None,
            holder,
        }
    }

    pub fn holder(&self) -> &ComponentKey {
        &self.holder
    }

    pub fn token_id(&self) -> Option<TokenId> {
        self.token.as_ref().map(|token| token.id)
    }

    pub fn is_sentinel(&self) -> bool {
        self.token.is_none()
    }

    pub fn resolve(mut self, outcome: ShareOutcome) {
        let Some(token) = self.token.take() else {
            return;
        };
        ack_metrics()
            .shares_resolved
            .get_or_create(&share_labels(&self.holder, outcome))
            .inc();
        token.release(outcome);
    }

    /// Replaces this share by one share per holder. The outstanding count moves by
    /// `holders.len() - 1` in a single step; an empty `holders` resolves the share as `Acked`.
    pub fn split(mut self, holders: &[ComponentKey]) -> Vec<ObligationShare> {
        let Some(token) = self.token.take() else {
            return holders.iter().cloned().map(ObligationShare::sentinel).collect();
        };
        if holders.is_empty() {
            token.release(ShareOutcome::Acked);
            return Vec::new();
        }
        token.add_from_share(holders.len() as u64 - 1);
        holders
            .iter()
            .map(|holder| ObligationShare::new(Arc::clone(&token), holder.clone()))
            .collect()
    }
}

impl fmt::Debug for ObligationShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObligationShare")
            .field("token", &self.token_id())
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for ObligationShare {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            warn!(token = %token.id, holder = %self.holder, "Obligation share dropped without resolution, failing token");
            ack_metrics()
                .shares_resolved
                .get_or_create(&share_labels(&self.holder, ShareOutcome::Failed))
                .inc();
            token.release(ShareOutcome::Failed);
        }
    }
}

/// What an [crate::event::Event] carries for its source.
#[derive(Debug)]
pub enum Obligation {
    /// nobody waits for this event.
    Untracked,
    /// token not routed anywhere yet.
    Root(AckToken),
    Share(ObligationShare),
}

impl Obligation {
    pub fn is_tracked(&self) -> bool {
        match self {
            Obligation::Untracked => false,
            Obligation::Root(token) => !token.is_sentinel(),
            Obligation::Share(share) => !share.is_sentinel(),
        }
    }

    pub fn token_id(&self) -> Option<TokenId> {
        match self {
            Obligation::Untracked => None,
            Obligation::Root(token) => token.id(),
            Obligation::Share(share) => share.token_id(),
        }
    }

    /// Discharges the obligation without routing it any further.
    pub fn resolve(self, outcome: ShareOutcome) {
        match self {
            Obligation::Untracked => {}
            Obligation::Root(token) => match outcome {
                ShareOutcome::Failed => token.fail(),
                ShareOutcome::Acked | ShareOutcome::Dropped => token.resolve_unshared(),
            },
            Obligation::Share(share) => share.resolve(outcome),
        }
    }
}

impl From<AckToken> for Obligation {
    fn from(token: AckToken) -> Self {
        if token.is_sentinel() {
            Obligation::Untracked
        } else {
            Obligation::Root(token)
        }
    }
}

impl From<ObligationShare> for Obligation {
    fn from(share: ObligationShare) -> Self {
        if share.is_sentinel() {
            Obligation::Untracked
        } else {
            Obligation::Share(share)
        }
    }
}

/// The shares covering one batch handed to a sink. Destinations may confirm a batch more than
/// once; only the first resolution counts, later ones find the batch empty.
#[derive(Debug, Default)]
pub struct ShareBatch {
    shares: Mutex<Vec<ObligationShare>>,
}

impl ShareBatch {
    pub fn new(shares: Vec<ObligationShare>) -> Self {
        Self {
            shares: Mutex::new(shares),
        }
    }

    pub fn push(&self, share: ObligationShare) {
        self.shares.lock().push(share);
    }

    pub fn len(&self) -> usize {
        self.shares.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.lock().is_empty()
    }

    /// Resolves every share still held, returns how many were resolved by this call.
    pub fn resolve(&self, outcome: ShareOutcome) -> usize {
        let shares = std::mem::take(&mut *self.shares.lock());
        let resolved = shares.len();
        for share in shares {
            share.resolve(outcome);
        }
        resolved
    }
}

/// Lets a source await the terminal state of its token.
#[derive(Debug)]
pub struct AckReceiver(ReceiverState);

#[derive(Debug)]
enum ReceiverState {
    Ready(TokenState),
    Waiting(oneshot::Receiver<TokenState>),
}

impl AckReceiver {
    pub(crate) fn ready(state: TokenState) -> Self {
        Self(ReceiverState::Ready(state))
    }

    pub(crate) fn waiting(rx: oneshot::Receiver<TokenState>) -> Self {
        Self(ReceiverState::Waiting(rx))
    }

    /// Waits, without a deadline, for the token to turn terminal.
    pub async fn recv(self) -> TokenState {
        match self.0 {
            ReceiverState::Ready(state) => state,
            ReceiverState::Waiting(rx) => rx.await.unwrap_or_else(|_| {
                warn!("Token finalizer dropped without reporting, treating as failed");
                TokenState::Failed
            }),
        }
    }

    /// Non-blocking check, `None` while the token is still pending.
    pub fn try_recv(&mut self) -> Option<TokenState> {
        let state = match &mut self.0 {
            ReceiverState::Ready(state) => return Some(*state),
            ReceiverState::Waiting(rx) => match rx.try_recv() {
                Ok(state) => state,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => TokenState::Failed,
            },
        };
        self.0 = ReceiverState::Ready(state);
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn keys(names: &[&str]) -> Vec<ComponentKey> {
        names.iter().map(|name| ComponentKey::from(*name)).collect()
    }

    #[tokio::test]
    async fn test_resolves_after_last_share() {
        let (token, mut rx) = AckToken::new("in");
        let shares = token.add_shares(&keys(&["a", "b", "c"])).unwrap();
        assert_eq!(token.outstanding(), 3);

        let mut shares = shares.into_iter();
        shares.next().unwrap().resolve(ShareOutcome::Acked);
        shares.next().unwrap().resolve(ShareOutcome::Dropped);
        assert_eq!(token.state(), TokenState::Pending);
        assert_eq!(rx.try_recv(), None);

        shares.next().unwrap().resolve(ShareOutcome::Acked);
        assert_eq!(token.state(), TokenState::Resolved);
        assert_eq!(rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_failed_share_fails_immediately() {
        let (token, rx) = AckToken::new("in");
        let mut shares = token.add_shares(&keys(&["a", "b"])).unwrap().into_iter();

        shares.next().unwrap().resolve(ShareOutcome::Failed);
        assert_eq!(token.state(), TokenState::Failed);
        assert_eq!(token.outstanding(), 1);

        // later resolutions only drain the count
        shares.next().unwrap().resolve(ShareOutcome::Acked);
        assert_eq!(token.state(), TokenState::Failed);
        assert_eq!(token.outstanding(), 0);
        assert_eq!(rx.recv().await, TokenState::Failed);
    }

    #[test]
    fn test_add_share_after_terminal() {
        let (token, _rx) = AckToken::new("in");
        token.add_share("a").unwrap().resolve(ShareOutcome::Acked);
        assert_eq!(token.state(), TokenState::Resolved);

        let err = token.add_share("b").unwrap_err();
        assert_eq!(
            err,
            Error::TokenAlreadyTerminal {
                token: token.id().unwrap()
            }
        );
        assert_eq!(token.outstanding(), 0);
    }

    #[test]
    fn test_sentinel_costs_nothing() {
        let token = AckToken::sentinel();
        assert_eq!(token.state(), TokenState::Resolved);
        assert!(token.id().is_none());

        let share = token.add_share("a").unwrap();
        assert!(share.is_sentinel());
        share.resolve(ShareOutcome::Failed);
        assert_eq!(token.state(), TokenState::Resolved);
        assert!(matches!(Obligation::from(token), Obligation::Untracked));
    }

    #[tokio::test]
    async fn test_dropped_share_fails_token() {
        let (token, rx) = AckToken::new("in");
        let share = token.add_share("a").unwrap();
        drop(share);
        assert_eq!(rx.recv().await, TokenState::Failed);
    }

    #[tokio::test]
    async fn test_dropped_root_fails_token() {
        let (token, rx) = AckToken::new("in");
        drop(token);
        assert_eq!(rx.recv().await, TokenState::Failed);
    }

    #[tokio::test]
    async fn test_root_dropped_after_fanout_is_harmless() {
        let (token, rx) = AckToken::new("in");
        let share = token.add_share("a").unwrap();
        drop(token);
        share.resolve(ShareOutcome::Acked);
        assert_eq!(rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_split_share() {
        let (token, rx) = AckToken::new("in");
        let share = token.add_share("split").unwrap();

        let children = share.split(&keys(&["x", "y", "z"]));
        assert_eq!(children.len(), 3);
        assert_eq!(token.outstanding(), 3);

        for child in children {
            assert_eq!(token.state(), TokenState::Pending);
            child.resolve(ShareOutcome::Acked);
        }
        assert_eq!(rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_split_into_nothing_resolves() {
        let (token, rx) = AckToken::new("in");
        let share = token.add_share("filter").unwrap();
        assert!(share.split(&[]).is_empty());
        assert_eq!(rx.recv().await, TokenState::Resolved);
    }

    #[tokio::test]
    async fn test_share_batch_resolves_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let token = AckToken::with_finalizer(
            "in".into(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let batch = Arc::new(ShareBatch::new(
            token.add_shares(&keys(&["a", "a", "a"])).unwrap(),
        ));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let batch = Arc::clone(&batch);
            handles.push(tokio::spawn(async move {
                batch.resolve(ShareOutcome::Acked)
            }));
        }
        let mut resolved = 0;
        for handle in handles {
            resolved += handle.await.unwrap();
        }

        assert_eq!(resolved, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(token.state(), TokenState::Resolved);
    }
}
