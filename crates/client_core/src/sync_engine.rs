use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::UserId,
    protocol::{conversation_path, user_chats_path, ConversationDocument, Message},
    store::{DocPath, DocumentStore, SnapshotStream, VersionedDocument},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    block_registry::BlockRegistry,
    chat_index::{ChatIndexManager, ResolvedSummary},
    config::Settings,
    error::ChatResult,
    SessionContext,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    /// Someone other than the viewer appended a message. Drives the audio
    /// notification.
    NewInboundMessage(Message),
    ScrollToEnd,
}

/// Per-subscription diff state for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Uninitialized,
    Synced {
        last_count: usize,
        last_sender_of_tail: Option<UserId>,
    },
}

impl SyncState {
    /// Consumes one snapshot and returns the signals it warrants. The first
    /// snapshot only establishes the baseline.
    pub fn advance(&mut self, snapshot: &ConversationDocument, viewer: &UserId) -> Vec<SyncSignal> {
        let count = snapshot.messages.len();
        let tail = snapshot.last_message();

        let mut signals = Vec::new();
        if let SyncState::Synced { last_count, .. } = self {
            if count > *last_count {
                if let Some(tail) = tail.filter(|tail| &tail.sender_id != viewer) {
                    signals.push(SyncSignal::NewInboundMessage(tail.clone()));
                }
                signals.push(SyncSignal::ScrollToEnd);
            }
        }

        *self = SyncState::Synced {
            last_count: count,
            last_sender_of_tail: tail.map(|tail| tail.sender_id.clone()),
        };
        signals
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConversationUpdated(ConversationDocument),
    IndexUpdated(Vec<ResolvedSummary>),
    Signal(SyncSignal),
    /// Resubscription gave up; the cached value is the last known good one.
    Degraded,
}

#[derive(Debug, Clone, Copy)]
struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            initial: settings.resubscribe_initial_backoff(),
            max: settings.resubscribe_max_backoff(),
            max_attempts: settings.resubscribe_max_attempts,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Opens a fresh snapshot stream; called again on every resubscription.
type SnapshotSource = Box<dyn Fn() -> SnapshotStream + Send + Sync>;

/// Turns raw snapshots of one document into cached values and events.
#[async_trait]
trait SnapshotHandler: Send + 'static {
    type Output: Clone + Send + Sync + 'static;

    async fn handle(
        &mut self,
        snapshot: Option<VersionedDocument>,
    ) -> ChatResult<Option<(Self::Output, Vec<SyncEvent>)>>;
}

struct ConversationHandler {
    viewer: UserId,
    state: SyncState,
}

#[async_trait]
impl SnapshotHandler for ConversationHandler {
    type Output = ConversationDocument;

    async fn handle(
        &mut self,
        snapshot: Option<VersionedDocument>,
    ) -> ChatResult<Option<(ConversationDocument, Vec<SyncEvent>)>> {
        let Some(snapshot) = snapshot else {
            return Ok(None);
        };
        let conversation: ConversationDocument = snapshot.decode()?;
        let mut events = vec![SyncEvent::ConversationUpdated(conversation.clone())];
        events.extend(
            self.state
                .advance(&conversation, &self.viewer)
                .into_iter()
                .map(SyncEvent::Signal),
        );
        Ok(Some((conversation, events)))
    }
}

struct IndexHandler {
    user: UserId,
    index: ChatIndexManager,
}

#[async_trait]
impl SnapshotHandler for IndexHandler {
    type Output = Vec<ResolvedSummary>;

    async fn handle(
        &mut self,
        snapshot: Option<VersionedDocument>,
    ) -> ChatResult<Option<(Vec<ResolvedSummary>, Vec<SyncEvent>)>> {
        let resolved = self.index.resolve_snapshot(&self.user, snapshot).await?;
        let events = vec![SyncEvent::IndexUpdated(resolved.clone())];
        Ok(Some((resolved, events)))
    }
}

/// Sending half held by the background task.
struct Link<T> {
    closed: Arc<AtomicBool>,
    events: mpsc::Sender<SyncEvent>,
    cache: watch::Sender<Option<T>>,
}

impl<T> Link<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `false` once nobody should hear from this task again.
    async fn emit(&self, event: SyncEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.events.send(event).await.is_ok()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct SyncHandle<T> {
    closed: Arc<AtomicBool>,
    events: mpsc::Receiver<SyncEvent>,
    cache: watch::Receiver<Option<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> SyncHandle<T> {
    /// Next event, or `None` once unsubscribed or the task has finished.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        if self.is_closed() {
            return None;
        }
        let event = self.events.recv().await;
        if self.is_closed() {
            return None;
        }
        event
    }

    /// Last successfully processed value.
    pub fn latest(&self) -> Option<T> {
        self.cache.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the subscription. Safe to call more than once; no event is
    /// delivered afterwards.
    pub fn unsubscribe(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.abort();
        self.events.close();
        debug!("sync: unsubscribed");
    }
}

impl<T> Drop for SyncHandle<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.task.abort();
    }
}

/// Runs document subscriptions in background tasks and turns their
/// snapshots into [`SyncEvent`]s.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    index: ChatIndexManager,
    blocks: BlockRegistry,
    settings: Settings,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: ChatIndexManager,
        blocks: BlockRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            index,
            blocks,
            settings,
        }
    }

    pub fn watch_conversation(&self, ctx: &SessionContext) -> SyncHandle<ConversationDocument> {
        let path = conversation_path(&ctx.chat_id);
        let store = Arc::clone(&self.store);
        let source_path = path.clone();
        self.spawn(
            path,
            Box::new(move || store.subscribe(&source_path)),
            ConversationHandler {
                viewer: ctx.viewer.clone(),
                state: SyncState::Uninitialized,
            },
        )
    }

    /// Re-resolves the list on every index write and on every block change
    /// involving `user`, since masking depends on the counterpart's profile.
    pub fn watch_index(&self, user: &UserId) -> SyncHandle<Vec<ResolvedSummary>> {
        let path = user_chats_path(user);
        let store = Arc::clone(&self.store);
        let blocks = self.blocks.clone();
        let watched = user.clone();
        let source_path = path.clone();
        let source: SnapshotSource = Box::new(move || {
            let reread_store = Arc::clone(&store);
            let reread_path = source_path.clone();
            let rereads = blocks.changes_for(&watched).then(move |change| {
                let store = Arc::clone(&reread_store);
                let path = reread_path.clone();
                async move {
                    debug!(
                        %path,
                        viewer = %change.viewer,
                        state = ?change.state,
                        "sync: block change, re-reading index"
                    );
                    store.get(&path).await
                }
            });
            futures::stream::select(store.subscribe(&source_path), rereads).boxed()
        });
        self.spawn(
            path,
            source,
            IndexHandler {
                user: user.clone(),
                index: self.index.clone(),
            },
        )
    }

    fn spawn<H: SnapshotHandler>(
        &self,
        path: DocPath,
        source: SnapshotSource,
        handler: H,
    ) -> SyncHandle<H::Output> {
        let closed = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel(self.settings.signal_buffer.max(1));
        let (cache_tx, cache_rx) = watch::channel(None);
        let link = Link {
            closed: Arc::clone(&closed),
            events: events_tx,
            cache: cache_tx,
        };
        let task = tokio::spawn(drive(
            path,
            source,
            BackoffPolicy::from_settings(&self.settings),
            handler,
            link,
        ));
        SyncHandle {
            closed,
            events: events_rx,
            cache: cache_rx,
            task,
        }
    }
}

/// Subscribe, process, and on failure resubscribe with exponential
/// backoff until the attempt budget runs out.
async fn drive<H: SnapshotHandler>(
    path: DocPath,
    source: SnapshotSource,
    policy: BackoffPolicy,
    mut handler: H,
    link: Link<H::Output>,
) {
    let mut failures = 0u32;
    loop {
        let mut snapshots = source();
        while let Some(item) = snapshots.next().await {
            if link.is_closed() {
                return;
            }
            let outcome = match item {
                Ok(snapshot) => handler.handle(snapshot).await,
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(Some((value, events))) => {
                    failures = 0;
                    link.cache.send_replace(Some(value));
                    for event in events {
                        if !link.emit(event).await {
                            return;
                        }
                    }
                }
                Ok(None) => failures = 0,
                Err(error) => {
                    warn!(%path, %error, "sync: subscription failed");
                    break;
                }
            }
        }
        if link.is_closed() {
            return;
        }

        failures += 1;
        if failures > policy.max_attempts {
            warn!(%path, attempts = policy.max_attempts, "sync: giving up, serving cached state");
            link.emit(SyncEvent::Degraded).await;
            return;
        }
        let delay = policy.delay_for(failures);
        info!(%path, attempt = failures, ?delay, "sync: resubscribing");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[path = "tests/sync_engine_tests.rs"]
mod tests;
