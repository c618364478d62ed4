use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use serde_json::json;
use shared::{
    domain::{BlockState, UserId},
    protocol::{profile_path, UserProfile},
    store::DocumentStore,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};

use crate::{
    directory::UserDirectory,
    error::{ChatError, ChatResult},
};

const BLOCK_CHANGE_CAPACITY: usize = 64;

/// Block state between two profiles, from `viewer`'s side. Being blocked
/// takes precedence over having blocked.
pub fn block_state_for(viewer: &UserProfile, counterpart: &UserProfile) -> BlockState {
    if counterpart.has_blocked(&viewer.id) {
        BlockState::ViewerIsBlocked
    } else if viewer.has_blocked(&counterpart.id) {
        BlockState::CounterpartIsBlocked
    } else {
        BlockState::NoneBlocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    pub viewer: UserId,
    pub counterpart: UserId,
    pub state: BlockState,
}

#[derive(Clone)]
pub struct BlockRegistry {
    store: Arc<dyn DocumentStore>,
    directory: UserDirectory,
    changes: broadcast::Sender<BlockChange>,
}

impl BlockRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (changes, _) = broadcast::channel(BLOCK_CHANGE_CAPACITY);
        Self {
            directory: UserDirectory::new(Arc::clone(&store)),
            store,
            changes,
        }
    }

    /// Reads both profiles fresh; nothing is cached between calls.
    pub async fn block_state(
        &self,
        viewer: &UserId,
        counterpart: &UserId,
    ) -> ChatResult<BlockState> {
        let (viewer, counterpart) = futures::try_join!(
            self.directory.profile(viewer),
            self.directory.profile(counterpart)
        )?;
        Ok(block_state_for(&viewer, &counterpart))
    }

    /// Gate for every send and attachment path.
    pub async fn ensure_can_send(&self, viewer: &UserId, counterpart: &UserId) -> ChatResult<()> {
        let state = self.block_state(viewer, counterpart).await?;
        if state.allows_send() {
            return Ok(());
        }
        warn!(viewer = %viewer, counterpart = %counterpart, ?state, "block: send rejected");
        Err(ChatError::Blocked {
            viewer: viewer.clone(),
            counterpart: counterpart.clone(),
        })
    }

    /// Adds `counterpart` to the viewer's block set if absent, removes it if
    /// present, then notifies listeners with the recomputed state.
    pub async fn toggle_block(
        &self,
        viewer: &UserId,
        counterpart: &UserId,
    ) -> ChatResult<BlockState> {
        let profile = self.directory.profile(viewer).await?;
        let path = profile_path(viewer);
        let value = vec![json!(counterpart)];
        let now_blocking = if profile.has_blocked(counterpart) {
            self.store.array_remove(&path, "blocked", value).await?;
            false
        } else {
            self.store.array_union(&path, "blocked", value).await?;
            true
        };
        info!(viewer = %viewer, counterpart = %counterpart, now_blocking, "block: toggled");

        let state = self.block_state(viewer, counterpart).await?;
        let _ = self.changes.send(BlockChange {
            viewer: viewer.clone(),
            counterpart: counterpart.clone(),
            state,
        });
        Ok(state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockChange> {
        self.changes.subscribe()
    }

    /// Changes that involve `user` on either side. Lagged receivers skip
    /// ahead instead of ending the stream.
    pub fn changes_for(&self, user: &UserId) -> BoxStream<'static, BlockChange> {
        let user = user.clone();
        BroadcastStream::new(self.changes.subscribe())
            .filter_map(move |change| {
                let relevant = match change {
                    Ok(change) if change.viewer == user || change.counterpart == user => {
                        Some(change)
                    }
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(user_id = %user, skipped, "blocks: change listener lagged");
                        None
                    }
                };
                futures::future::ready(relevant)
            })
            .boxed()
    }
}

#[cfg(test)]
#[path = "tests/block_registry_tests.rs"]
mod tests;
