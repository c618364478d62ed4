use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use futures::{future::try_join_all, stream::BoxStream, StreamExt};
use shared::{
    domain::{BlockState, ChatId, UserId},
    protocol::{
        conversation_path, user_chats_path, ConversationDocument, ConversationSummary,
        UserChatsDocument, UserProfile,
    },
    store::{encode, DocumentStore, StoreError, VersionedDocument},
};
use tracing::{debug, info, warn};

use crate::{
    block_registry::block_state_for,
    directory::UserDirectory,
    error::{ChatError, ChatResult},
    SessionContext,
};

const BLOCKED_DISPLAY_NAME: &str = "User";
const BLOCKED_PREVIEW: &str = "You are blocked";

/// A summary merged with its counterpart's profile, as shown in the list.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSummary {
    pub summary: ConversationSummary,
    pub counterpart: UserProfile,
    pub block_state: BlockState,
}

impl ResolvedSummary {
    fn masked(&self) -> bool {
        self.block_state == BlockState::ViewerIsBlocked
    }

    pub fn display_name(&self) -> &str {
        if self.masked() {
            BLOCKED_DISPLAY_NAME
        } else {
            &self.counterpart.username
        }
    }

    /// `None` means "use the default avatar".
    pub fn display_avatar(&self) -> Option<&str> {
        if self.masked() {
            None
        } else {
            self.counterpart.avatar.as_deref()
        }
    }

    pub fn display_preview(&self) -> &str {
        if self.masked() {
            BLOCKED_PREVIEW
        } else {
            &self.summary.last_message
        }
    }
}

/// Keeps the first summary seen per counterpart, then orders by
/// `updated_at`, newest first.
pub fn dedup_and_order(items: Vec<ResolvedSummary>) -> Vec<ResolvedSummary> {
    let mut seen = HashSet::new();
    let mut unique: Vec<ResolvedSummary> = items
        .into_iter()
        .filter(|item| seen.insert(item.counterpart.id.clone()))
        .collect();
    unique.sort_by(|a, b| b.summary.updated_at.cmp(&a.summary.updated_at));
    unique
}

/// Case-insensitive username search over an already resolved list.
pub fn filter_by_username<'a>(
    items: &'a [ResolvedSummary],
    query: &str,
) -> Vec<&'a ResolvedSummary> {
    let needle = query.to_lowercase();
    items
        .iter()
        .filter(|item| item.counterpart.username.to_lowercase().contains(&needle))
        .collect()
}

/// Result of opening a conversation from the list.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveChat {
    pub context: SessionContext,
    /// Withheld when the counterpart has blocked the viewer.
    pub counterpart: Option<UserProfile>,
    pub block_state: BlockState,
}

/// Owns each user's `userchats` index document.
///
/// Every in-place change goes through [`ChatIndexManager::update_index`], a
/// versioned read-modify-write that retries on conflict, so concurrent
/// writers to the same index never silently drop each other's changes.
#[derive(Clone)]
pub struct ChatIndexManager {
    store: Arc<dyn DocumentStore>,
    directory: UserDirectory,
    write_attempts: u32,
}

impl ChatIndexManager {
    pub fn new(store: Arc<dyn DocumentStore>, write_attempts: u32) -> Self {
        Self {
            directory: UserDirectory::new(Arc::clone(&store)),
            store,
            write_attempts: write_attempts.max(1),
        }
    }

    /// Resolved, deduplicated, newest-first list on every index change.
    pub fn subscribe(&self, user: &UserId) -> BoxStream<'static, ChatResult<Vec<ResolvedSummary>>> {
        let manager = self.clone();
        let user = user.clone();
        self.store
            .subscribe(&user_chats_path(&user))
            .then(move |snapshot| {
                let manager = manager.clone();
                let user = user.clone();
                async move { manager.resolve_snapshot(&user, snapshot?).await }
            })
            .boxed()
    }

    /// One-shot read of the same list `subscribe` produces.
    pub async fn conversations(&self, user: &UserId) -> ChatResult<Vec<ResolvedSummary>> {
        let snapshot = self.store.get(&user_chats_path(user)).await?;
        self.resolve_snapshot(user, snapshot).await
    }

    pub(crate) async fn resolve_snapshot(
        &self,
        user: &UserId,
        snapshot: Option<VersionedDocument>,
    ) -> ChatResult<Vec<ResolvedSummary>> {
        let Some(snapshot) = snapshot else {
            return Ok(Vec::new());
        };
        let index: UserChatsDocument = snapshot.decode()?;
        self.resolve(user, index.chats).await
    }

    /// Fetches every counterpart profile concurrently. Summaries whose
    /// counterpart no longer exists are dropped.
    pub async fn resolve(
        &self,
        user: &UserId,
        summaries: Vec<ConversationSummary>,
    ) -> ChatResult<Vec<ResolvedSummary>> {
        let viewer = self.directory.profile(user).await?;
        let lookups = summaries.iter().map(|summary| async move {
            match self.directory.profile(&summary.receiver_id).await {
                Ok(profile) => Ok(Some(profile)),
                Err(ChatError::NotFound(_)) => Ok(None),
                Err(err) => Err(err),
            }
        });
        let profiles = try_join_all(lookups).await?;

        let resolved = summaries
            .into_iter()
            .zip(profiles)
            .filter_map(|(summary, profile)| {
                let Some(counterpart) = profile else {
                    warn!(
                        owner = %user,
                        chat_id = %summary.chat_id,
                        counterpart = %summary.receiver_id,
                        "index: dropping summary with unknown counterpart"
                    );
                    return None;
                };
                Some(ResolvedSummary {
                    block_state: block_state_for(&viewer, &counterpart),
                    summary,
                    counterpart,
                })
            })
            .collect();
        Ok(dedup_and_order(resolved))
    }

    /// Marks the owner's summary as seen and returns the context for
    /// working with the conversation.
    pub async fn select_conversation(
        &self,
        user: &UserId,
        chat_id: &ChatId,
    ) -> ChatResult<ActiveChat> {
        let mut counterpart_id = None;
        self.update_index(user, |chats| {
            let Some(entry) = chats.iter_mut().find(|entry| &entry.chat_id == chat_id) else {
                return false;
            };
            counterpart_id = Some(entry.receiver_id.clone());
            if entry.is_seen {
                return false;
            }
            entry.is_seen = true;
            true
        })
        .await?;
        let counterpart_id = counterpart_id.ok_or_else(|| {
            ChatError::NotFound(format!("conversation {chat_id} in index of {user}"))
        })?;

        let (viewer, counterpart) = futures::try_join!(
            self.directory.profile(user),
            self.directory.profile(&counterpart_id)
        )?;
        let block_state = block_state_for(&viewer, &counterpart);
        debug!(user = %user, chat_id = %chat_id, ?block_state, "index: conversation selected");

        Ok(ActiveChat {
            context: SessionContext::new(user.clone(), chat_id.clone(), counterpart_id),
            counterpart: (block_state != BlockState::ViewerIsBlocked).then_some(counterpart),
            block_state,
        })
    }

    /// Drops the caller's own summary. The counterpart's replica and the
    /// shared log are untouched. Returns whether anything was removed.
    pub async fn remove_conversation(&self, user: &UserId, chat_id: &ChatId) -> ChatResult<bool> {
        let removed = self
            .update_index(user, |chats| {
                let before = chats.len();
                chats.retain(|entry| &entry.chat_id != chat_id);
                chats.len() != before
            })
            .await?;
        if removed {
            info!(user = %user, chat_id = %chat_id, "index: conversation removed locally");
        }
        Ok(removed)
    }

    /// Creates the shared log and one summary in each participant's index.
    ///
    /// The initiator's summary is claimed first with a versioned write, so of
    /// two concurrent creates for the same pair exactly one succeeds and the
    /// other sees `AlreadyExists`.
    pub async fn create_conversation(
        &self,
        initiator: &UserId,
        counterpart: &UserId,
    ) -> ChatResult<ChatId> {
        if initiator == counterpart {
            return Err(ChatError::AlreadyExists {
                counterpart: counterpart.clone(),
            });
        }
        self.directory.profile(counterpart).await?;
        // Fail before creating anything if the counterpart has no index.
        self.read_index(counterpart).await?;

        let chat_id = ChatId::generate();
        let now = Utc::now().timestamp_millis();
        let for_initiator = ConversationSummary::new(chat_id.clone(), counterpart.clone(), now);
        let mut already_exists = false;
        self.update_index(initiator, |chats| {
            already_exists = chats.iter().any(|entry| &entry.receiver_id == counterpart);
            if already_exists {
                return false;
            }
            chats.push(for_initiator.clone());
            true
        })
        .await?;
        if already_exists {
            return Err(ChatError::AlreadyExists {
                counterpart: counterpart.clone(),
            });
        }

        self.store
            .set(
                &conversation_path(&chat_id),
                encode(&ConversationDocument::empty(Utc::now()))?,
            )
            .await?;

        // A summary the counterpart still holds for an older conversation
        // with the initiator is replaced, keeping one entry per pair.
        let for_counterpart = ConversationSummary::new(chat_id.clone(), initiator.clone(), now);
        self.update_index(counterpart, |chats| {
            chats.retain(|entry| &entry.receiver_id != initiator);
            chats.push(for_counterpart.clone());
            true
        })
        .await?;

        info!(
            chat_id = %chat_id,
            initiator = %initiator,
            counterpart = %counterpart,
            "index: conversation created"
        );
        Ok(chat_id)
    }

    /// Post-send bookkeeping for one owner. Re-creates the owner's summary
    /// if they had removed it.
    pub(crate) async fn record_send(
        &self,
        owner: &UserId,
        chat_id: &ChatId,
        counterpart: &UserId,
        preview: &str,
        seen: bool,
        sent_at: i64,
    ) -> ChatResult<()> {
        self.update_index(owner, |chats| {
            let position = match chats.iter().position(|entry| &entry.chat_id == chat_id) {
                Some(position) => position,
                None => {
                    chats.push(ConversationSummary::new(
                        chat_id.clone(),
                        counterpart.clone(),
                        sent_at - 1,
                    ));
                    chats.len() - 1
                }
            };
            let entry = &mut chats[position];
            entry.last_message = preview.to_string();
            entry.is_seen = seen;
            // Strictly increasing even if the sender's clock lags.
            entry.updated_at = sent_at.max(entry.updated_at + 1);
            true
        })
        .await?;
        Ok(())
    }

    async fn read_index(&self, user: &UserId) -> ChatResult<UserChatsDocument> {
        let doc = self
            .store
            .get(&user_chats_path(user))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation index of {user}")))?;
        Ok(doc.decode()?)
    }

    /// Versioned read-modify-write of one owner's index. `mutate` returns
    /// whether it changed anything; unchanged documents are not written.
    async fn update_index<F>(&self, owner: &UserId, mut mutate: F) -> ChatResult<bool>
    where
        F: FnMut(&mut Vec<ConversationSummary>) -> bool + Send,
    {
        let path = user_chats_path(owner);
        for attempt in 1..=self.write_attempts {
            let current = self
                .store
                .get(&path)
                .await?
                .ok_or_else(|| ChatError::NotFound(format!("conversation index of {owner}")))?;
            let mut index: UserChatsDocument = current.decode()?;
            if !mutate(&mut index.chats) {
                return Ok(false);
            }
            match self
                .store
                .set_if_version(&path, encode(&index)?, current.version)
                .await
            {
                Ok(_) => return Ok(true),
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(owner = %owner, attempt, actual, "index: version conflict, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        warn!(
            owner = %owner,
            attempts = self.write_attempts,
            "index: write contention not resolved"
        );
        Err(ChatError::TransientStoreFailure(format!(
            "index of {owner} kept changing across {} attempts",
            self.write_attempts
        )))
    }
}

#[cfg(test)]
#[path = "tests/chat_index_tests.rs"]
mod tests;
