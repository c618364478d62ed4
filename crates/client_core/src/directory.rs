use std::sync::Arc;

use shared::{
    domain::UserId,
    protocol::{profile_path, user_chats_path, UserChatsDocument, UserProfile, USERS_COLLECTION},
    store::{encode, DocumentStore},
};
use tracing::info;

use crate::error::{ChatError, ChatResult};

/// Profile lookups shared by the other components.
#[derive(Clone)]
pub struct UserDirectory {
    store: Arc<dyn DocumentStore>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Writes a profile and an empty conversation index for it. Account
    /// creation itself happens elsewhere; this seeds the documents the core
    /// expects to find.
    pub async fn provision(&self, profile: &UserProfile) -> ChatResult<()> {
        self.store
            .set(&profile_path(&profile.id), encode(profile)?)
            .await?;
        let index_path = user_chats_path(&profile.id);
        if self.store.get(&index_path).await?.is_none() {
            self.store
                .set(&index_path, encode(&UserChatsDocument::default())?)
                .await?;
        }
        info!(user_id = %profile.id, username = %profile.username, "directory: provisioned user");
        Ok(())
    }

    pub async fn profile(&self, user_id: &UserId) -> ChatResult<UserProfile> {
        let doc = self
            .store
            .get(&profile_path(user_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {user_id}")))?;
        Ok(doc.decode()?)
    }

    pub async fn find_by_username(&self, username: &str) -> ChatResult<Option<UserProfile>> {
        let matches = self
            .store
            .query_eq(USERS_COLLECTION, "username", &serde_json::json!(username))
            .await?;
        matches
            .first()
            .map(|doc| doc.decode().map_err(ChatError::from))
            .transpose()
    }
}
