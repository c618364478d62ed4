use std::sync::Arc;

use anyhow::Context;
use shared::{
    domain::{ChatId, UserId},
    store::{BlobStore, DocumentStore},
};
use storage::Storage;
use tracing::info;

pub mod block_registry;
pub mod chat_index;
pub mod chat_session;
pub mod config;
pub mod directory;
pub mod error;
pub mod sync_engine;

pub use block_registry::{block_state_for, BlockChange, BlockRegistry};
pub use chat_index::{ActiveChat, ChatIndexManager, ResolvedSummary};
pub use chat_session::{
    AttachmentLink, AttachmentUpload, ChatSession, ComposeDraft, SendReceipt, SharedMedia,
};
pub use config::Settings;
pub use directory::UserDirectory;
pub use error::{ChatError, ChatResult};
pub use sync_engine::{SyncEngine, SyncEvent, SyncHandle, SyncSignal, SyncState};

/// Who is looking at which conversation. Passed explicitly to every
/// operation that needs it; there is no ambient "current chat".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub viewer: UserId,
    pub chat_id: ChatId,
    pub counterpart: UserId,
}

impl SessionContext {
    pub fn new(viewer: UserId, chat_id: ChatId, counterpart: UserId) -> Self {
        Self {
            viewer,
            chat_id,
            counterpart,
        }
    }
}

/// All components wired over one document store and one blob store.
#[derive(Clone)]
pub struct ChatCore {
    pub directory: UserDirectory,
    pub blocks: BlockRegistry,
    pub index: ChatIndexManager,
    pub sessions: ChatSession,
    pub sync: SyncEngine,
}

impl ChatCore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        settings: Settings,
    ) -> Self {
        let directory = UserDirectory::new(Arc::clone(&store));
        let blocks = BlockRegistry::new(Arc::clone(&store));
        let index = ChatIndexManager::new(Arc::clone(&store), settings.index_write_attempts);
        let sessions = ChatSession::new(
            Arc::clone(&store),
            blobs,
            blocks.clone(),
            index.clone(),
        );
        let sync = SyncEngine::new(store, index.clone(), blocks.clone(), settings);
        Self {
            directory,
            blocks,
            index,
            sessions,
            sync,
        }
    }

    /// Opens the sqlite-backed store named by `settings`.
    pub async fn open(settings: Settings) -> anyhow::Result<Self> {
        let storage = Storage::new(&settings.database_url)
            .await
            .with_context(|| format!("failed to open store at '{}'", settings.database_url))?
            .with_blob_base_url(&settings.blob_base_url)?;
        info!(database_url = %settings.database_url, "core: store opened");
        let storage = Arc::new(storage);
        Ok(Self::new(storage.clone(), storage, settings))
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
