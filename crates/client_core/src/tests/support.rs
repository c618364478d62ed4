use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::UserProfile,
    store::{
        BlobRef, BlobStore, DocPath, DocumentStore, SnapshotStream, StoreError, VersionedDocument,
    },
};
use storage::Storage;

use crate::{config::Settings, ChatCore};

pub(crate) fn uid(id: &str) -> UserId {
    UserId::new(id)
}

pub(crate) fn fast_settings() -> Settings {
    Settings {
        database_url: "sqlite::memory:".into(),
        resubscribe_initial_backoff_ms: 1,
        resubscribe_max_backoff_ms: 4,
        resubscribe_max_attempts: 3,
        ..Settings::default()
    }
}

pub(crate) async fn memory_storage() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("db"))
}

pub(crate) fn core_over(store: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> ChatCore {
    ChatCore::new(store, blobs, fast_settings())
}

/// A core over a fresh in-memory store with one provisioned user per id.
pub(crate) async fn core_with_users(ids: &[&str]) -> (ChatCore, Arc<Storage>) {
    let storage = memory_storage().await;
    let core = core_over(storage.clone(), storage.clone());
    for id in ids {
        core.directory
            .provision(&UserProfile::new(*id, format!("{id}-name")))
            .await
            .expect("provision");
    }
    (core, storage)
}

/// Delegates to [`Storage`] but can fail subscriptions and inject a
/// competing write right before a versioned write.
pub(crate) struct ScriptedStore {
    pub inner: Arc<Storage>,
    pub failing_subscriptions: AtomicU32,
    pub subscribe_calls: AtomicU32,
    pub race_next_versioned_write: AtomicBool,
    pub racing_write: std::sync::Mutex<Option<(DocPath, Value)>>,
}

impl ScriptedStore {
    pub(crate) fn new(inner: Arc<Storage>) -> Self {
        Self {
            inner,
            failing_subscriptions: AtomicU32::new(0),
            subscribe_calls: AtomicU32::new(0),
            race_next_versioned_write: AtomicBool::new(false),
            racing_write: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn fail_subscriptions(&self, times: u32) {
        self.failing_subscriptions.store(times, Ordering::SeqCst);
    }

    /// The next `set_if_version` first lets a competitor overwrite `path`.
    pub(crate) fn race_next_write(&self, path: DocPath, body: Value) {
        *self.racing_write.lock().expect("lock") = Some((path, body));
        self.race_next_versioned_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn get(&self, path: &DocPath) -> Result<Option<VersionedDocument>, StoreError> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &DocPath, body: Value) -> Result<u64, StoreError> {
        self.inner.set(path, body).await
    }

    async fn set_if_version(
        &self,
        path: &DocPath,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        if self.race_next_versioned_write.swap(false, Ordering::SeqCst) {
            let racing = self.racing_write.lock().expect("lock").take();
            if let Some((race_path, race_body)) = racing {
                self.inner.set(&race_path, race_body).await?;
            }
        }
        self.inner.set_if_version(path, body, expected_version).await
    }

    async fn array_union(
        &self,
        path: &DocPath,
        field: &str,
        values: Vec<Value>,
    ) -> Result<u64, StoreError> {
        self.inner.array_union(path, field, values).await
    }

    async fn array_remove(
        &self,
        path: &DocPath,
        field: &str,
        values: Vec<Value>,
    ) -> Result<u64, StoreError> {
        self.inner.array_remove(path, field, values).await
    }

    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<VersionedDocument>, StoreError> {
        self.inner.query_eq(collection, field, value).await
    }

    fn subscribe(&self, path: &DocPath) -> SnapshotStream {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_subscriptions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_subscriptions
                .store(remaining - 1, Ordering::SeqCst);
            return futures::stream::once(async {
                Err(StoreError::Backend("connection reset".into()))
            })
            .boxed();
        }
        self.inner.subscribe(path)
    }
}

pub(crate) struct FailingBlobStore;

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn upload(&self, _name: &str, _bytes: Vec<u8>) -> Result<BlobRef, StoreError> {
        Err(StoreError::Backend("bucket unavailable".into()))
    }

    async fn resolve(&self, blob: &BlobRef) -> Result<String, StoreError> {
        Err(StoreError::NotFound(DocPath::new("blobs", blob.0.clone())))
    }
}
