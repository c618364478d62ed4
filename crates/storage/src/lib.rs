use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use shared::store::{
    BlobRef, BlobStore, DocPath, DocumentStore, SnapshotStream, StoreError, VersionedDocument,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use url::Url;

const CHANGE_FEED_CAPACITY: usize = 1024;
const DEFAULT_BLOB_BASE_URL: &str = "blob://local/";

/// Sqlite-backed document and blob store.
///
/// Every write bumps the row's version and publishes the document path on
/// an in-process change feed, which backs [`DocumentStore::subscribe`].
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<DocPath>,
    blob_base_url: Url,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // In-memory databases are per-connection state; keep a single one.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            pool,
            changes,
            blob_base_url: Url::parse(DEFAULT_BLOB_BASE_URL)?,
        })
    }

    pub fn with_blob_base_url(mut self, base_url: &str) -> Result<Self> {
        let mut parsed =
            Url::parse(base_url).with_context(|| format!("invalid blob base url '{base_url}'"))?;
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        self.blob_base_url = parsed;
        Ok(self)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn read_document(&self, path: &DocPath) -> Result<Option<VersionedDocument>> {
        let row = sqlx::query(
            "SELECT body, version FROM documents WHERE collection = ? AND doc_id = ?",
        )
        .bind(&path.collection)
        .bind(&path.id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read document {path}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.try_get("body")?;
        let version: i64 = row.try_get("version")?;
        Ok(Some(VersionedDocument {
            id: path.id.clone(),
            body: serde_json::from_str(&body)
                .with_context(|| format!("corrupt document body at {path}"))?,
            version: version as u64,
        }))
    }

    pub async fn write_document(&self, path: &DocPath, body: &Value) -> Result<u64> {
        let version: i64 = sqlx::query_scalar(
            "INSERT INTO documents (collection, doc_id, body, version) VALUES (?, ?, ?, 1)
             ON CONFLICT(collection, doc_id) DO UPDATE SET
                body = excluded.body,
                version = documents.version + 1,
                updated_at = CURRENT_TIMESTAMP
             RETURNING version",
        )
        .bind(&path.collection)
        .bind(&path.id)
        .bind(body.to_string())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to write document {path}"))?;

        self.publish(path);
        Ok(version as u64)
    }

    /// Returns `None` when the stored version no longer matches.
    pub async fn compare_and_set(
        &self,
        path: &DocPath,
        body: &Value,
        expected_version: u64,
    ) -> Result<Option<u64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "UPDATE documents
             SET body = ?, version = version + 1, updated_at = CURRENT_TIMESTAMP
             WHERE collection = ? AND doc_id = ? AND version = ?
             RETURNING version",
        )
        .bind(body.to_string())
        .bind(&path.collection)
        .bind(&path.id)
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed versioned write of document {path}"))?;

        if version.is_some() {
            self.publish(path);
        }
        Ok(version.map(|v| v as u64))
    }

    pub async fn list_collection(&self, collection: &str) -> Result<Vec<VersionedDocument>> {
        let rows = sqlx::query(
            "SELECT doc_id, body, version FROM documents WHERE collection = ? ORDER BY doc_id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list collection {collection}"))?;

        rows.into_iter()
            .map(|row| -> Result<VersionedDocument> {
                let body: String = row.try_get("body")?;
                let version: i64 = row.try_get("version")?;
                Ok(VersionedDocument {
                    id: row.try_get("doc_id")?,
                    body: serde_json::from_str(&body)?,
                    version: version as u64,
                })
            })
            .collect()
    }

    /// Read-modify-write of one array field, retried until the versioned
    /// write lands. This is what makes the array primitives atomic.
    async fn mutate_array<F>(
        &self,
        path: &DocPath,
        field: &str,
        mutate: F,
    ) -> Result<u64, StoreError>
    where
        F: Fn(&mut Vec<Value>),
    {
        loop {
            let Some(current) = self.read_document(path).await.map_err(backend)? else {
                return Err(StoreError::NotFound(path.clone()));
            };
            let mut body = current.body;
            let object = body.as_object_mut().ok_or_else(|| {
                StoreError::Backend(format!("document {path} is not an object"))
            })?;
            let entry = object
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = entry else {
                return Err(StoreError::Backend(format!(
                    "field '{field}' of {path} is not an array"
                )));
            };
            mutate(items);

            match self
                .compare_and_set(path, &body, current.version)
                .await
                .map_err(backend)?
            {
                Some(version) => return Ok(version),
                None => debug!(%path, field, "array write raced, retrying"),
            }
        }
    }

    fn publish(&self, path: &DocPath) {
        // No receivers simply means nobody is subscribed.
        let _ = self.changes.send(path.clone());
    }

    /// Stores `bytes` under `images/<timestamp>_<name>`. Separators in
    /// `name` are replaced so the key stays one level below `images/`.
    pub async fn store_blob(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let blob_key = format!(
            "images/{}_{}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            name.replace(['/', '\\'], "_")
        );
        sqlx::query("INSERT INTO blobs (blob_key, bytes, size_bytes) VALUES (?, ?, ?)")
            .bind(&blob_key)
            .bind(bytes)
            .bind(bytes.len() as i64)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to store blob {blob_key}"))?;
        Ok(blob_key)
    }

    pub async fn load_blob(&self, blob_key: &str) -> Result<Option<Vec<u8>>> {
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT bytes FROM blobs WHERE blob_key = ?")
                .bind(blob_key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to load blob {blob_key}"))?;
        Ok(bytes)
    }
}

#[async_trait]
impl DocumentStore for Storage {
    async fn get(&self, path: &DocPath) -> Result<Option<VersionedDocument>, StoreError> {
        self.read_document(path).await.map_err(backend)
    }

    async fn set(&self, path: &DocPath, body: Value) -> Result<u64, StoreError> {
        self.write_document(path, &body).await.map_err(backend)
    }

    async fn set_if_version(
        &self,
        path: &DocPath,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        if let Some(version) = self
            .compare_and_set(path, &body, expected_version)
            .await
            .map_err(backend)?
        {
            return Ok(version);
        }
        match self.read_document(path).await.map_err(backend)? {
            Some(current) => Err(StoreError::Conflict {
                path: path.clone(),
                expected: expected_version,
                actual: current.version,
            }),
            None => Err(StoreError::NotFound(path.clone())),
        }
    }

    async fn array_union(
        &self,
        path: &DocPath,
        field: &str,
        values: Vec<Value>,
    ) -> Result<u64, StoreError> {
        self.mutate_array(path, field, |items| {
            for value in &values {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
        })
        .await
    }

    async fn array_remove(
        &self,
        path: &DocPath,
        field: &str,
        values: Vec<Value>,
    ) -> Result<u64, StoreError> {
        self.mutate_array(path, field, |items| {
            items.retain(|item| !values.contains(item));
        })
        .await
    }

    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<VersionedDocument>, StoreError> {
        let documents = self.list_collection(collection).await.map_err(backend)?;
        Ok(documents
            .into_iter()
            .filter(|doc| doc.body.get(field) == Some(value))
            .collect())
    }

    fn subscribe(&self, path: &DocPath) -> SnapshotStream {
        let state = SnapshotFeed {
            storage: self.clone(),
            path: path.clone(),
            changes: self.changes.subscribe(),
            primed: false,
            last_version: None,
        };

        futures::stream::unfold(state, |mut feed| async move {
            loop {
                if feed.primed && !feed.wait_for_change().await {
                    return None;
                }
                feed.primed = true;

                match feed.storage.read_document(&feed.path).await {
                    Ok(snapshot) => {
                        let version = snapshot.as_ref().map(|doc| doc.version);
                        if version.is_some() && version == feed.last_version {
                            continue;
                        }
                        feed.last_version = version;
                        return Some((Ok(snapshot), feed));
                    }
                    Err(err) => return Some((Err(backend(err)), feed)),
                }
            }
        })
        .boxed()
    }
}

struct SnapshotFeed {
    storage: Storage,
    path: DocPath,
    changes: broadcast::Receiver<DocPath>,
    primed: bool,
    last_version: Option<u64>,
}

impl SnapshotFeed {
    /// Waits until this feed's document changes. Returns `false` once the
    /// change feed is gone.
    async fn wait_for_change(&mut self) -> bool {
        loop {
            match self.changes.recv().await {
                Ok(changed) if changed == self.path => return true,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(path = %self.path, skipped, "change feed lagged, re-reading");
                    return true;
                }
                Err(RecvError::Closed) => return false,
            }
        }
    }
}

#[async_trait]
impl BlobStore for Storage {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError> {
        let blob_key = self.store_blob(name, &bytes).await.map_err(backend)?;
        Ok(BlobRef(blob_key))
    }

    async fn resolve(&self, blob: &BlobRef) -> Result<String, StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM blobs WHERE blob_key = ?")
            .bind(&blob.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| backend(err.into()))?;
        if exists.is_none() {
            return Err(StoreError::NotFound(DocPath::new("blobs", blob.0.clone())));
        }
        // The whole key is one escaped path segment.
        let mut url = self.blob_base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                backend(anyhow!(
                    "blob base url {} cannot take a path",
                    self.blob_base_url
                ))
            })?
            .pop_if_empty()
            .push(&blob.0);
        Ok(url.to_string())
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
