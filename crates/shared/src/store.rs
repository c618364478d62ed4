use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocPath),
    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    Conflict {
        path: DocPath,
        expected: u64,
        actual: u64,
    },
    #[error("document codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// A document body together with the version token of the write that
/// produced it. Versions start at 1 and increase by one per write.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub id: String,
    pub body: Value,
    pub version: u64,
}

impl VersionedDocument {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Full-document snapshots; `None` while the document does not exist.
pub type SnapshotStream = BoxStream<'static, Result<Option<VersionedDocument>, StoreError>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<VersionedDocument>, StoreError>;

    /// Unconditional whole-document write. Returns the new version.
    async fn set(&self, path: &DocPath, body: Value) -> Result<u64, StoreError>;

    /// Whole-document write that only applies while the stored version
    /// still equals `expected_version`.
    async fn set_if_version(
        &self,
        path: &DocPath,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Appends each value to the array at `field` unless an equal value is
    /// already present. The document must exist.
    async fn array_union(
        &self,
        path: &DocPath,
        field: &str,
        values: Vec<Value>,
    ) -> Result<u64, StoreError>;

    /// Removes every element of the array at `field` equal to one of
    /// `values`. The document must exist.
    async fn array_remove(
        &self,
        path: &DocPath,
        field: &str,
        values: Vec<Value>,
    ) -> Result<u64, StoreError>;

    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<VersionedDocument>, StoreError>;

    /// Delivers the current state immediately, then once per change.
    /// Dropping the stream ends the subscription.
    fn subscribe(&self, path: &DocPath) -> SnapshotStream;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef(pub String);

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError>;
    async fn resolve(&self, blob: &BlobRef) -> Result<String, StoreError>;
}
