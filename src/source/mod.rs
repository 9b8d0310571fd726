//! Source-of-truth face documents.
//!
//! The document store owns every face record; indexes are rebuilt from it.
//! [`FaceSource`] is the read side the matcher consumes, [`FaceStore`] adds
//! the writes the service layer performs before touching an index.

pub mod json_file;
pub mod memory;

use crate::error::Result;
use crate::persistence::PersonId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use json_file::JsonFaceStore;
pub use memory::MemoryFaceStore;

/// Free-form descriptive fields stored alongside a face (age, image path, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Metadata {
    fields: HashMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One registered face as kept by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    /// Document id assigned by the store; `None` until inserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_id: Option<String>,
    pub person_id: PersonId,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl FaceRecord {
    pub fn new(person_id: PersonId, embedding: Vec<f32>) -> Self {
        Self {
            face_id: None,
            person_id,
            embedding,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Read access to the canonical face records.
#[async_trait]
pub trait FaceSource: Send + Sync {
    /// Names of all collections holding at least one record.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Lazily yield every record of `collection`. Each call starts a fresh,
    /// finite pass; an unknown collection yields nothing.
    fn records(&self, collection: &str) -> BoxStream<'static, Result<FaceRecord>>;
}

/// Write access used by the service layer. A face must be inserted here
/// before it is registered with the matcher, so a concurrent rebuild from the
/// source cannot miss it.
#[async_trait]
pub trait FaceStore: FaceSource {
    /// Persist a record, returning its new document id.
    async fn insert_face(&self, collection: &str, record: FaceRecord) -> Result<String>;

    /// Delete every record of `person_id`. Returns how many were removed.
    async fn delete_person(&self, collection: &str, person_id: PersonId) -> Result<usize>;

    /// Delete a single record by document id.
    async fn delete_face(&self, collection: &str, face_id: &str) -> Result<bool>;

    /// Drop a whole collection. Returns whether it existed.
    async fn drop_collection(&self, collection: &str) -> Result<bool>;
}
