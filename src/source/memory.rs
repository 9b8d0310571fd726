//! In-memory document store for tests and embedded use.

use crate::error::{FaceMatchError, Result};
use crate::persistence::PersonId;
use crate::source::{FaceRecord, FaceSource, FaceStore};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Collections of face records in insertion order. Clones share data.
#[derive(Debug, Clone, Default)]
pub struct MemoryFaceStore {
    collections: Arc<RwLock<BTreeMap<String, Vec<FaceRecord>>>>,
}

impl MemoryFaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn poisoned<E: std::fmt::Display>(e: E) -> FaceMatchError {
        FaceMatchError::SourceError(e.to_string())
    }
}

#[async_trait]
impl FaceSource for MemoryFaceStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().map_err(Self::poisoned)?;
        Ok(collections
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn records(&self, collection: &str) -> BoxStream<'static, Result<FaceRecord>> {
        let records: Result<Vec<FaceRecord>> = self
            .collections
            .read()
            .map(|c| c.get(collection).cloned().unwrap_or_default())
            .map_err(Self::poisoned);
        match records {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

#[async_trait]
impl FaceStore for MemoryFaceStore {
    async fn insert_face(&self, collection: &str, mut record: FaceRecord) -> Result<String> {
        let face_id = record
            .face_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        record.face_id = Some(face_id.clone());

        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(face_id)
    }

    async fn delete_person(&self, collection: &str, person_id: PersonId) -> Result<usize> {
        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| r.person_id != person_id);
        Ok(before - records.len())
    }

    async fn delete_face(&self, collection: &str, face_id: &str) -> Result<bool> {
        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        let Some(records) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.face_id.as_deref() != Some(face_id));
        Ok(records.len() < before)
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool> {
        let mut collections = self.collections.write().map_err(Self::poisoned)?;
        Ok(collections.remove(collection).is_some())
    }
}
