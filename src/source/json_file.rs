//! Document store kept in a single JSON file: `{ collection: [record, ...] }`.
//!
//! Writes rewrite the whole file through a temp file and a rename, so a
//! reader always parses a complete document. Each load-modify-save cycle
//! holds an exclusive [`FileLock`] on `<file>.lock`, which serializes writers
//! across processes sharing the file as well as within one.

use crate::error::{FaceMatchError, Result};
use crate::persistence::serialization;
use crate::persistence::{FileLock, PersonId};
use crate::source::{FaceRecord, FaceSource, FaceStore};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

type Collections = BTreeMap<String, Vec<FaceRecord>>;

#[derive(Debug, Clone)]
pub struct JsonFaceStore {
    path: PathBuf,
}

impl JsonFaceStore {
    /// Use `path` as the backing file; it is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn load(path: &Path) -> Result<Collections> {
        match fs::read(path).await {
            Ok(bytes) => parse(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Collections::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load, apply `f`, and write back if `f` reports a change, all under the
    /// file lock.
    async fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Collections) -> (T, bool) + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::exclusive(&lock_path)?;
            let mut collections = match std::fs::read(&path) {
                Ok(bytes) => parse(&bytes)?,
                Err(e) if e.kind() == ErrorKind::NotFound => Collections::new(),
                Err(e) => return Err(e.into()),
            };
            let (result, changed) = f(&mut collections);
            if changed {
                save(&path, &collections)?;
            }
            Ok(result)
        })
        .await
        .map_err(|e| FaceMatchError::Internal(format!("face store task failed: {}", e)))?
    }
}

fn parse(bytes: &[u8]) -> Result<Collections> {
    if bytes.is_empty() {
        return Ok(Collections::new());
    }
    serialization::from_json(bytes)
}

fn save(path: &Path, collections: &Collections) -> Result<()> {
    let bytes = serialization::to_json(collections)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    std::fs::write(&tmp, &bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl FaceSource for JsonFaceStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = Self::load(&self.path).await?;
        Ok(collections
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name)
            .collect())
    }

    fn records(&self, collection: &str) -> BoxStream<'static, Result<FaceRecord>> {
        let path = self.path.clone();
        let collection = collection.to_string();
        stream::once(async move {
            match Self::load(&path).await {
                Ok(mut all) => {
                    let records = all.remove(&collection).unwrap_or_default();
                    stream::iter(records.into_iter().map(Ok)).boxed()
                }
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            }
        })
        .flatten()
        .boxed()
    }
}

#[async_trait]
impl FaceStore for JsonFaceStore {
    async fn insert_face(&self, collection: &str, mut record: FaceRecord) -> Result<String> {
        let face_id = record
            .face_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        record.face_id = Some(face_id.clone());
        let collection = collection.to_string();
        self.modify(move |all| {
            all.entry(collection).or_default().push(record);
            ((), true)
        })
        .await?;
        Ok(face_id)
    }

    async fn delete_person(&self, collection: &str, person_id: PersonId) -> Result<usize> {
        let collection = collection.to_string();
        self.modify(move |all| {
            let Some(records) = all.get_mut(&collection) else {
                return (0, false);
            };
            let before = records.len();
            records.retain(|r| r.person_id != person_id);
            let removed = before - records.len();
            (removed, removed > 0)
        })
        .await
    }

    async fn delete_face(&self, collection: &str, face_id: &str) -> Result<bool> {
        let collection = collection.to_string();
        let face_id = face_id.to_string();
        self.modify(move |all| {
            let Some(records) = all.get_mut(&collection) else {
                return (false, false);
            };
            let before = records.len();
            records.retain(|r| r.face_id.as_deref() != Some(face_id.as_str()));
            let removed = records.len() < before;
            (removed, removed)
        })
        .await
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool> {
        let collection = collection.to_string();
        self.modify(move |all| {
            let existed = all.remove(&collection).is_some();
            (existed, existed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFaceStore::new(dir.path().join("faces.json"));
        assert!(store.list_collections().await.unwrap().is_empty());
        let records: Vec<FaceRecord> = store.records("lobby").try_collect().await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("faces.json");
        {
            let store = JsonFaceStore::new(&path);
            store
                .insert_face("lobby", FaceRecord::new(1, vec![1.0, 0.0]))
                .await
                .unwrap();
            store
                .insert_face("garage", FaceRecord::new(2, vec![0.0, 1.0]))
                .await
                .unwrap();
        }

        let store = JsonFaceStore::new(&path);
        assert_eq!(
            store.list_collections().await.unwrap(),
            vec!["garage".to_string(), "lobby".to_string()]
        );
        let records: Vec<FaceRecord> = store.records("lobby").try_collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].embedding, vec![1.0, 0.0]);
        assert!(records[0].face_id.is_some());
    }

    #[tokio::test]
    async fn test_delete_person_and_face() {
        let dir = TempDir::new().unwrap();
        let store = JsonFaceStore::new(dir.path().join("faces.json"));
        let first = store
            .insert_face("lobby", FaceRecord::new(1, vec![1.0]))
            .await
            .unwrap();
        store
            .insert_face("lobby", FaceRecord::new(2, vec![1.0]))
            .await
            .unwrap();

        assert_eq!(store.delete_person("lobby", 2).await.unwrap(), 1);
        assert_eq!(store.delete_person("lobby", 2).await.unwrap(), 0);
        assert!(store.delete_face("lobby", &first).await.unwrap());
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = JsonFaceStore::new(dir.path().join("faces.json"));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_face("lobby", FaceRecord::new(i, vec![i as f32 + 1.0]))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let records: Vec<FaceRecord> = store.records("lobby").try_collect().await.unwrap();
        assert_eq!(records.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writers_on_separate_handles_do_not_lose_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("faces.json");

        // Each handle stands in for a separate process on the same file.
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = JsonFaceStore::new(&path);
                tokio::spawn(async move {
                    store
                        .insert_face("lobby", FaceRecord::new(i, vec![i as f32 + 1.0]))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let store = JsonFaceStore::new(&path);
        let records: Vec<FaceRecord> = store.records("lobby").try_collect().await.unwrap();
        let mut people: Vec<PersonId> = records.iter().map(|r| r.person_id).collect();
        people.sort_unstable();
        assert_eq!(people, (0..16).collect::<Vec<PersonId>>());
        assert!(store.lock_path().exists());
    }
}
