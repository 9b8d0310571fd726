//! Matcher: the per-collection face index cache.
//!
//! Every collection's index lives as one committed [`Snapshot`] in a store
//! shared by all service instances. Mutations take the collection's lease,
//! load the committed snapshot, build a new one, and commit it in a single
//! write; the stored snapshot is never modified in place, so a failure at any
//! step leaves the previous commit intact. Searches take no lock and read
//! whatever was committed last, which may trail a write in flight.
//!
//! The document store is the source of truth. An index can always be rebuilt
//! from it, and deletions are rebuilds: the flat index has no removal. Every
//! entry remembers the document id of its face record, so incremental adds
//! and deletes reach the same state a rebuild would.

use crate::config::MatcherConfig;
use crate::embedding::Embedding;
use crate::error::{FaceMatchError, Result};
use crate::flat_index::VectorIndex;
use crate::lock::{LeaseFence, LeaseLock};
use crate::metrics::{MetricsCollector, MetricsReport};
use crate::persistence::{KvStore, PersonId, Snapshot, SnapshotStore};
use crate::pool::ComputePool;
use crate::source::{FaceRecord, FaceSource};
use futures::TryStreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result reported when a collection is missing, empty, or the search failed.
pub const NO_MATCH: (f32, PersonId) = (0.0, 0);

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    /// Insertion position inside the committed snapshot.
    pub position: usize,
    pub person_id: PersonId,
    /// Document id of the face record, when the entry has one.
    pub face_id: Option<String>,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Diagnostic view of a committed index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub labels: usize,
    pub dimension: usize,
}

/// Face index cache over a shared store and a source of face records.
pub struct Matcher {
    config: Arc<MatcherConfig>,
    snapshots: SnapshotStore,
    locks: LeaseLock,
    source: Arc<dyn FaceSource>,
    pool: ComputePool,
    metrics: RwLock<MetricsCollector>,
}

impl Matcher {
    /// Create a matcher. Several matchers over the same store coordinate
    /// through it exactly like separate service processes.
    pub fn new(
        config: MatcherConfig,
        kv: Arc<dyn KvStore>,
        source: Arc<dyn FaceSource>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            snapshots: SnapshotStore::new(Arc::clone(&kv), Arc::clone(&config)),
            locks: LeaseLock::new(kv, config.retry_backoff()),
            pool: ComputePool::new(config.worker_pool_size),
            source,
            metrics: RwLock::new(MetricsCollector::new()),
            config,
        })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Snapshot of the runtime metrics.
    pub fn metrics(&self) -> MetricsReport {
        self.metrics
            .read()
            .map(|m| m.report())
            .unwrap_or_else(|_| MetricsCollector::new().report())
    }

    fn record(&self, f: impl FnOnce(&mut MetricsCollector)) {
        if let Ok(mut metrics) = self.metrics.write() {
            f(&mut metrics);
        }
    }

    /// Run `f` while holding the collection's lease. The lease is released
    /// whether `f` succeeds or fails; if this future is dropped or `f`
    /// panics, the guard releases it in the background.
    ///
    /// `f` must commit through `commit`, which refuses to write
    /// once the lease is no longer held. A holder that stalls between that
    /// check and the write itself can still commit after its lease ran out;
    /// `lease_ttl` must comfortably exceed the longest rebuild.
    async fn with_lock<T, F, Fut>(&self, collection: &str, f: F) -> Result<T>
    where
        F: FnOnce(LeaseFence) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self
            .locks
            .acquire(
                &self.config.lock_key(collection),
                self.config.lease_ttl(),
                self.config.wait_timeout(),
            )
            .await?;
        let Some(guard) = guard else {
            warn!(collection, "timed out waiting for collection lock");
            self.record(|m| m.record_lock_timeout());
            return Err(FaceMatchError::LockTimeout {
                collection: collection.to_string(),
                waited: self.config.wait_timeout(),
            });
        };

        let result = f(guard.fence()).await;
        if let Err(e) = guard.release().await {
            warn!(collection, error = %e, "failed to release collection lock");
        }
        result
    }

    /// Write `snapshot` as the committed state of `collection`, provided the
    /// lease behind `fence` is still held.
    async fn commit(&self, fence: &LeaseFence, collection: &str, snapshot: &Snapshot) -> Result<()> {
        if !fence.is_held().await? {
            warn!(collection, "lease lost before commit; discarding the new snapshot");
            return Err(FaceMatchError::LeaseLost {
                collection: collection.to_string(),
            });
        }
        self.snapshots.save(collection, snapshot).await
    }

    /// Read every record of `collection` from the source and build a fresh snapshot.
    async fn build_from_source(&self, collection: &str) -> Result<Snapshot> {
        let records: Vec<FaceRecord> = self.source.records(collection).try_collect().await?;
        let dimension = self.config.dimension;
        let name = collection.to_string();
        let (snapshot, skipped) = self
            .pool
            .run(move || build_snapshot(&name, dimension, records))
            .await??;

        self.record(|m| m.record_rebuild(skipped));
        info!(collection, count = snapshot.len(), skipped, "built index from source");
        Ok(snapshot)
    }

    /// Build and commit the index of `collection` unless it already exists.
    /// Returns whether this call built it.
    pub async fn create_index(&self, collection: &str) -> Result<bool> {
        if self.snapshots.exists(collection).await? {
            return Ok(false);
        }
        self.with_lock(collection, |fence| async move {
            // Someone may have built it while we waited for the lock.
            if self.snapshots.exists(collection).await? {
                debug!(collection, "index was created concurrently");
                return Ok(false);
            }
            let snapshot = self.build_from_source(collection).await?;
            self.commit(&fence, collection, &snapshot).await?;
            Ok(true)
        })
        .await
    }

    /// Register the face record `face_id`. The caller must have persisted the
    /// record in the document store first; an absent index is built from the
    /// source and will already contain it. A record whose id is already
    /// indexed is not added again, so a retried or raced add is a no-op. An
    /// empty `face_id` marks an entry with no backing document; such entries
    /// are always appended.
    pub async fn add_face(
        &self,
        collection: &str,
        embedding: &Embedding,
        person_id: PersonId,
        face_id: &str,
    ) -> Result<()> {
        embedding.check_dimension(self.config.dimension)?;
        embedding.normalized()?;
        // Appended raw so the entry matches what a rebuild from the record gives.
        let embedding = embedding.clone();

        if !self.snapshots.exists(collection).await? {
            self.create_index(collection).await?;
        }

        let face_id = face_id.to_string();
        self.with_lock(collection, |fence| async move {
            let snapshot = match self.snapshots.load(collection).await? {
                Some(snapshot) => snapshot,
                // Deleted between the create and the lock.
                None => self.build_from_source(collection).await?,
            };
            let next = self
                .pool
                .run(move || append_face(snapshot, &embedding, person_id, face_id))
                .await??;

            match next {
                Some(next) => {
                    self.commit(&fence, collection, &next).await?;
                    self.record(|m| m.record_add());
                    debug!(collection, person_id, count = next.len(), "face added");
                }
                None => debug!(collection, person_id, "face already indexed"),
            }
            Ok(())
        })
        .await
    }

    /// Remove every entry of `person_id`. Returns how many were removed.
    pub async fn delete_person(&self, collection: &str, person_id: PersonId) -> Result<usize> {
        self.remove_where(collection, move |label, _| label == person_id)
            .await
    }

    /// Remove the entry of face record `face_id`, leaving the person's other
    /// faces indexed. Returns whether an entry was removed.
    pub async fn delete_face(&self, collection: &str, face_id: &str) -> Result<bool> {
        if face_id.is_empty() {
            return Ok(false);
        }
        let target = face_id.to_string();
        let removed = self
            .remove_where(collection, move |_, id| id == target)
            .await?;
        Ok(removed > 0)
    }

    async fn remove_where<P>(&self, collection: &str, predicate: P) -> Result<usize>
    where
        P: Fn(PersonId, &str) -> bool + Send + 'static,
    {
        self.with_lock(collection, |fence| async move {
            let Some(snapshot) = self.snapshots.load(collection).await? else {
                return Ok(0);
            };
            let (next, removed) = self
                .pool
                .run(move || rebuild_without(snapshot, predicate))
                .await??;

            if removed > 0 {
                self.commit(&fence, collection, &next).await?;
                self.record(|m| m.record_delete());
                info!(collection, removed, count = next.len(), "entries removed");
            }
            Ok(removed)
        })
        .await
    }

    /// Best match for `embedding`: `(cosine score, person_id)`, or
    /// [`NO_MATCH`] when the collection is absent or empty. Failures degrade
    /// to [`NO_MATCH`] as well and are logged.
    pub async fn search(&self, collection: &str, embedding: &Embedding) -> (f32, PersonId) {
        match self.search_top_k(collection, embedding, 1).await {
            Ok(matches) => matches
                .first()
                .map(|m| (m.score, m.person_id))
                .unwrap_or(NO_MATCH),
            Err(e) => {
                warn!(collection, error = %e, "search degraded to no match");
                NO_MATCH
            }
        }
    }

    /// Up to `k` best matches, best first. Reads the last committed snapshot
    /// without locking.
    pub async fn search_top_k(
        &self,
        collection: &str,
        embedding: &Embedding,
        k: usize,
    ) -> Result<Vec<Match>> {
        let started = Instant::now();
        embedding.check_dimension(self.config.dimension)?;

        let Some(snapshot) = self.snapshots.load(collection).await? else {
            return Ok(Vec::new());
        };
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query = embedding.as_slice().to_vec();
        let matches = self
            .pool
            .run(move || -> Result<Vec<Match>> {
                let hits = snapshot.index().search(&query, k)?;
                Ok(hits
                    .into_iter()
                    .map(|(position, score)| {
                        let face_id = &snapshot.face_ids()[position];
                        Match {
                            position,
                            person_id: snapshot.labels()[position],
                            face_id: (!face_id.is_empty()).then(|| face_id.clone()),
                            score,
                        }
                    })
                    .collect())
            })
            .await??;

        self.record(|m| m.record_search(started.elapsed()));
        Ok(matches)
    }

    /// Rebuild `collection` from the source and commit the result, replacing
    /// any existing index in one write. Used after out-of-band edits to the
    /// document store. Returns the new entry count.
    pub async fn update_index(&self, collection: &str) -> Result<usize> {
        self.with_lock(collection, |fence| async move {
            let snapshot = self.build_from_source(collection).await?;
            self.commit(&fence, collection, &snapshot).await?;
            Ok(snapshot.len())
        })
        .await
    }

    /// Rebuild every collection the source knows. Keeps going past failures
    /// and reports the first one at the end.
    pub async fn update_all(&self) -> Result<usize> {
        let mut rebuilt = 0;
        let mut first_error = None;
        for collection in self.source.list_collections().await? {
            match self.update_index(&collection).await {
                Ok(_) => rebuilt += 1,
                Err(e) => {
                    warn!(collection = %collection, error = %e, "rebuild failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(rebuilt),
        }
    }

    /// Make sure every collection in the source has an index. Failures are
    /// logged and skipped; returns how many collections are ready.
    pub async fn initialize(&self) -> Result<usize> {
        let mut ready = 0;
        for collection in self.source.list_collections().await? {
            match self.create_index(&collection).await {
                Ok(_) => ready += 1,
                Err(e) => warn!(collection = %collection, error = %e, "could not create index"),
            }
        }
        info!(ready, "indexes initialized");
        Ok(ready)
    }

    /// Drop the committed index. Returns whether one existed.
    pub async fn delete_index(&self, collection: &str) -> Result<bool> {
        self.with_lock(collection, |fence| async move {
            if !fence.is_held().await? {
                return Err(FaceMatchError::LeaseLost {
                    collection: collection.to_string(),
                });
            }
            let existed = self.snapshots.delete(collection).await?;
            if existed {
                info!(collection, "index deleted");
            }
            Ok(existed)
        })
        .await
    }

    pub async fn get_index_stats(&self, collection: &str) -> Result<IndexStats> {
        let snapshot = self
            .snapshots
            .load(collection)
            .await?
            .ok_or_else(|| FaceMatchError::NotFound {
                collection: collection.to_string(),
            })?;
        Ok(IndexStats {
            count: snapshot.index().len(),
            labels: snapshot.labels().len(),
            dimension: snapshot.dimension(),
        })
    }

    /// The last committed snapshot of `collection`, if any.
    pub async fn load_snapshot(&self, collection: &str) -> Result<Option<Snapshot>> {
        self.snapshots.load(collection).await
    }

    /// Collections with a committed index.
    pub async fn list_indexes(&self) -> Result<Vec<String>> {
        self.snapshots.collections().await
    }
}

/// Build a snapshot from source records, skipping (and counting) records whose
/// embedding has the wrong dimension or no direction.
fn build_snapshot(
    collection: &str,
    dimension: usize,
    records: Vec<FaceRecord>,
) -> Result<(Snapshot, usize)> {
    let mut index = VectorIndex::with_capacity(dimension, records.len());
    let mut labels = Vec::with_capacity(records.len());
    let mut face_ids = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for record in records {
        match index.add(&record.embedding) {
            Ok(_) => {
                labels.push(record.person_id);
                face_ids.push(record.face_id.unwrap_or_default());
            }
            Err(e @ (FaceMatchError::DimensionMismatch { .. } | FaceMatchError::InvalidVector { .. })) => {
                warn!(
                    collection,
                    person_id = record.person_id,
                    face_id = ?record.face_id,
                    error = %e,
                    "skipping face record"
                );
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok((Snapshot::new(index, labels, face_ids)?, skipped))
}

/// The next snapshot with `embedding` appended, or `None` if record `face_id`
/// is already indexed.
fn append_face(
    snapshot: Snapshot,
    embedding: &Embedding,
    person_id: PersonId,
    face_id: String,
) -> Result<Option<Snapshot>> {
    if snapshot.contains_face(&face_id) {
        return Ok(None);
    }

    let (mut index, mut labels, mut face_ids) = snapshot.into_parts();
    index.add(embedding.as_slice())?;
    labels.push(person_id);
    face_ids.push(face_id);
    Ok(Some(Snapshot::new(index, labels, face_ids)?))
}

/// A new arena holding every entry the predicate does not select. Kept rows
/// are copied as stored, without normalizing them again.
fn rebuild_without<P>(snapshot: Snapshot, predicate: P) -> Result<(Snapshot, usize)>
where
    P: Fn(PersonId, &str) -> bool,
{
    let mut kept_vectors = Vec::with_capacity(snapshot.index().as_slice().len());
    let mut kept_labels = Vec::with_capacity(snapshot.len());
    let mut kept_face_ids = Vec::with_capacity(snapshot.len());
    let mut removed = 0;

    let entries = snapshot
        .index()
        .iter()
        .zip(snapshot.labels())
        .zip(snapshot.face_ids());
    for ((vector, &label), face_id) in entries {
        if predicate(label, face_id) {
            removed += 1;
        } else {
            kept_vectors.extend_from_slice(vector);
            kept_labels.push(label);
            kept_face_ids.push(face_id.clone());
        }
    }

    let index = VectorIndex::from_normalized(snapshot.dimension(), kept_vectors)?;
    Ok((Snapshot::new(index, kept_labels, kept_face_ids)?, removed))
}
