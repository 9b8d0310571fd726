//! Snapshots: the committed state of one collection's index.
//!
//! A snapshot holds three parallel arrays: the normalized vectors, the person
//! id of each vector, and the document id of the face record it came from.
//! They travel in a single store record so no reader can observe one updated
//! without the others. Wire format, all values little-endian:
//!
//! ```text
//! [4B magic "FMIX"] [4B version=2] [4B dimension] [4B count]
//! [count x dimension x 4B f32 normalized vectors]
//! [count x 8B i64 person ids]
//! [count x ([4B length] [length bytes UTF-8 face id])]
//! [4B crc32 of every preceding byte]
//! ```
//!
//! Version 1 records (no face id section) still decode, with empty face ids.

use crate::config::MatcherConfig;
use crate::error::{FaceMatchError, Result};
use crate::flat_index::VectorIndex;
use crate::persistence::kv::KvStore;
use std::sync::Arc;
use tracing::debug;

/// Identity label attached to every indexed face.
pub type PersonId = i64;

const SNAPSHOT_MAGIC: [u8; 4] = *b"FMIX";
const SNAPSHOT_VERSION: u32 = 2;
const LEGACY_VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const CRC_SIZE: usize = 4;

/// Immutable committed state of one collection's index.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    index: VectorIndex,
    labels: Vec<PersonId>,
    face_ids: Vec<String>,
}

impl Snapshot {
    /// Assemble a snapshot. Fails with `InconsistentSnapshot` unless there is
    /// exactly one label and one face id per vector.
    pub fn new(index: VectorIndex, labels: Vec<PersonId>, face_ids: Vec<String>) -> Result<Self> {
        if index.len() != labels.len() || labels.len() != face_ids.len() {
            return Err(FaceMatchError::InconsistentSnapshot {
                vectors: index.len(),
                labels: if index.len() != labels.len() {
                    labels.len()
                } else {
                    face_ids.len()
                },
            });
        }
        Ok(Self {
            index,
            labels,
            face_ids,
        })
    }

    /// An empty snapshot for `dimension`-sized vectors.
    pub fn empty(dimension: usize) -> Self {
        Self {
            index: VectorIndex::new(dimension),
            labels: Vec::new(),
            face_ids: Vec::new(),
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn labels(&self) -> &[PersonId] {
        &self.labels
    }

    /// Document id per entry; empty for entries added without one.
    pub fn face_ids(&self) -> &[String] {
        &self.face_ids
    }

    /// Whether an entry for document `face_id` is indexed.
    pub fn contains_face(&self, face_id: &str) -> bool {
        !face_id.is_empty() && self.face_ids.iter().any(|id| id == face_id)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    /// Take the parts apart to build the next snapshot from them.
    pub fn into_parts(self) -> (VectorIndex, Vec<PersonId>, Vec<String>) {
        (self.index, self.labels, self.face_ids)
    }

    /// Encode into the versioned wire format.
    pub fn encode(&self) -> Vec<u8> {
        let floats = self.index.as_slice();
        let ids_len: usize = self.face_ids.iter().map(|id| 4 + id.len()).sum();
        let mut buf = Vec::with_capacity(
            HEADER_SIZE + floats.len() * 4 + self.labels.len() * 8 + ids_len + CRC_SIZE,
        );

        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.dimension() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for &x in floats {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        for &id in &self.labels {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        for face_id in &self.face_ids {
            buf.extend_from_slice(&(face_id.len() as u32).to_le_bytes());
            buf.extend_from_slice(face_id.as_bytes());
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode the wire format, rejecting truncated, corrupt, or foreign data.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + CRC_SIZE {
            return Err(corrupt(format!("{} bytes is shorter than the header", bytes.len())));
        }
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = read_u32(bytes, 4);
        if version != SNAPSHOT_VERSION && version != LEGACY_VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }

        let body_end = bytes.len() - CRC_SIZE;
        let stored_crc = read_u32(bytes, body_end);
        if crc32fast::hash(&bytes[..body_end]) != stored_crc {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let dimension = read_u32(bytes, 8) as usize;
        let count = read_u32(bytes, 12) as usize;
        if dimension == 0 {
            return Err(corrupt("zero dimension".to_string()));
        }

        let vectors_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| corrupt("size overflow".to_string()))?;
        let vectors_end = HEADER_SIZE + vectors_len;
        let labels_end = vectors_end + count * 8;
        if labels_end > body_end {
            return Err(corrupt(format!(
                "{} bytes cannot hold {} vectors of dimension {}",
                bytes.len(),
                count,
                dimension
            )));
        }

        let data: Vec<f32> = bytes[HEADER_SIZE..vectors_end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let labels: Vec<PersonId> = bytes[vectors_end..labels_end]
            .chunks_exact(8)
            .map(|c| PersonId::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        let face_ids = if version == LEGACY_VERSION {
            vec![String::new(); count]
        } else {
            decode_face_ids(&bytes[labels_end..body_end], count)?
        };
        if version == LEGACY_VERSION && labels_end != body_end {
            return Err(corrupt(format!("{} trailing bytes", body_end - labels_end)));
        }

        Snapshot::new(
            VectorIndex::from_normalized(dimension, data)?,
            labels,
            face_ids,
        )
    }
}

/// Parse exactly `count` length-prefixed face ids filling all of `section`.
fn decode_face_ids(section: &[u8], count: usize) -> Result<Vec<String>> {
    let mut face_ids = Vec::with_capacity(count);
    let mut offset = 0;
    for _ in 0..count {
        if offset + 4 > section.len() {
            return Err(corrupt("face id section truncated".to_string()));
        }
        let len = read_u32(section, offset) as usize;
        offset += 4;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= section.len())
            .ok_or_else(|| corrupt("face id section truncated".to_string()))?;
        let face_id = std::str::from_utf8(&section[offset..end])
            .map_err(|_| corrupt("face id is not UTF-8".to_string()))?;
        face_ids.push(face_id.to_string());
        offset = end;
    }
    if offset != section.len() {
        return Err(corrupt(format!("{} trailing bytes", section.len() - offset)));
    }
    Ok(face_ids)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn corrupt(reason: String) -> FaceMatchError {
    FaceMatchError::CorruptSnapshot { reason }
}

/// Loads and commits per-collection snapshots in the shared store.
#[derive(Clone)]
pub struct SnapshotStore {
    kv: Arc<dyn KvStore>,
    config: Arc<MatcherConfig>,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KvStore>, config: Arc<MatcherConfig>) -> Self {
        Self { kv, config }
    }

    /// Check if `collection` has a committed snapshot.
    pub async fn exists(&self, collection: &str) -> Result<bool> {
        Ok(self
            .kv
            .get(&self.config.snapshot_key(collection))
            .await?
            .is_some())
    }

    /// Load the last committed snapshot, or `None` if the collection has none.
    pub async fn load(&self, collection: &str) -> Result<Option<Snapshot>> {
        match self.kv.get(&self.config.snapshot_key(collection)).await? {
            Some(bytes) => Ok(Some(Snapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Commit `snapshot`, replacing the previous one in a single write.
    pub async fn save(&self, collection: &str, snapshot: &Snapshot) -> Result<()> {
        let bytes = snapshot.encode();
        debug!(collection, count = snapshot.len(), bytes = bytes.len(), "saving snapshot");
        self.kv
            .set(&self.config.snapshot_key(collection), &bytes)
            .await
    }

    /// Remove the snapshot. Returns whether one existed.
    pub async fn delete(&self, collection: &str) -> Result<bool> {
        self.kv.delete(&self.config.snapshot_key(collection)).await
    }

    /// Names of all collections with a committed snapshot.
    pub async fn collections(&self) -> Result<Vec<String>> {
        let prefix = self.config.snapshot_prefix();
        Ok(self
            .kv
            .scan_keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::kv::MemoryKv;

    fn sample() -> Snapshot {
        let mut index = VectorIndex::new(3);
        index.add(&[1.0, 2.0, 3.0]).unwrap();
        index.add(&[4.0, 5.0, 6.0]).unwrap();
        Snapshot::new(index, vec![7, -42], vec!["a1".to_string(), String::new()]).unwrap()
    }

    /// Version 1 layout: header, vectors, person ids, crc.
    fn legacy_encode(snapshot: &Snapshot) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"FMIX");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(snapshot.dimension() as u32).to_le_bytes());
        buf.extend_from_slice(&(snapshot.len() as u32).to_le_bytes());
        for &x in snapshot.index().as_slice() {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        for &id in snapshot.labels() {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let mut index = VectorIndex::new(2);
        index.add(&[1.0, 0.0]).unwrap();
        assert!(matches!(
            Snapshot::new(index.clone(), vec![1, 2], vec![String::new(); 2]),
            Err(FaceMatchError::InconsistentSnapshot { vectors: 1, labels: 2 })
        ));
        assert!(matches!(
            Snapshot::new(index, vec![1], Vec::new()),
            Err(FaceMatchError::InconsistentSnapshot { .. })
        ));
    }

    #[test]
    fn test_contains_face_ignores_empty_ids() {
        let snapshot = sample();
        assert!(snapshot.contains_face("a1"));
        assert!(!snapshot.contains_face(""));
        assert!(!snapshot.contains_face("zz"));
    }

    #[test]
    fn test_legacy_version_decodes_without_face_ids() {
        let snapshot = sample();
        let decoded = Snapshot::decode(&legacy_encode(&snapshot)).unwrap();
        assert_eq!(decoded.labels(), snapshot.labels());
        assert_eq!(decoded.index(), snapshot.index());
        assert_eq!(decoded.face_ids(), &[String::new(), String::new()]);
    }

    #[test]
    fn test_encode_layout() {
        let snapshot = sample();
        let bytes = snapshot.encode();
        assert_eq!(&bytes[0..4], b"FMIX");
        assert_eq!(read_u32(&bytes, 8), 3);
        assert_eq!(read_u32(&bytes, 4), 2);
        assert_eq!(read_u32(&bytes, 12), 2);
        assert_eq!(
            bytes.len(),
            HEADER_SIZE + 2 * 3 * 4 + 2 * 8 + (4 + 2) + 4 + CRC_SIZE
        );
        assert_eq!(Snapshot::decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_empty_snapshot_decodes() {
        let bytes = Snapshot::empty(512).encode();
        let decoded = Snapshot::decode(&bytes).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.dimension(), 512);
    }

    #[test]
    fn test_truncated_snapshot_detected() {
        let bytes = sample().encode();
        for cut in [0, 10, HEADER_SIZE, bytes.len() - 1] {
            assert!(matches!(
                Snapshot::decode(&bytes[..cut]),
                Err(FaceMatchError::CorruptSnapshot { .. })
            ));
        }
    }

    #[test]
    fn test_flipped_byte_detected() {
        let mut bytes = sample().encode();
        bytes[HEADER_SIZE + 5] ^= 0x40;
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(FaceMatchError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = sample().encode();
        bytes[4] = 9;
        let err = Snapshot::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[tokio::test]
    async fn test_store_save_load_delete() {
        let store = SnapshotStore::new(Arc::new(MemoryKv::new()), Arc::new(MatcherConfig::default()));
        assert!(!store.exists("lobby").await.unwrap());
        assert!(store.load("lobby").await.unwrap().is_none());

        let snapshot = sample();
        store.save("lobby", &snapshot).await.unwrap();
        assert!(store.exists("lobby").await.unwrap());
        assert_eq!(store.load("lobby").await.unwrap(), Some(snapshot));
        assert_eq!(store.collections().await.unwrap(), vec!["lobby".to_string()]);

        assert!(store.delete("lobby").await.unwrap());
        assert!(!store.exists("lobby").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record_surfaces_on_load() {
        let kv = Arc::new(MemoryKv::new());
        let config = Arc::new(MatcherConfig::default());
        kv.set(&config.snapshot_key("lobby"), b"garbage").await.unwrap();

        let store = SnapshotStore::new(kv, config);
        assert!(matches!(
            store.load("lobby").await,
            Err(FaceMatchError::CorruptSnapshot { .. })
        ));
    }
}
