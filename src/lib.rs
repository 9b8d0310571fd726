//! # facematch
//!
//! Face embedding index cache for a face recognition service.
//!
//! This library provides:
//! - A flat inner-product index over unit-normalized embeddings
//! - Per-collection snapshots in a shared key-value store, committed atomically
//! - Lease-based locks that order mutations across service instances
//! - A [`Matcher`] that keeps each collection's index in step with the
//!   document store holding the canonical face records
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use facematch::{Embedding, FaceRecord, FaceStore, Matcher, MatcherConfig, MemoryFaceStore, MemoryKv};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let faces = Arc::new(MemoryFaceStore::new());
//! let config = MatcherConfig { dimension: 3, ..MatcherConfig::default() };
//! let matcher = Matcher::new(config, Arc::new(MemoryKv::new()), faces.clone()).unwrap();
//!
//! // Persist the face first, then register it with the index.
//! let embedding = Embedding::new(vec![0.1, 0.9, 0.2]);
//! let face_id = faces
//!     .insert_face("lobby", FaceRecord::new(7, embedding.as_slice().to_vec()))
//!     .await
//!     .unwrap();
//! matcher.add_face("lobby", &embedding, 7, &face_id).await.unwrap();
//!
//! let (score, person_id) = matcher.search("lobby", &embedding).await;
//! assert_eq!(person_id, 7);
//! assert!(score > 0.999);
//! # });
//! ```

pub mod config;
pub mod distance;
pub mod embedding;
pub mod error;
pub mod flat_index;
pub mod lock;
pub mod matcher;
pub mod metrics;
pub mod persistence;
pub mod pool;
pub mod server;
pub mod source;

pub use config::MatcherConfig;
pub use embedding::Embedding;
pub use error::{FaceMatchError, Result};
pub use flat_index::VectorIndex;
pub use lock::{LeaseFence, LeaseGuard, LeaseLock};
pub use matcher::{IndexStats, Match, Matcher, NO_MATCH};
pub use persistence::{FileKv, KvStore, MemoryKv, PersonId, Snapshot, SnapshotStore};
pub use source::{FaceRecord, FaceSource, FaceStore, JsonFaceStore, MemoryFaceStore, Metadata};
