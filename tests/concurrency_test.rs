//! Concurrent mutations against one collection

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use facematch::{
    Embedding, FaceMatchError, FaceRecord, FaceSource, FaceStore, LeaseLock, Matcher,
    MatcherConfig, MemoryFaceStore, MemoryKv,
};
use futures::stream::{self, BoxStream, StreamExt};

const DIM: usize = 64;

fn one_hot(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i] = 1.0;
    v
}

fn patient_config() -> MatcherConfig {
    MatcherConfig {
        dimension: DIM,
        wait_timeout_ms: 30_000,
        retry_backoff_ms: 2,
        ..MatcherConfig::default()
    }
}

async fn add_concurrently(faces: Arc<MemoryFaceStore>, matcher: Arc<Matcher>, n: usize) {
    let mut handles = Vec::new();
    for i in 0..n {
        let faces = faces.clone();
        let matcher = matcher.clone();
        handles.push(tokio::spawn(async move {
            let v = one_hot(i);
            let face_id = faces
                .insert_face("crowd", FaceRecord::new(i as i64, v.clone()))
                .await
                .unwrap();
            matcher
                .add_face("crowd", &Embedding::new(v), i as i64, &face_id)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_to_existing_collection_lose_nothing() {
    let faces = Arc::new(MemoryFaceStore::new());
    let matcher = Arc::new(
        Matcher::new(patient_config(), Arc::new(MemoryKv::new()), faces.clone()).unwrap(),
    );
    matcher.create_index("crowd").await.unwrap();

    add_concurrently(faces, matcher.clone(), 50).await;

    let snapshot = matcher.load_snapshot("crowd").await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 50);
    assert_eq!(snapshot.index().len(), snapshot.labels().len());

    let mut labels = snapshot.labels().to_vec();
    labels.sort_unstable();
    assert_eq!(labels, (0..50).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_to_absent_collection_lose_nothing() {
    let faces = Arc::new(MemoryFaceStore::new());
    let matcher = Arc::new(
        Matcher::new(patient_config(), Arc::new(MemoryKv::new()), faces.clone()).unwrap(),
    );

    add_concurrently(faces, matcher.clone(), 50).await;

    let stats = matcher.get_index_stats("crowd").await.unwrap();
    assert_eq!(stats.count, 50);
    assert_eq!(stats.labels, 50);
    for i in [0usize, 17, 49] {
        let (score, person_id) = matcher.search("crowd", &Embedding::new(one_hot(i))).await;
        assert_eq!(person_id, i as i64);
        assert!(score > 0.999);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deletes_and_adds_stay_consistent() {
    let faces = Arc::new(MemoryFaceStore::new());
    let matcher = Arc::new(
        Matcher::new(patient_config(), Arc::new(MemoryKv::new()), faces.clone()).unwrap(),
    );
    add_concurrently(faces.clone(), matcher.clone(), 20).await;

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let matcher = matcher.clone();
        handles.push(tokio::spawn(async move {
            matcher.delete_person("crowd", i).await.unwrap()
        }));
    }
    for i in 20..30usize {
        let matcher = matcher.clone();
        let faces = faces.clone();
        handles.push(tokio::spawn(async move {
            let face_id = faces
                .insert_face("crowd", FaceRecord::new(i as i64, one_hot(i)))
                .await
                .unwrap();
            matcher
                .add_face("crowd", &Embedding::new(one_hot(i)), i as i64, &face_id)
                .await
                .unwrap();
            0
        }));
    }
    let mut removed = 0;
    for handle in handles {
        removed += handle.await.unwrap();
    }

    assert_eq!(removed, 10);
    let snapshot = matcher.load_snapshot("crowd").await.unwrap().unwrap();
    let mut labels = snapshot.labels().to_vec();
    labels.sort_unstable();
    assert_eq!(labels, (10..30).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_mutation_times_out_when_lock_is_held() {
    let kv = Arc::new(MemoryKv::new());
    let faces = Arc::new(MemoryFaceStore::new());
    let config = MatcherConfig {
        dimension: DIM,
        wait_timeout_ms: 200,
        retry_backoff_ms: 10,
        ..MatcherConfig::default()
    };
    let lock_key = config.lock_key("crowd");
    let matcher = Matcher::new(config, kv.clone(), faces).unwrap();
    matcher.create_index("crowd").await.unwrap();

    let other = LeaseLock::new(kv.clone(), Duration::from_millis(10));
    let held = other
        .try_acquire(&lock_key, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let started = Instant::now();
    let err = matcher
        .add_face("crowd", &Embedding::new(one_hot(0)), 1, "")
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, FaceMatchError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_millis(700), "waited {:?}", waited);
    assert_eq!(matcher.metrics().lock_timeouts, 1);

    // The committed index is untouched.
    assert_eq!(matcher.get_index_stats("crowd").await.unwrap().count, 0);
    held.release().await.unwrap();
}

#[tokio::test]
async fn test_crashed_holder_is_overtaken_after_lease_expires() {
    let kv = Arc::new(MemoryKv::new());
    let faces = Arc::new(MemoryFaceStore::new());
    let config = MatcherConfig {
        dimension: DIM,
        wait_timeout_ms: 5_000,
        retry_backoff_ms: 10,
        ..MatcherConfig::default()
    };
    let lock_key = config.lock_key("crowd");
    let matcher = Matcher::new(config, kv.clone(), faces.clone()).unwrap();

    // A holder that dies without releasing.
    let other = LeaseLock::new(kv.clone(), Duration::from_millis(10));
    let crashed = other
        .try_acquire(&lock_key, Duration::from_millis(150))
        .await
        .unwrap()
        .unwrap();
    std::mem::forget(crashed);

    let face_id = faces
        .insert_face("crowd", FaceRecord::new(4, one_hot(4)))
        .await
        .unwrap();
    let started = Instant::now();
    matcher
        .add_face("crowd", &Embedding::new(one_hot(4)), 4, &face_id)
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(matcher.search("crowd", &Embedding::new(one_hot(4))).await.1, 4);
}

/// Source whose record stream stalls before yielding anything.
struct SlowSource {
    inner: Arc<MemoryFaceStore>,
    delay: Duration,
}

#[async_trait]
impl FaceSource for SlowSource {
    async fn list_collections(&self) -> facematch::Result<Vec<String>> {
        self.inner.list_collections().await
    }

    fn records(&self, collection: &str) -> BoxStream<'static, facematch::Result<FaceRecord>> {
        let stall = stream::once(tokio::time::sleep(self.delay))
            .filter_map(|_| async { None::<facematch::Result<FaceRecord>> });
        stall.chain(self.inner.records(collection)).boxed()
    }
}

#[tokio::test]
async fn test_commit_is_refused_once_the_lease_is_taken_over() {
    let kv = Arc::new(MemoryKv::new());
    let faces = Arc::new(MemoryFaceStore::new());
    faces
        .insert_face("crowd", FaceRecord::new(1, one_hot(1)))
        .await
        .unwrap();

    let config = MatcherConfig {
        dimension: DIM,
        lease_ttl_ms: 50,
        retry_backoff_ms: 5,
        ..MatcherConfig::default()
    };
    let lock_key = config.lock_key("crowd");
    let source = Arc::new(SlowSource {
        inner: faces,
        delay: Duration::from_millis(300),
    });
    let matcher = Arc::new(Matcher::new(config, kv.clone(), source).unwrap());

    let rebuild = {
        let matcher = matcher.clone();
        tokio::spawn(async move { matcher.update_index("crowd").await })
    };

    // The rebuild outlives its lease and another holder moves in.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let other = LeaseLock::new(kv.clone(), Duration::from_millis(5));
    let taken = other
        .try_acquire(&lock_key, Duration::from_secs(60))
        .await
        .unwrap()
        .expect("an expired lease is free to take");

    let err = rebuild.await.unwrap().unwrap_err();
    assert!(matches!(err, FaceMatchError::LeaseLost { .. }));
    assert!(err.is_retryable());

    assert!(matcher.load_snapshot("crowd").await.unwrap().is_none());
    assert!(taken.is_held().await.unwrap());
    taken.release().await.unwrap();
}
