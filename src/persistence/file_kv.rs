//! Directory-backed key-value store shared by processes on one host.
//!
//! One file per key, holding `bincode(StoredRecord)`. Records are written to
//! a scratch file first and published with a `rename`, so readers never see a
//! torn record and reads need no lock.
//!
//! Every mutation of a key runs under that key's [`FileLock`] in
//! `.locks/`, which makes read-check-replace steps (lease takeover,
//! owner-checked release) atomic across processes. Lock files are never
//! removed.

use crate::error::{FaceMatchError, Result};
use crate::persistence::file_lock::FileLock;
use crate::persistence::kv::KvStore;
use crate::persistence::serialization;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use uuid::Uuid;

const LOCK_DIR: &str = ".locks";

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    expires_at_ms: Option<u64>,
    value: Vec<u8>,
}

impl StoredRecord {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Map a key to a file name: ASCII alphanumerics, `-` and `_` pass through,
/// every other byte becomes `%XX`. Encoded names never start with `.`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn read_record(path: &Path) -> Result<Option<StoredRecord>> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(serialization::from_bincode(&raw)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FaceMatchError::IoError(e)),
    }
}

/// Publish `record` at `path` through a scratch file in the same directory.
fn write_record(path: &Path, record: &StoredRecord) -> Result<()> {
    let bytes = serialization::to_bincode(record)?;
    let scratch = path.with_file_name(format!(".tmp-{}", Uuid::new_v4().simple()));
    let written = std::fs::File::create(&scratch).and_then(|mut file| {
        file.write_all(&bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|_| std::fs::rename(&scratch, path)) {
        let _ = std::fs::remove_file(&scratch);
        return Err(FaceMatchError::IoError(e));
    }
    Ok(())
}

fn remove_record(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FaceMatchError::IoError(e)),
    }
}

/// Key-value store over a directory.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Open (or create) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(LOCK_DIR)).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }

    /// Run `f` on the record path of `key` while holding the key's file lock.
    async fn locked<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path_for(key);
        let lock_path = self.dir.join(LOCK_DIR).join(encode_key(key));
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::exclusive(&lock_path)?;
            f(&path)
        })
        .await
        .map_err(|e| FaceMatchError::Internal(format!("file store task failed: {}", e)))?
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = match fs::read(self.path_for(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FaceMatchError::IoError(e)),
        };
        let record: StoredRecord = serialization::from_bincode(&raw)?;
        Ok(record.is_live(now_ms()).then_some(record.value))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let record = StoredRecord {
            expires_at_ms: None,
            value: value.to_vec(),
        };
        self.locked(key, move |path| write_record(path, &record))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.locked(key, |path| {
            let Some(record) = read_record(path)? else {
                return Ok(false);
            };
            remove_record(path)?;
            Ok(record.is_live(now_ms()))
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let value = value.to_vec();
        self.locked(key, move |path| {
            let now = now_ms();
            if let Some(existing) = read_record(path)? {
                if existing.is_live(now) {
                    return Ok(false);
                }
            }
            write_record(
                path,
                &StoredRecord {
                    expires_at_ms: Some(now + ttl.as_millis() as u64),
                    value,
                },
            )?;
            Ok(true)
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let expected = expected.to_vec();
        self.locked(key, move |path| match read_record(path)? {
            Some(record) if record.is_live(now_ms()) && record.value == expected => {
                remove_record(path)?;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = now_ms();
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = decode_key(name) else { continue };
            if !key.starts_with(prefix) {
                continue;
            }
            let raw = match fs::read(entry.path()).await {
                Ok(raw) => raw,
                // Deleted since the directory was listed.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(FaceMatchError::IoError(e)),
            };
            let record: StoredRecord = serialization::from_bincode(&raw)?;
            if record.is_live(now) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding() {
        let key = "facematch:snapshot:site/7 east";
        let encoded = encode_key(key);
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains(':'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        assert_eq!(decode_key("bad%Z"), None);
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(dir.path().join("kv")).await.unwrap();

        kv.set("a:b", b"one").await.unwrap();
        kv.set("a:b", b"two").await.unwrap();
        assert_eq!(kv.get("a:b").await.unwrap(), Some(b"two".to_vec()));

        assert!(kv.delete("a:b").await.unwrap());
        assert_eq!(kv.get("a:b").await.unwrap(), None);
        assert!(!kv.delete("a:b").await.unwrap());
    }

    #[tokio::test]
    async fn test_two_handles_share_state() {
        let dir = TempDir::new().unwrap();
        let first = FileKv::open(dir.path()).await.unwrap();
        let second = FileKv::open(dir.path()).await.unwrap();

        first.set("shared", b"v").await.unwrap();
        assert_eq!(second.get("shared").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_lease_semantics() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(dir.path()).await.unwrap();

        assert!(kv
            .set_if_absent("lock", b"a", Duration::from_millis(50))
            .await
            .unwrap());
        assert!(!kv
            .set_if_absent("lock", b"b", Duration::from_secs(60))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(kv.get("lock").await.unwrap(), None);
        assert!(kv
            .set_if_absent("lock", b"b", Duration::from_secs(60))
            .await
            .unwrap());

        // The expired owner cannot remove the new owner's record.
        assert!(!kv.delete_if_equals("lock", b"a").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some(b"b".to_vec()));
        assert!(kv.delete_if_equals("lock", b"b").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_skips_scratch_and_expired() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(dir.path()).await.unwrap();

        kv.set("p:one", b"1").await.unwrap();
        kv.set("p:two", b"2").await.unwrap();
        kv.set("q:three", b"3").await.unwrap();
        kv.set_if_absent("p:gone", b"x", Duration::from_millis(1))
            .await
            .unwrap();
        std::fs::write(dir.path().join(".tmp-leftover"), b"junk").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let keys = kv.scan_keys("p:").await.unwrap();
        assert_eq!(keys, vec!["p:one".to_string(), "p:two".to_string()]);
    }

    #[tokio::test]
    async fn test_no_scratch_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(dir.path()).await.unwrap();

        kv.set("k", b"v").await.unwrap();
        kv.set_if_absent("l", b"o", Duration::from_secs(5)).await.unwrap();
        kv.set_if_absent("l", b"p", Duration::from_secs(5)).await.unwrap();
        kv.delete_if_equals("l", b"o").await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with('.') && name != LOCK_DIR
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_lease_has_exactly_one_taker() {
        let dir = TempDir::new().unwrap();

        for round in 0..100 {
            let key = format!("lock:{}", round);
            let seed = FileKv::open(dir.path()).await.unwrap();
            assert!(seed
                .set_if_absent(&key, b"crashed", Duration::from_millis(1))
                .await
                .unwrap());
            tokio::time::sleep(Duration::from_millis(3)).await;

            // Separate handles stand in for separate processes.
            let mut tasks = Vec::new();
            for contender in 0..8u8 {
                let kv = FileKv::open(dir.path()).await.unwrap();
                let key = key.clone();
                tasks.push(tokio::spawn(async move {
                    kv.set_if_absent(&key, &[contender], Duration::from_secs(60))
                        .await
                        .unwrap()
                }));
            }
            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "round {}", round);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stale_release_races_takeover() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(dir.path()).await.unwrap();
        kv.set_if_absent("lock", b"old", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;

        let taker = {
            let kv = kv.clone();
            tokio::spawn(async move {
                kv.set_if_absent("lock", b"new", Duration::from_secs(60))
                    .await
                    .unwrap()
            })
        };
        let stale = kv.delete_if_equals("lock", b"old").await.unwrap();

        assert!(taker.await.unwrap());
        assert!(!stale);
        assert_eq!(kv.get("lock").await.unwrap(), Some(b"new".to_vec()));
    }
}
