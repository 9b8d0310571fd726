//! Exclusive advisory file locks shared by processes on one host.
//!
//! The lock is taken with `flock(LOCK_EX)` on a dedicated lock file and held
//! until the guard is dropped. Each acquisition opens its own descriptor, so
//! two tasks of the same process exclude each other as well. Acquisition
//! blocks: call it from a blocking thread (`spawn_blocking`).

use crate::error::{FaceMatchError, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Held exclusive lock on a lock file; unlocked on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held, creating the file
    /// (and its parent directory) if needed.
    pub fn exclusive(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        lock_exclusive(&file, path)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(FaceMatchError::StorageError(format!(
            "failed to lock {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File, path: &Path) -> Result<()> {
    Err(FaceMatchError::StorageError(format!(
        "cross-process file locks are not supported on this platform ({})",
        path.display()
    )))
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lock_excludes_other_descriptors() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("locks").join("k.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let _lock = FileLock::exclusive(&path).unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_micros(200));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
