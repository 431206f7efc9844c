//! Cross-process advisory locks
//!
//! One lock file per resource under the lock directory. Exclusion works
//! across workers and processes that share the directory. A lock whose file
//! mtime is older than the stale threshold is presumed orphaned and reaped
//! on contention.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to acquire lock for '{resource}' within {elapsed:.1}s")]
    Timeout { resource: String, elapsed: f64 },
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held exclusive lock; released (and the file removed) on drop.
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
            }
            drop(file);
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove lock file {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

/// Filesystem-backed lock manager
#[derive(Debug, Clone)]
pub struct DistributedLockManager {
    lock_dir: PathBuf,
    timeout: Duration,
    stale_timeout: Duration,
}

impl DistributedLockManager {
    pub fn new(
        lock_dir: impl Into<PathBuf>,
        timeout_secs: f64,
        stale_timeout_secs: f64,
    ) -> std::io::Result<Self> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_dir,
            timeout: Duration::from_secs_f64(timeout_secs),
            stale_timeout: Duration::from_secs_f64(stale_timeout_secs),
        })
    }

    fn lock_path(&self, resource_id: &str) -> PathBuf {
        let safe_id: String = resource_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.lock_dir.join(format!("{}.lock", safe_id))
    }

    fn is_stale(&self, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        match mtime.elapsed() {
            Ok(age) if age > self.stale_timeout => {
                tracing::warn!(
                    "Stale lock detected: {} (age {:.1}s, threshold {:.1}s)",
                    path.display(),
                    age.as_secs_f64(),
                    self.stale_timeout.as_secs_f64()
                );
                true
            }
            _ => false,
        }
    }

    fn force_remove(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => tracing::info!("Removed stale lock: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove stale lock {}: {}", path.display(), e),
        }
    }

    fn try_acquire_sync(path: &Path) -> std::io::Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()?;

        // Holder stamp keeps mtime fresh for the staleness check
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        file.set_len(0)?;
        let _ = write!(file, "{}", stamp);
        let _ = file.sync_all();
        Ok(file)
    }

    /// Acquire an exclusive lock on a resource, waiting up to the configured
    /// timeout. Stale locks encountered while waiting are removed.
    pub async fn acquire(&self, resource_id: &str) -> Result<LockGuard, LockError> {
        let path = self.lock_path(resource_id);
        let start = Instant::now();

        loop {
            if start.elapsed() >= self.timeout {
                return Err(LockError::Timeout {
                    resource: resource_id.to_string(),
                    elapsed: start.elapsed().as_secs_f64(),
                });
            }

            if self.is_stale(&path) {
                self.force_remove(&path);
            }

            let attempt_path = path.clone();
            let acquired = tokio::task::spawn_blocking(move || Self::try_acquire_sync(&attempt_path))
                .await
                .map_err(|e| LockError::Io(std::io::Error::other(e)))?;

            match acquired {
                Ok(file) => {
                    tracing::debug!("Acquired lock for '{}'", resource_id);
                    return Ok(LockGuard {
                        file: Some(file),
                        path,
                    });
                }
                // Jittered retry so contending workers don't poll in step
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(50 + fastrand::u64(..100))).await
                }
            }
        }
    }

    /// Remove every stale lock file in the directory. Returns the count.
    pub fn cleanup_stale_locks(&self) -> usize {
        let mut cleaned = 0;
        let Ok(entries) = fs::read_dir(&self.lock_dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("lock") && self.is_stale(&path) {
                self.force_remove(&path);
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::info!("Cleaned up {} stale lock files", cleaned);
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DistributedLockManager::new(dir.path(), 5.0, 300.0).unwrap();

        let guard = manager.acquire("token_refresh_acc1").await.unwrap();
        let lock_file = dir.path().join("token_refresh_acc1.lock");
        assert!(lock_file.exists());

        drop(guard);
        assert!(!lock_file.exists());
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DistributedLockManager::new(dir.path(), 0.4, 300.0).unwrap();

        let _held = manager.acquire("res").await.unwrap();
        let result = manager.acquire("res").await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_sequential_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DistributedLockManager::new(dir.path(), 5.0, 300.0).unwrap();

        drop(manager.acquire("res").await.unwrap());
        drop(manager.acquire("res").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_lock_reaped() {
        let dir = tempfile::tempdir().unwrap();
        // stale threshold of zero makes any existing file stale
        let manager = DistributedLockManager::new(dir.path(), 2.0, 0.0).unwrap();

        let stale_path = dir.path().join("res.lock");
        fs::write(&stale_path, "0").unwrap();

        let guard = manager.acquire("res").await.unwrap();
        drop(guard);
    }

    #[test]
    fn test_resource_id_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DistributedLockManager::new(dir.path(), 1.0, 300.0).unwrap();
        let path = manager.lock_path("token_refresh_a/b:c");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "token_refresh_a_b_c.lock");
    }

    #[test]
    fn test_cleanup_counts_only_stale() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DistributedLockManager::new(dir.path(), 1.0, 0.0).unwrap();
        fs::write(dir.path().join("a.lock"), "0").unwrap();
        fs::write(dir.path().join("b.lock"), "0").unwrap();
        fs::write(dir.path().join("not-a-lock.txt"), "0").unwrap();
        assert_eq!(manager.cleanup_stale_locks(), 2);
    }
}
