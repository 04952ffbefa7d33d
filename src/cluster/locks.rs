//! Per-mount mutual exclusion
//!
//! Entries are created on first use. An entry is only reclaimed while no
//! task holds or waits on it, which the strong count of its `Arc` tells us
//! under the table mutex.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct MountLockTable {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MountLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, mount: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(mount.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock of `mount`.
    ///
    /// The guard is dropped on every exit path, including an error returned
    /// by `f` and cancellation of the returned future.
    pub async fn with_lock<F, Fut, T>(&self, mount: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.entry(mount);
        let _guard = lock.lock().await;
        f().await
    }

    /// Drop the entry of `mount` if nobody holds or awaits it.
    /// Returns whether it was removed.
    pub fn reclaim(&self, mount: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        match locks.get(mount) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(mount);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_mount_is_serialized() {
        let table = Arc::new(MountLockTable::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                table
                    .with_lock("/app", || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_mounts_run_in_parallel() {
        let table = Arc::new(MountLockTable::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        // Holds /a until /b has run; deadlocks if /b had to wait for /a.
        let holder = {
            let table = table.clone();
            tokio::spawn(async move { table.with_lock("/a", || async { rx.await.is_ok() }).await })
        };
        table.with_lock("/b", || async { tx.send(()).ok() }).await;
        assert!(holder.await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_released_on_error() {
        let table = MountLockTable::new();
        let failed: Result<(), &str> = table.with_lock("/a", || async { Err("boom") }).await;
        assert!(failed.is_err());
        let ok: Result<u8, &str> = table.with_lock("/a", || async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
    }

    #[tokio::test]
    async fn test_reclaim_only_when_uncontested() {
        let table = Arc::new(MountLockTable::new());
        table.with_lock("/a", || async {}).await;
        assert_eq!(table.len(), 1);

        let inner = table.clone();
        let contested = table
            .with_lock("/a", || async move { inner.reclaim("/a") })
            .await;
        assert!(!contested);
        assert!(table.reclaim("/a"));
        assert!(table.is_empty());
    }
}
