//! Per-key mutual exclusion.
//!
//! [`KeyLock`] hands out one async mutex per key (a volume name). Entries are
//! created on first use and evicted once nobody holds or waits on them, so
//! the table only grows with the number of volumes that have requests in
//! flight. Locks for different keys never block each other; a key's lock is
//! not reentrant.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

type Entries = DashMap<String, Arc<Mutex<()>>>;

/// The deadline passed before the key became free.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out waiting for exclusive access to {key}")]
pub struct LockTimeout {
    pub key: String,
}

/// Table of per-key locks.
#[derive(Default)]
pub struct KeyLock {
    entries: Arc<Entries>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no one else holds `key`, then hold it until the returned
    /// guard is dropped.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let guard = self.entry(key).lock_owned().await;
        self.guard(key, guard)
    }

    /// Like [`KeyLock::lock`], but give up at `deadline`. `None` waits
    /// forever.
    pub async fn lock_until(
        &self,
        key: &str,
        deadline: Option<Instant>,
    ) -> Result<KeyGuard, LockTimeout> {
        let Some(deadline) = deadline else {
            return Ok(self.lock(key).await);
        };

        // The entry clone lives inside the lock future, so it is gone by the
        // time the timeout fires and eviction can see the true holder count.
        match tokio::time::timeout_at(deadline, self.entry(key).lock_owned()).await {
            Ok(guard) => Ok(self.guard(key, guard)),
            Err(_) => {
                evict_if_idle(&self.entries, key);
                Err(LockTimeout {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Take `key` if it is free right now.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        match self.entry(key).try_lock_owned() {
            Ok(guard) => Some(self.guard(key, guard)),
            Err(_) => {
                evict_if_idle(&self.entries, key);
                None
            }
        }
    }

    /// Whether someone currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.try_lock().is_err())
    }

    /// Number of keys with a live entry (held or waited on).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.entries.entry(key.to_string()).or_default())
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> KeyGuard {
        trace!(key, "key locked");
        KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            entries: Arc::clone(&self.entries),
        }
    }
}

impl fmt::Debug for KeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLock")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Exclusive hold on one key. Released on drop, on every exit path.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    entries: Arc<Entries>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's own Arc no longer counts as a holder.
        drop(self.guard.take());
        evict_if_idle(&self.entries, &self.key);
        trace!(key = %self.key, "key unlocked");
    }
}

/// Remove `key` if the table holds the only reference to its mutex.
///
/// Lockers clone the Arc under the same shard lock `remove_if` takes, so a
/// waiter always keeps the count above one and its entry survives.
fn evict_if_idle(entries: &Entries, key: &str) {
    entries.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn lock_and_release() {
        let locks = KeyLock::new();
        {
            let guard = locks.lock("vol-a").await;
            assert_eq!(guard.key(), "vol-a");
            assert!(locks.is_locked("vol-a"));
            assert_eq!(locks.len(), 1);
        }
        assert!(!locks.is_locked("vol-a"));
        assert!(locks.is_empty(), "idle entries are evicted");
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyLock::new();
        let _a = locks.lock("vol-a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("vol-b")).await;
        assert!(b.is_ok(), "vol-b must not wait on vol-a");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let locks = KeyLock::new();
        let guard = locks.lock("vol-a").await;
        assert!(locks.try_lock("vol-a").is_none());
        assert_eq!(locks.len(), 1, "failed try_lock must not evict the held entry");
        drop(guard);
        assert!(locks.try_lock("vol-a").is_some());
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("vol-a").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn lock_until_times_out_while_held() {
        let locks = KeyLock::new();
        let _guard = locks.lock("vol-a").await;

        let deadline = Instant::now() + Duration::from_millis(10);
        let err = locks.lock_until("vol-a", Some(deadline)).await.unwrap_err();
        assert_eq!(err.key, "vol-a");
        assert_eq!(locks.len(), 1, "holder's entry survives a timed-out waiter");
    }

    #[tokio::test]
    async fn lock_until_succeeds_after_release() {
        let locks = Arc::new(KeyLock::new());
        let guard = locks.lock("vol-a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(5);
                locks.lock_until("vol-a", Some(deadline)).await.map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn lock_until_without_deadline_waits() {
        let locks = KeyLock::new();
        let guard = locks.lock_until("vol-a", None).await.unwrap();
        assert!(locks.is_locked("vol-a"));
        drop(guard);
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_nothing_it_does_not_hold() {
        let locks = Arc::new(KeyLock::new());
        let guard = locks.lock("vol-a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("vol-a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiter.abort();
        let _ = waiter.await;

        assert!(locks.is_locked("vol-a"), "aborting a waiter must not unlock the holder");
        drop(guard);
        assert!(locks.is_empty());
    }
}
