//! Per-resource operation serialization.
//!
//! The orchestrator is supposed to keep at most one call in flight per
//! volume, but it loses that state when it restarts and may then issue
//! overlapping calls for the same resource.  [`OperationLockManager`] hands
//! out one async mutex per [`OpKey`]: same-key operations queue behind each
//! other, different keys never contend, and a caller that cannot get the key
//! within the configured bound gets [`CsiError::Aborted`] instead of queueing
//! forever.
//!
//! Keys are taken in the order `VolumeNode → Volume → Name` on the controller
//! side and `Volume → Path` on the node side; every caller in this crate
//! follows it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

use crate::error::CsiError;
use crate::types::{NodeId, VolumeId};

/// The resource an operation serializes on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKey {
    /// A volume by id.
    Volume(VolumeId),
    /// A volume by its idempotency name.
    Name(String),
    /// A controller publication.
    VolumeNode(VolumeId, NodeId),
    /// A node-local staging or target path.
    Path(String),
    /// A snapshot by its idempotency name.
    SnapshotName(String),
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Volume(id) => write!(f, "volume {id}"),
            Self::Name(name) => write!(f, "volume name {name}"),
            Self::VolumeNode(id, node) => write!(f, "volume {id} on node {node}"),
            Self::Path(path) => write!(f, "path {path}"),
            Self::SnapshotName(name) => write!(f, "snapshot name {name}"),
        }
    }
}

type LockTable = DashMap<OpKey, Arc<Mutex<()>>>;

/// Hands out per-key guards with a bounded wait.
#[derive(Debug, Clone)]
pub struct OperationLockManager {
    locks: Arc<LockTable>,
    timeout: Duration,
}

/// Holds an [`OpKey`] until dropped.
///
/// The guard is `Send + 'static`, so it can be moved into a detached task
/// that keeps the key locked until a backend mutation finishes.
#[derive(Debug)]
pub struct OpGuard {
    key: OpKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl OpGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &OpKey {
        &self.key
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the mutex, so a count of one means
        // nobody else is interested in this key any more.
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
        trace!(key = %self.key, "operation lock released");
    }
}

impl OperationLockManager {
    /// Create a manager whose `acquire` gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Wait for `key`, failing with [`CsiError::Aborted`] once the configured
    /// bound elapses.
    pub async fn acquire(&self, key: OpKey) -> Result<OpGuard, CsiError> {
        let mutex = self.mutex_for(&key);
        let acquired = tokio::time::timeout(self.timeout, mutex.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                trace!(%key, "operation lock acquired");
                Ok(OpGuard {
                    key,
                    guard: Some(guard),
                    locks: Arc::clone(&self.locks),
                })
            }
            Err(_) => {
                // `lock_owned` consumed our handle and the timed-out future is
                // gone, so only the map and live guards are counted here.
                self.locks
                    .remove_if(&key, |_, m| Arc::strong_count(m) == 1);
                warn!(%key, timeout = ?self.timeout, "gave up waiting for operation lock");
                Err(CsiError::Aborted(format!(
                    "an operation is already in progress for {key}"
                )))
            }
        }
    }

    /// Take `key` only if nobody holds it right now.
    pub fn try_acquire(&self, key: OpKey) -> Result<OpGuard, CsiError> {
        let mutex = self.mutex_for(&key);
        match mutex.try_lock_owned() {
            Ok(guard) => Ok(OpGuard {
                key,
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => Err(CsiError::Aborted(format!(
                "an operation is already in progress for {key}"
            ))),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    fn mutex_for(&self, key: &OpKey) -> Arc<Mutex<()>> {
        let entry = self.locks.entry(key.clone()).or_default();
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vol(id: &str) -> OpKey {
        OpKey::Volume(VolumeId::from(id))
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = OperationLockManager::new(Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(vol("v1")).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = OperationLockManager::new(Duration::from_millis(50));
        let _a = locks.acquire(vol("a")).await.unwrap();
        let _b = locks.acquire(vol("b")).await.unwrap();
        let _c = locks
            .acquire(OpKey::VolumeNode("a".into(), "node-1".into()))
            .await
            .unwrap();
        assert_eq!(locks.in_flight(), 3);
    }

    #[tokio::test]
    async fn busy_key_times_out_with_aborted() {
        let locks = OperationLockManager::new(Duration::from_millis(20));
        let held = locks.acquire(OpKey::Name("pvc-1".into())).await.unwrap();
        let err = locks
            .acquire(OpKey::Name("pvc-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Aborted(_)));
        assert!(matches!(
            locks.try_acquire(OpKey::Name("pvc-1".into())),
            Err(CsiError::Aborted(_))
        ));
        drop(held);
        assert_eq!(locks.in_flight(), 0);
        locks.acquire(OpKey::Name("pvc-1".into())).await.unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_key_after_release() {
        let locks = OperationLockManager::new(Duration::from_secs(1));
        let held = locks.acquire(vol("v")).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(vol("v")).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn timed_out_waiter_releases_its_handle() {
        let locks = OperationLockManager::new(Duration::from_millis(20));
        let held = locks.acquire(vol("v")).await.unwrap();
        let patient = {
            let locks = OperationLockManager {
                timeout: Duration::from_secs(5),
                ..locks.clone()
            };
            tokio::spawn(async move { locks.acquire(vol("v")).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = locks.acquire(vol("v")).await.unwrap_err();
        assert!(matches!(err, CsiError::Aborted(_)));
        // map + held guard + the patient waiter; nothing from the timed-out call
        let refs = locks.locks.get(&vol("v")).map(|m| Arc::strong_count(m.value()));
        assert_eq!(refs, Some(3));

        drop(held);
        patient.await.unwrap().unwrap();
        assert_eq!(locks.in_flight(), 0);
    }
}
