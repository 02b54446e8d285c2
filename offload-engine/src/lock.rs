//! Single-invocation guard stored as a transient host option.
//!
//! The record carries an expiry, so a crashed holder blocks new passes for
//! at most the TTL.

use crate::host::{self, HostStore};
use crate::{OffloadError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const LOCK_OPTION: &str = "offload_task_lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

/// Proof of holding the lock; hand it back to [`TaskLock::release`].
#[derive(Debug)]
pub struct LockGuard {
    owner: String,
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

pub struct TaskLock {
    store: Arc<dyn HostStore>,
    ttl_secs: i64,
}

impl TaskLock {
    pub fn new(store: Arc<dyn HostStore>, ttl_secs: i64) -> Self {
        Self { store, ttl_secs }
    }

    /// Current unexpired holder, if any.
    pub async fn holder(&self, now: i64) -> Result<Option<LockRecord>> {
        let record: Option<LockRecord> = host::load_or_default(self.store.as_ref(), LOCK_OPTION).await?;
        Ok(record.filter(|r| r.expires_at > now))
    }

    /// `None` when another invocation holds an unexpired lock.
    pub async fn try_acquire(&self, now: i64) -> Result<Option<LockGuard>> {
        if let Some(existing) = self.holder(now).await? {
            debug!(owner = %existing.owner, expires_at = existing.expires_at, "Task lock busy");
            return Ok(None);
        }
        let owner = Uuid::new_v4().to_string();
        let record = LockRecord {
            owner: owner.clone(),
            acquired_at: now,
            expires_at: now + self.ttl_secs,
        };
        host::save(self.store.as_ref(), LOCK_OPTION, &record).await?;
        Ok(Some(LockGuard { owner }))
    }

    /// Like [`TaskLock::try_acquire`] but a busy lock is an error.
    pub async fn acquire(&self, now: i64) -> Result<LockGuard> {
        if let Some(guard) = self.try_acquire(now).await? {
            return Ok(guard);
        }
        let owner = self
            .holder(now)
            .await?
            .map(|r| r.owner)
            .unwrap_or_else(|| "unknown".to_string());
        Err(OffloadError::Lock(owner))
    }

    /// Push the expiry out to `now + ttl` while `guard` still owns the record.
    /// Returns `false` when the lock was lost to another invocation.
    pub async fn refresh(&self, guard: &LockGuard, now: i64) -> Result<bool> {
        let record: Option<LockRecord> = host::load_or_default(self.store.as_ref(), LOCK_OPTION).await?;
        let Some(mut record) = record.filter(|r| r.owner == guard.owner) else {
            return Ok(false);
        };
        record.expires_at = now + self.ttl_secs;
        host::save(self.store.as_ref(), LOCK_OPTION, &record).await?;
        Ok(true)
    }

    /// Clear the record if it still belongs to `guard`.
    pub async fn release(&self, guard: LockGuard) -> Result<()> {
        let record: Option<LockRecord> = host::load_or_default(self.store.as_ref(), LOCK_OPTION).await?;
        if record.is_some_and(|r| r.owner == guard.owner) {
            self.store.set_json(LOCK_OPTION, &Value::Null).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    #[tokio::test]
    async fn test_second_acquire_is_refused_until_release() {
        let lock = TaskLock::new(Arc::new(MemoryHost::new()), 600);
        let guard = lock.try_acquire(1_000).await.unwrap().unwrap();
        assert!(lock.try_acquire(1_001).await.unwrap().is_none());

        lock.release(guard).await.unwrap();
        assert!(lock.try_acquire(1_002).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_reports_holder() {
        let lock = TaskLock::new(Arc::new(MemoryHost::new()), 600);
        let guard = lock.acquire(10).await.unwrap();
        match lock.acquire(11).await {
            Err(OffloadError::Lock(owner)) => assert_eq!(owner, guard.owner()),
            other => panic!("expected lock error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let store = Arc::new(MemoryHost::new());
        let lock = TaskLock::new(store.clone(), 600);
        let stale = lock.try_acquire(1_000).await.unwrap().unwrap();

        let fresh = lock.try_acquire(1_600).await.unwrap().unwrap();
        assert_ne!(stale.owner(), fresh.owner());

        // Releasing the stale guard must not drop the new holder.
        lock.release(stale).await.unwrap();
        assert_eq!(lock.holder(1_601).await.unwrap().unwrap().owner, fresh.owner());
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let lock = TaskLock::new(Arc::new(MemoryHost::new()), 600);
        let guard = lock.try_acquire(1_000).await.unwrap().unwrap();

        assert!(lock.refresh(&guard, 1_500).await.unwrap());
        assert!(lock.try_acquire(1_700).await.unwrap().is_none());
        assert_eq!(lock.holder(1_700).await.unwrap().unwrap().expires_at, 2_100);
    }

    #[tokio::test]
    async fn test_refresh_after_takeover_is_refused() {
        let lock = TaskLock::new(Arc::new(MemoryHost::new()), 600);
        let stale = lock.try_acquire(1_000).await.unwrap().unwrap();
        let fresh = lock.try_acquire(1_600).await.unwrap().unwrap();

        assert!(!lock.refresh(&stale, 1_650).await.unwrap());
        assert_eq!(lock.holder(1_650).await.unwrap().unwrap().owner, fresh.owner());
    }
}
