//! In-memory state storage backend.
//!
//! Used by tests and when keel is embedded as a library. Clones share the
//! same underlying state, so several tasks can contend for one environment.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{KeelError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL_SECS, LockInfo};
use super::store::StateStore;
use super::types::StateSnapshot;

#[derive(Debug, Default)]
struct Inner {
    snapshot: Option<StateSnapshot>,
    lock: Option<LockInfo>,
    commits: u64,
}

/// In-memory state store.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    environment: String,
    lock_ttl: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    /// Creates an empty store for an environment.
    #[must_use]
    pub fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Sets the lifetime of newly acquired locks.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Returns the stored snapshot without taking the lock.
    pub async fn stored_snapshot(&self) -> Option<StateSnapshot> {
        self.inner.lock().await.snapshot.clone()
    }

    /// Number of successful commits.
    pub async fn commit_count(&self) -> u64 {
        self.inner.lock().await.commits
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn environment(&self) -> &str {
        &self.environment
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.lock {
            return Err(KeelError::State(existing.held_error()));
        }

        let lock = LockInfo::new(&self.environment, holder, self.lock_ttl);
        inner.lock = Some(lock.clone());
        debug!(environment = %self.environment, lock_id = %lock.lock_id, "Acquired lock");
        Ok(lock)
    }

    async fn renew_lock(&self, lock: &mut LockInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        lock.verify_against(inner.lock.as_ref())?;
        lock.refresh();
        inner.lock = Some(lock.clone());
        Ok(())
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.lock_id == lock.lock_id) {
            inner.lock = None;
            debug!(environment = %self.environment, lock_id = %lock.lock_id, "Released lock");
        }
        Ok(())
    }

    async fn break_lock(&self, allow_live: bool) -> Result<Option<LockInfo>> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.lock
            && !allow_live
            && !existing.is_expired()
        {
            return Err(KeelError::State(existing.held_error()));
        }

        let removed = inner.lock.take();
        if removed.is_some() {
            info!(environment = %self.environment, "Broke state lock");
        }
        Ok(removed)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    async fn load_snapshot(&self) -> Result<StateSnapshot> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshot
            .clone()
            .unwrap_or_else(|| StateSnapshot::empty(&self.environment)))
    }

    async fn commit_snapshot(&self, snapshot: &StateSnapshot, lock: &LockInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        lock.verify_against(inner.lock.as_ref())?;

        let stored = inner.snapshot.as_ref().map_or(0, |s| s.serial);
        if snapshot.serial <= stored {
            return Err(KeelError::State(StateError::SerialConflict {
                stored,
                attempted: snapshot.serial,
            }));
        }

        inner.snapshot = Some(snapshot.clone());
        inner.commits += 1;
        debug!(environment = %self.environment, serial = snapshot.serial, "Committed snapshot");
        Ok(())
    }

    async fn teardown(&self, lock: &LockInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        lock.verify_against(inner.lock.as_ref())?;
        inner.snapshot = None;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
