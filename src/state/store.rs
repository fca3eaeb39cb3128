//! State store trait definition.
//!
//! This module defines the common interface for state storage backends. A
//! store is scoped to a single environment; nothing is shared between the
//! stores of two environments.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::StateSnapshot;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Environment this store belongs to.
    fn environment(&self) -> &str;

    /// Acquires the environment lock.
    ///
    /// Fails immediately with `LockHeld` if any lock record exists, live or
    /// stale. Waiting is a caller policy, see
    /// [`acquire_with_policy`](super::acquire_with_policy).
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends a held lock by its ttl.
    async fn renew_lock(&self, lock: &mut LockInfo) -> Result<()>;

    /// Releases a lock. Releasing a lock that is no longer held is a no-op.
    async fn release_lock(&self, lock: &LockInfo) -> Result<()>;

    /// Removes the current lock record.
    ///
    /// Without `allow_live` only stale locks are removed and a live one is
    /// reported as `LockHeld`. Returns the removed lock, if any.
    async fn break_lock(&self, allow_live: bool) -> Result<Option<LockInfo>>;

    /// Gets the current lock record, live or stale.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Loads the last committed snapshot, or an empty one.
    async fn load_snapshot(&self) -> Result<StateSnapshot>;

    /// Atomically replaces the stored snapshot.
    ///
    /// Fails with `LockExpired` unless `lock` is still the live lock, and
    /// with `SerialConflict` unless the snapshot is newer than the stored one.
    async fn commit_snapshot(&self, snapshot: &StateSnapshot, lock: &LockInfo) -> Result<()>;

    /// Deletes the stored snapshot. Requires the live lock.
    async fn teardown(&self, lock: &LockInfo) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Checks if a live lock is held.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }
}

macro_rules! forward_state_store {
    ($ty:ty) => {
        #[async_trait]
        impl StateStore for $ty {
            fn environment(&self) -> &str {
                (**self).environment()
            }

            async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
                (**self).acquire_lock(holder).await
            }

            async fn renew_lock(&self, lock: &mut LockInfo) -> Result<()> {
                (**self).renew_lock(lock).await
            }

            async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
                (**self).release_lock(lock).await
            }

            async fn break_lock(&self, allow_live: bool) -> Result<Option<LockInfo>> {
                (**self).break_lock(allow_live).await
            }

            async fn lock_info(&self) -> Result<Option<LockInfo>> {
                (**self).lock_info().await
            }

            async fn load_snapshot(&self) -> Result<StateSnapshot> {
                (**self).load_snapshot().await
            }

            async fn commit_snapshot(
                &self,
                snapshot: &StateSnapshot,
                lock: &LockInfo,
            ) -> Result<()> {
                (**self).commit_snapshot(snapshot, lock).await
            }

            async fn teardown(&self, lock: &LockInfo) -> Result<()> {
                (**self).teardown(lock).await
            }

            fn backend_type(&self) -> &'static str {
                (**self).backend_type()
            }
        }
    };
}

forward_state_store!(Box<dyn StateStore>);
forward_state_store!(Arc<dyn StateStore>);
