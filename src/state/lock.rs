//! State locking for concurrent access protection.
//!
//! Each environment's store holds at most one live lock. A lock that outlives
//! its expiry is stale: it still blocks acquisition until it is broken
//! explicitly or the caller opted into taking over stale locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{KeelError, Result, StateError};

use super::store::StateStore;

/// Default lock expiry in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Upper bound on a lock lifetime (ten years).
const MAX_LOCK_TTL_SECS: u64 = 315_360_000;

fn expiry_after(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(ttl_secs.min(MAX_LOCK_TTL_SECS)).unwrap_or(0);
    now + chrono::Duration::seconds(secs)
}

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Environment the lock guards.
    pub environment: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// Lifetime granted on acquisition and on every renewal.
    pub ttl_secs: u64,
}

/// How long to wait for a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    /// Fail immediately with `LockHeld`.
    #[default]
    FailFast,
    /// Poll until the lock frees up or the timeout elapses.
    Wait {
        /// Total time to wait.
        timeout: Duration,
        /// Interval between attempts.
        poll: Duration,
    },
}

impl LockInfo {
    /// Creates a new lock for `environment` held by `holder`.
    #[must_use]
    pub fn new(environment: &str, holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl_secs = ttl.as_secs();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            environment: environment.to_string(),
            acquired_at: now,
            expires_at: expiry_after(now, ttl_secs),
            ttl_secs,
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Extends the expiry by the lock's ttl from now.
    pub fn refresh(&mut self) {
        self.expires_at = expiry_after(Utc::now(), self.ttl_secs);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// The error reported to anyone else trying to acquire this lock.
    #[must_use]
    pub fn held_error(&self) -> StateError {
        StateError::LockHeld {
            environment: self.environment.clone(),
            holder: self.holder.clone(),
            lock_id: self.lock_id.clone(),
            since: self.acquired_at.to_rfc3339(),
            expires_at: self.expires_at.to_rfc3339(),
            stale: self.is_expired(),
        }
    }

    /// The error reported when this lock is no longer held by its owner.
    #[must_use]
    pub fn expired_error(&self) -> StateError {
        StateError::LockExpired {
            environment: self.environment.clone(),
            lock_id: self.lock_id.clone(),
        }
    }

    /// Checks that `current`, as read from storage, is still this lock and live.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockExpired`] otherwise.
    pub fn verify_against(&self, current: Option<&Self>) -> std::result::Result<(), StateError> {
        match current {
            Some(stored) if stored.lock_id == self.lock_id && !stored.is_expired() => Ok(()),
            _ => Err(self.expired_error()),
        }
    }
}

impl LockWait {
    /// Builds a policy from a wait in seconds; zero means fail fast.
    #[must_use]
    pub const fn from_secs(wait_secs: u64) -> Self {
        if wait_secs == 0 {
            Self::FailFast
        } else {
            Self::Wait {
                timeout: Duration::from_secs(wait_secs),
                poll: Duration::from_secs(2),
            }
        }
    }
}

/// Acquires a lock, applying the waiting and stale-takeover policies.
///
/// # Errors
///
/// Returns `LockHeld` if the lock is still held when the policy gives up,
/// or any backend error.
pub async fn acquire_with_policy<S>(
    store: &S,
    holder: &str,
    wait: LockWait,
    take_over_stale: bool,
) -> Result<LockInfo>
where
    S: StateStore + ?Sized,
{
    let started = Instant::now();
    let mut took_over = false;

    loop {
        let err = match store.acquire_lock(holder).await {
            Ok(lock) => return Ok(lock),
            Err(err) => err,
        };

        let KeelError::State(StateError::LockHeld {
            stale,
            holder: ref current_holder,
            ..
        }) = err
        else {
            return Err(err);
        };

        if stale && take_over_stale && !took_over {
            warn!(
                environment = store.environment(),
                previous_holder = %current_holder,
                "Taking over stale lock"
            );
            store.break_lock(false).await?;
            took_over = true;
            continue;
        }

        match wait {
            LockWait::FailFast => return Err(err),
            LockWait::Wait { timeout, poll } => {
                if started.elapsed() + poll > timeout {
                    info!(
                        environment = store.environment(),
                        waited_secs = started.elapsed().as_secs(),
                        "Gave up waiting for lock"
                    );
                    return Err(err);
                }
                debug!(
                    environment = store.environment(),
                    holder = %current_holder,
                    "Lock held, waiting"
                );
                tokio::time::sleep(poll).await;
            }
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("prod", "ci", Duration::from_secs(60));
        assert_eq!(lock.holder, "ci");
        assert_eq!(lock.environment, "prod");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_lock_refresh() {
        let mut lock = LockInfo::new("prod", "ci", Duration::from_secs(60));
        let original_expiry = lock.expires_at;

        std::thread::sleep(Duration::from_millis(10));
        lock.refresh();

        assert!(lock.expires_at > original_expiry);
    }

    #[test]
    fn test_verify_against() {
        let lock = LockInfo::new("prod", "ci", Duration::from_secs(60));
        let other = LockInfo::new("prod", "ci", Duration::from_secs(60));

        assert!(lock.verify_against(Some(&lock)).is_ok());
        assert!(matches!(
            lock.verify_against(Some(&other)),
            Err(StateError::LockExpired { .. })
        ));
        assert!(lock.verify_against(None).is_err());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_wait_policy_from_secs() {
        assert_eq!(LockWait::from_secs(0), LockWait::FailFast);
        assert!(matches!(LockWait::from_secs(30), LockWait::Wait { timeout, .. } if timeout.as_secs() == 30));
    }

    #[tokio::test]
    async fn test_fail_fast_reports_holder() {
        let store = MemoryStateStore::new("prod");
        let _held = store.acquire_lock("first").await.expect("first acquire");

        let err = acquire_with_policy(&store, "second", LockWait::FailFast, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KeelError::State(StateError::LockHeld { ref holder, stale: false, .. }) if holder == "first"
        ));
    }

    #[tokio::test]
    async fn test_wait_until_released() {
        let store = MemoryStateStore::new("prod");
        let held = store.acquire_lock("first").await.expect("first acquire");

        let releaser = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release_lock(&held).await.expect("release");
        });

        let wait = LockWait::Wait {
            timeout: Duration::from_secs(5),
            poll: Duration::from_millis(10),
        };
        let lock = acquire_with_policy(&store, "second", wait, false)
            .await
            .expect("acquired after release");
        assert_eq!(lock.holder, "second");
    }

    #[tokio::test]
    async fn test_stale_lock_requires_opt_in() {
        let store = MemoryStateStore::new("prod").with_lock_ttl(Duration::ZERO);
        let _stale = store.acquire_lock("crashed").await.expect("acquire");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = acquire_with_policy(&store, "next", LockWait::FailFast, false)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::State(StateError::LockHeld { stale: true, .. })));

        let lock = acquire_with_policy(&store, "next", LockWait::FailFast, true)
            .await
            .expect("stale lock taken over");
        assert_eq!(lock.holder, "next");
    }
}
