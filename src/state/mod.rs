//! State management module for keel.
//!
//! Each environment has its own store holding the last-applied
//! [`StateSnapshot`] and an exclusive lock record. Backends: local files,
//! S3, and an in-memory store.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, KeelError, Result};

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{DEFAULT_LOCK_TTL_SECS, LockInfo, LockWait, acquire_with_policy, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    CycleOperation, CycleRecord, MAX_HISTORY, ModuleState, STATE_VERSION, StateSnapshot,
};

/// Opens the configured store for one environment.
///
/// Relative local paths are resolved against `project_dir`.
///
/// # Errors
///
/// Returns an error if the S3 backend is selected without a bucket.
pub async fn open_store(
    config: &StateConfig,
    environment: &str,
    project_dir: &Path,
) -> Result<Arc<dyn StateStore>> {
    let ttl = Duration::from_secs(config.lock_ttl_secs);

    match config.backend {
        StateBackend::Local => {
            let base = config
                .path
                .as_deref()
                .map_or_else(|| project_dir.join(STATE_DIR), |p| project_dir.join(p));
            Ok(Arc::new(LocalStateStore::new(base, environment).with_lock_ttl(ttl)))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().filter(|b| !b.is_empty()).ok_or_else(|| {
                KeelError::Config(ConfigError::validation(
                    "S3 bucket name is required when using S3 backend",
                    "state.bucket",
                ))
            })?;
            let store = S3StateStore::new(
                bucket,
                config.prefix.as_deref(),
                config.region.as_deref(),
                environment,
            )
            .await;
            Ok(Arc::new(store.with_lock_ttl(ttl)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_local_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StateConfig {
            path: Some(String::from("state")),
            ..StateConfig::default()
        };

        let store = open_store(&config, "prod", dir.path()).await.expect("opens");
        assert_eq!(store.backend_type(), "local");
        assert_eq!(store.environment(), "prod");

        let lock = store.acquire_lock("ci").await.expect("acquire");
        assert_eq!(lock.ttl_secs, DEFAULT_LOCK_TTL_SECS);
        assert!(dir.path().join("state").join("prod").join("state.lock").exists());
    }

    #[tokio::test]
    async fn test_s3_requires_bucket() {
        let config = StateConfig {
            backend: StateBackend::S3,
            ..StateConfig::default()
        };
        let result = open_store(&config, "prod", Path::new(".")).await;
        assert!(matches!(result, Err(KeelError::Config(_))));
    }
}
