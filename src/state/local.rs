//! Local file-based state storage backend.
//!
//! Layout: `<base>/<environment>/state.json` and `<base>/<environment>/state.lock`.
//! The lock file is created exclusively (a fully written temporary file is
//! hard-linked into place) so two processes can never both believe they
//! created it. Renewal claims the lock file by renaming it aside, checks the
//! claimed copy and links the renewed record back the same exclusive way.
//! Snapshots are written to a uniquely named temporary file, synced, then
//! renamed over the previous snapshot.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{KeelError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL_SECS, LockInfo};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".keel";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    environment: String,
    env_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_ttl: Duration,
}

impl LocalStateStore {
    /// Creates a store for `environment` under `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl AsRef<Path>, environment: &str) -> Self {
        let env_dir = base_dir.as_ref().join(environment);
        Self {
            environment: environment.to_string(),
            state_path: env_dir.join(STATE_FILE),
            lock_path: env_dir.join(LOCK_FILE),
            env_dir,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }

    /// Sets the lifetime of newly acquired locks.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.env_dir).await.map_err(|e| {
            KeelError::State(StateError::backend(format!(
                "Failed to create state directory {}: {e}",
                self.env_dir.display()
            )))
        })
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        Self::read_lock_at(&self.lock_path).await
    }

    async fn read_lock_at(path: &Path) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KeelError::State(StateError::corrupted(format!(
                    "Failed to read lock file: {e}"
                ))));
            }
        };

        let lock: LockInfo = serde_json::from_str(&content).map_err(|e| {
            KeelError::State(StateError::corrupted(format!(
                "Failed to parse lock file {}: {e}",
                path.display()
            )))
        })?;

        Ok(Some(lock))
    }

    async fn read_snapshot_file(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KeelError::State(StateError::corrupted(format!(
                    "Failed to read state file: {e}"
                ))));
            }
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            KeelError::State(StateError::corrupted(format!(
                "Failed to parse state file {}: {e}",
                self.state_path.display()
            )))
        })?;
        snapshot.check_version()?;

        Ok(Some(snapshot))
    }

    /// Writes `content` next to `target` and renames it into place.
    async fn write_atomic(&self, target: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let temp_path = self.env_dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, target).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(KeelError::State(StateError::backend(format!(
                "Failed to write {}: {e}",
                target.display()
            ))));
        }
        Ok(())
    }

    /// Writes a full lock record and links it into place.
    ///
    /// Returns `false` if a lock file already exists.
    async fn link_lock(&self, content: &[u8]) -> Result<bool> {
        let temp_path = self.env_dir.join(format!(".{}.lock", Uuid::new_v4().simple()));
        let staged = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(content).await?;
            file.sync_all().await
        };
        if let Err(e) = staged.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(KeelError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            }));
        }

        let linked = fs::hard_link(&temp_path, &self.lock_path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(KeelError::State(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })),
        }
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeelError::State(StateError::LockFailed {
                message: format!("Failed to delete {}: {e}", path.display()),
            })),
        }
    }

    fn serialize<T: serde::Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(value).map_err(|e| {
            KeelError::State(StateError::serialization(format!(
                "Failed to serialize {what}: {e}"
            )))
        })
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    fn environment(&self) -> &str {
        &self.environment
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let lock = LockInfo::new(&self.environment, holder, self.lock_ttl);
        let content = Self::serialize(&lock, "lock")?;

        if !self.link_lock(&content).await? {
            return match self.read_lock_file().await? {
                Some(existing) => Err(KeelError::State(existing.held_error())),
                None => Err(KeelError::State(StateError::LockFailed {
                    message: String::from("Lock file vanished while acquiring, retry"),
                })),
            };
        }

        info!(
            environment = %self.environment,
            lock_id = %lock.lock_id,
            ttl_secs = lock.ttl_secs,
            "Acquired state lock"
        );
        Ok(lock)
    }

    async fn renew_lock(&self, lock: &mut LockInfo) -> Result<()> {
        let current = self.read_lock_file().await?;
        lock.verify_against(current.as_ref())?;

        let mut renewed = lock.clone();
        renewed.refresh();
        let content = Self::serialize(&renewed, "lock")?;

        // Only one renewer, breaker or remover can move the file away.
        let claimed = self.env_dir.join(format!(".{}.renew", Uuid::new_v4().simple()));
        match fs::rename(&self.lock_path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(KeelError::State(lock.expired_error()));
            }
            Err(e) => {
                return Err(KeelError::State(StateError::LockFailed {
                    message: format!("Failed to claim lock file: {e}"),
                }));
            }
        }

        let ours = matches!(
            Self::read_lock_at(&claimed).await,
            Ok(Some(held)) if held.lock_id == lock.lock_id && !held.is_expired()
        );
        if !ours {
            // Put back whatever replaced ours, unless a newer lock took its place.
            let _ = fs::hard_link(&claimed, &self.lock_path).await;
            let _ = fs::remove_file(&claimed).await;
            return Err(KeelError::State(lock.expired_error()));
        }

        let relinked = self.link_lock(&content).await;
        if relinked.is_err() {
            let _ = fs::hard_link(&claimed, &self.lock_path).await;
        }
        let _ = fs::remove_file(&claimed).await;
        if !relinked? {
            return Err(KeelError::State(lock.expired_error()));
        }

        *lock = renewed;
        debug!(environment = %self.environment, lock_id = %lock.lock_id, "Renewed state lock");
        Ok(())
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock.lock_id {
                Self::remove_if_exists(&self.lock_path).await?;
                info!(environment = %self.environment, lock_id = %lock.lock_id, "Released state lock");
            } else {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    lock.lock_id, existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn break_lock(&self, allow_live: bool) -> Result<Option<LockInfo>> {
        let existing = match self.read_lock_file().await {
            Ok(Some(existing)) => existing,
            Ok(None) => return Ok(None),
            Err(e) if allow_live => {
                // An unreadable lock can only be cleared by force.
                info!(environment = %self.environment, "Removing unreadable lock: {e}");
                Self::remove_if_exists(&self.lock_path).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !allow_live && !existing.is_expired() {
            return Err(KeelError::State(existing.held_error()));
        }

        Self::remove_if_exists(&self.lock_path).await?;
        info!(
            environment = %self.environment,
            holder = %existing.holder,
            "Broke state lock"
        );
        Ok(Some(existing))
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn load_snapshot(&self) -> Result<StateSnapshot> {
        match self.read_snapshot_file().await? {
            Some(snapshot) => {
                debug!(
                    environment = %self.environment,
                    serial = snapshot.serial,
                    "Loaded state from {}",
                    self.state_path.display()
                );
                Ok(snapshot)
            }
            None => {
                debug!("State file does not exist: {}", self.state_path.display());
                Ok(StateSnapshot::empty(&self.environment))
            }
        }
    }

    async fn commit_snapshot(&self, snapshot: &StateSnapshot, lock: &LockInfo) -> Result<()> {
        let current = self.read_lock_file().await?;
        lock.verify_against(current.as_ref())?;

        let stored = self.read_snapshot_file().await?.map_or(0, |s| s.serial);
        if snapshot.serial <= stored {
            return Err(KeelError::State(StateError::SerialConflict {
                stored,
                attempted: snapshot.serial,
            }));
        }

        let content = Self::serialize(snapshot, "state")?;
        self.write_atomic(&self.state_path, &content).await?;

        info!(
            environment = %self.environment,
            serial = snapshot.serial,
            "Saved state to {}",
            self.state_path.display()
        );
        Ok(())
    }

    async fn teardown(&self, lock: &LockInfo) -> Result<()> {
        let current = self.read_lock_file().await?;
        lock.verify_against(current.as_ref())?;

        info!("Deleting state file: {}", self.state_path.display());
        match fs::remove_file(&self.state_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeelError::State(StateError::backend(format!(
                "Failed to delete state file: {e}"
            )))),
        }
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
