//! S3-based state storage backend.
//!
//! Keys: `<prefix>/<environment>/state.json` and `<prefix>/<environment>/state.lock`.
//! The lock object is written with `If-None-Match: *`, so S3 itself rejects a
//! second writer while a lock object exists. Renewals rewrite it with
//! `If-Match` on the ETag that was verified, so a renewal never lands on a
//! lock someone else acquired in the meantime.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{KeelError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL_SECS, LockInfo};
use super::store::StateStore;
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    /// Key prefix including the environment, always ending in `/`.
    prefix: String,
    environment: String,
    lock_ttl: Duration,
}

/// Precondition attached to a put.
enum PutCondition {
    None,
    /// The key must not exist.
    Absent,
    /// The stored object must still carry this ETag.
    Matches(String),
}

/// Outcome of a conditional put.
enum PutOutcome {
    Written,
    PreconditionFailed,
}

/// An object body with the ETag it was read at.
struct Fetched {
    content: String,
    etag: Option<String>,
}

fn normalize_prefix(prefix: Option<&str>, environment: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}/{environment}/"),
        None => format!("{environment}/"),
    }
}

impl S3StateStore {
    /// Creates a new S3 state store using the default AWS credential chain.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        environment: &str,
    ) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix, environment)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, environment: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix, environment),
            environment: environment.to_string(),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        }
    }

    /// Sets the lifetime of newly acquired locks.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<Fetched>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(String::from);
                let bytes = response.body.collect().await.map_err(|e| {
                    KeelError::State(StateError::backend(format!(
                        "Failed to read S3 object: {e}"
                    )))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    KeelError::State(StateError::corrupted(format!(
                        "Invalid UTF-8 in S3 object: {e}"
                    )))
                })?;

                Ok(Some(Fetched { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(KeelError::State(StateError::backend(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(
        &self,
        key: &str,
        content: Vec<u8>,
        condition: PutCondition,
    ) -> Result<PutOutcome> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json");
        let conditional = match condition {
            PutCondition::None => false,
            PutCondition::Absent => {
                request = request.if_none_match("*");
                true
            }
            PutCondition::Matches(etag) => {
                request = request.if_match(etag);
                true
            }
        };

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(sdk_err) => {
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                // 412 when the precondition does not hold, 409 when a
                // concurrent conditional write won the race.
                if conditional && matches!(status, Some(412 | 409)) {
                    Ok(PutOutcome::PreconditionFailed)
                } else {
                    Err(KeelError::State(StateError::backend(format!(
                        "S3 put error: {sdk_err}"
                    ))))
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| KeelError::State(StateError::backend(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock_tagged().await?.map(|(lock, _)| lock))
    }

    async fn read_lock_tagged(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some(fetched) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_str(&fetched.content).map_err(|e| {
            KeelError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })?;
        Ok(Some((lock, fetched.etag)))
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let Some(fetched) = self.get_object(&self.key(STATE_KEY)).await? else {
            return Ok(None);
        };
        let snapshot: StateSnapshot = serde_json::from_str(&fetched.content).map_err(|e| {
            KeelError::State(StateError::corrupted(format!("Failed to parse state: {e}")))
        })?;
        snapshot.check_version()?;
        Ok(Some(snapshot))
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
impl StateStore for S3StateStore {
    fn environment(&self) -> &str {
        &self.environment
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock = LockInfo::new(&self.environment, holder, self.lock_ttl);
        let content = Self::serialize(&lock, "lock")?;

        match self
            .put_object(&self.key(LOCK_KEY), content, PutCondition::Absent)
            .await?
        {
            PutOutcome::Written => {
                info!(
                    environment = %self.environment,
                    lock_id = %lock.lock_id,
                    "Acquired state lock at s3://{}/{}",
                    self.bucket,
                    self.key(LOCK_KEY)
                );
                Ok(lock)
            }
            PutOutcome::PreconditionFailed => match self.read_lock().await? {
                Some(existing) => Err(KeelError::State(existing.held_error())),
                None => Err(KeelError::State(StateError::LockFailed {
                    message: String::from("Lock object vanished while acquiring, retry"),
                })),
            },
        }
    }

    async fn renew_lock(&self, lock: &mut LockInfo) -> Result<()> {
        let (current, etag) = self.read_lock_tagged().await?.unzip();
        lock.verify_against(current.as_ref())?;
        let Some(etag) = etag.flatten() else {
            return Err(KeelError::State(StateError::backend(
                "S3 returned the lock object without an ETag",
            )));
        };

        let mut renewed = lock.clone();
        renewed.refresh();
        let content = Self::serialize(&renewed, "lock")?;
        let condition = PutCondition::Matches(etag);
        if let PutOutcome::PreconditionFailed =
            self.put_object(&self.key(LOCK_KEY), content, condition).await?
        {
            return Err(KeelError::State(lock.expired_error()));
        }

        *lock = renewed;
        debug!(environment = %self.environment, lock_id = %lock.lock_id, "Renewed state lock");
        Ok(())
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock.lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        let existing = match self.read_lock().await {
            Ok(Some(existing)) => existing,
            Ok(None) => return Ok(None),
            Err(e) if allow_live => {
                info!(environment = %self.environment, "Removing unreadable lock: {e}");
                self.delete_object(&self.key(LOCK_KEY)).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !allow_live && !existing.is_expired() {
            return Err(KeelError::State(existing.held_error()));
        }

        self.delete_object(&self.key(LOCK_KEY)).await?;
        info!(environment = %self.environment, holder = %existing.holder, "Broke state lock");
        Ok(Some(existing))
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn load_snapshot(&self) -> Result<StateSnapshot> {
        debug!("Loading state from s3://{}/{}", self.bucket, self.key(STATE_KEY));
        Ok(self
            .read_snapshot()
            .await?
            .unwrap_or_else(|| StateSnapshot::empty(&self.environment)))
    }

    async fn commit_snapshot(&self, snapshot: &StateSnapshot, lock: &LockInfo) -> Result<()> {
        let current = self.read_lock().await?;
        lock.verify_against(current.as_ref())?;

        let stored = self.read_snapshot().await?.map_or(0, |s| s.serial);
        if snapshot.serial <= stored {
            return Err(KeelError::State(StateError::SerialConflict {
                stored,
                attempted: snapshot.serial,
            }));
        }

        let content = Self::serialize(snapshot, "state")?;
        self.put_object(&self.key(STATE_KEY), content, PutCondition::None)
            .await?;

        info!(
            environment = %self.environment,
            serial = snapshot.serial,
            "Saved state to s3://{}/{}",
            self.bucket,
            self.key(STATE_KEY)
        );
        Ok(())
    }

    async fn teardown(&self, lock: &LockInfo) -> Result<()> {
        let current = self.read_lock().await?;
        lock.verify_against(current.as_ref())?;

        info!("Deleting state from s3://{}/{}", self.bucket, self.key(STATE_KEY));
        self.delete_object(&self.key(STATE_KEY)).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
