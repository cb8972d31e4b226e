//! Partition locks serializing runs for the same month.
//!
//! Two runs reloading the same partition concurrently would interleave their
//! deletes and inserts. A [`PartitionLock`] is taken before any warehouse
//! mutation and released when the run reaches a terminal state.
//!
//! Locks carry a TTL so a crashed holder cannot block a partition forever:
//! an expired lock may be taken over by the next acquirer. A live holder
//! keeps its lock by calling [`PartitionLock::renew`] well inside the TTL.
//!
//! # Example
//!
//! ```rust
//! # tokio_test_block_on(async {
//! use std::time::Duration;
//! use velo_core::lock::{InMemoryPartitionLock, LockAttempt, PartitionLock};
//! use velo_core::partition::PartitionKey;
//!
//! let lock = InMemoryPartitionLock::new();
//! let key = PartitionKey::new(2025, 1).unwrap();
//!
//! let LockAttempt::Acquired(info) = lock
//!     .try_acquire(key, "run-1", "monthly-load", Duration::from_secs(60))
//!     .await
//!     .unwrap()
//! else {
//!     panic!("lock should be free");
//! };
//!
//! // A second holder sees the lock as held.
//! let second = lock
//!     .try_acquire(key, "run-2", "monthly-load", Duration::from_secs(60))
//!     .await
//!     .unwrap();
//! assert!(matches!(second, LockAttempt::Held(_)));
//!
//! lock.release(&info).await.unwrap();
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::partition::PartitionKey;

/// Default lock TTL. Holders renew at a fraction of it for as long as they run.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

/// Lock record contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Partition the lock covers.
    pub partition: PartitionKey,

    /// Identifier of the holder (normally a run ID).
    pub holder_id: String,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// Description of the operation holding the lock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates lock info for `holder_id` expiring after `ttl`.
    #[must_use]
    pub fn new(
        partition: PartitionKey,
        holder_id: impl Into<String>,
        operation: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            partition,
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now + chrono_ttl(ttl),
            operation: Some(operation.into()),
        }
    }

    /// Returns this lock with its expiry pushed `ttl` past now.
    #[must_use]
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Utc::now() + chrono_ttl(ttl),
            ..self.clone()
        }
    }

    /// Returns whether `other` records the same holder of the same partition.
    #[must_use]
    pub fn same_holder(&self, other: &Self) -> bool {
        self.partition == other.partition && self.holder_id == other.holder_id
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns whether this lock has expired as of `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let millis = (self.expires_at - Utc::now()).num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(2))
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The caller now holds the lock.
    Acquired(LockInfo),
    /// Another holder has a live lock on the partition.
    Held(LockInfo),
}

/// Mutual exclusion over monthly partitions.
#[async_trait]
pub trait PartitionLock: Send + Sync {
    /// Attempts to acquire the lock for `partition` once, without waiting.
    ///
    /// An expired lock held by someone else is taken over.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read or written.
    async fn try_acquire(
        &self,
        partition: PartitionKey,
        holder_id: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<LockAttempt>;

    /// Extends a held lock to expire `ttl` from now.
    ///
    /// Returns `None` if `lock`'s holder no longer owns the partition,
    /// because the lock was released or taken over after expiring.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read or written.
    async fn renew(&self, lock: &LockInfo, ttl: Duration) -> Result<Option<LockInfo>>;

    /// Releases a lock previously returned by [`PartitionLock::try_acquire`].
    ///
    /// Releasing a lock that has since been taken over by another holder is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read or removed.
    async fn release(&self, lock: &LockInfo) -> Result<()>;

    /// Returns the current lock on `partition`, if any (expired or not).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    async fn inspect(&self, partition: PartitionKey) -> Result<Option<LockInfo>>;
}

/// Process-local partition lock.
#[derive(Debug, Default)]
pub struct InMemoryPartitionLock {
    locks: Mutex<HashMap<PartitionKey, LockInfo>>,
}

impl InMemoryPartitionLock {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PartitionKey, LockInfo>>> {
        self.locks
            .lock()
            .map_err(|_| Error::storage("partition lock table poisoned"))
    }
}

#[async_trait]
impl PartitionLock for InMemoryPartitionLock {
    async fn try_acquire(
        &self,
        partition: PartitionKey,
        holder_id: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        let mut locks = self.locks()?;
        if let Some(existing) = locks.get(&partition) {
            if !existing.is_expired() {
                return Ok(LockAttempt::Held(existing.clone()));
            }
            tracing::warn!(
                partition = %partition,
                previous_holder = %existing.holder_id,
                "taking over expired partition lock"
            );
        }
        let info = LockInfo::new(partition, holder_id, operation, ttl);
        locks.insert(partition, info.clone());
        Ok(LockAttempt::Acquired(info))
    }

    async fn renew(&self, lock: &LockInfo, ttl: Duration) -> Result<Option<LockInfo>> {
        let mut locks = self.locks()?;
        match locks.get_mut(&lock.partition) {
            Some(current) if current.same_holder(lock) => {
                *current = current.renewed(ttl);
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lock: &LockInfo) -> Result<()> {
        let mut locks = self.locks()?;
        if locks
            .get(&lock.partition)
            .is_some_and(|current| current.holder_id == lock.holder_id)
        {
            locks.remove(&lock.partition);
        }
        Ok(())
    }

    async fn inspect(&self, partition: PartitionKey) -> Result<Option<LockInfo>> {
        Ok(self.locks()?.get(&partition).cloned())
    }
}

/// Lock files on a shared filesystem.
///
/// Each partition maps to `{dir}/{YYYY-MM}.lock`, created with exclusive
/// create so only one acquirer can succeed. The file body is the JSON
/// [`LockInfo`].
#[derive(Debug, Clone)]
pub struct FilePartitionLock {
    dir: PathBuf,
}

impl FilePartitionLock {
    /// Creates a file lock rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the lock directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, partition: PartitionKey) -> PathBuf {
        self.dir.join(format!("{partition}.lock"))
    }

    async fn read(&self, path: &Path) -> Result<Option<LockInfo>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read lock file {}", path.display()),
                e,
            )),
        }
    }

    async fn create(&self, path: &Path, info: &LockInfo) -> Result<bool> {
        let body = serde_json::to_vec_pretty(info)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(Error::storage_with_source(
                    format!("failed to create lock file {}", path.display()),
                    e,
                ));
            }
        };
        file.write_all(&body).await.map_err(|e| {
            Error::storage_with_source(format!("failed to write lock file {}", path.display()), e)
        })?;
        file.sync_all().await.map_err(|e| {
            Error::storage_with_source(format!("failed to sync lock file {}", path.display()), e)
        })?;
        Ok(true)
    }

    /// Overwrites the lock body through a rename so readers never see a
    /// partial record.
    async fn replace(&self, path: &Path, info: &LockInfo) -> Result<()> {
        let body = serde_json::to_vec_pretty(info)?;
        let staging = path.with_extension(format!("{}.renew", info.holder_id));
        tokio::fs::write(&staging, &body).await.map_err(|e| {
            Error::storage_with_source(format!("failed to write {}", staging.display()), e)
        })?;
        tokio::fs::rename(&staging, path).await.map_err(|e| {
            Error::storage_with_source(format!("failed to replace lock file {}", path.display()), e)
        })
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to remove lock file {}", path.display()),
                e,
            )),
        }
    }
}

#[async_trait]
impl PartitionLock for FilePartitionLock {
    async fn try_acquire(
        &self,
        partition: PartitionKey,
        holder_id: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::storage_with_source(
                format!("failed to create lock directory {}", self.dir.display()),
                e,
            )
        })?;

        let path = self.path_for(partition);
        let info = LockInfo::new(partition, holder_id, operation, ttl);
        if self.create(&path, &info).await? {
            return Ok(LockAttempt::Acquired(info));
        }

        let Some(existing) = self.read(&path).await? else {
            // Released between our create and read; one more exclusive attempt.
            return if self.create(&path, &info).await? {
                Ok(LockAttempt::Acquired(info))
            } else {
                Ok(LockAttempt::Held(self.read(&path).await?.unwrap_or(info)))
            };
        };
        if !existing.is_expired() {
            return Ok(LockAttempt::Held(existing));
        }

        tracing::warn!(
            partition = %partition,
            previous_holder = %existing.holder_id,
            expired_at = %existing.expires_at,
            "taking over expired partition lock"
        );
        // Only remove the record we judged expired; a fresh holder keeps theirs.
        if self
            .read(&path)
            .await?
            .is_some_and(|current| current == existing)
        {
            self.remove(&path).await?;
        }
        if self.create(&path, &info).await? {
            Ok(LockAttempt::Acquired(info))
        } else {
            let current = self.read(&path).await?.unwrap_or(existing);
            Ok(LockAttempt::Held(current))
        }
    }

    async fn renew(&self, lock: &LockInfo, ttl: Duration) -> Result<Option<LockInfo>> {
        let path = self.path_for(lock.partition);
        match self.read(&path).await? {
            Some(current) if current.same_holder(lock) => {
                let renewed = current.renewed(ttl);
                self.replace(&path, &renewed).await?;
                Ok(Some(renewed))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lock: &LockInfo) -> Result<()> {
        let path = self.path_for(lock.partition);
        match self.read(&path).await? {
            Some(current) if current.holder_id == lock.holder_id => self.remove(&path).await,
            _ => Ok(()),
        }
    }

    async fn inspect(&self, partition: PartitionKey) -> Result<Option<LockInfo>> {
        self.read(&self.path_for(partition)).await
    }
}
