//! Entity store contract.
//!
//! The store is externally owned and may be mutated concurrently by other
//! actors, so the only write it exposes is a conditional one: an
//! [`EntityUpdate`] names the version the writer last observed and commits
//! only if the stored version still matches, the in-process equivalent of
//! `UPDATE ... WHERE id = ? AND version = ?`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::StoreError;
use crate::state::{EntitySnapshot, Metadata, TaskStatus};

/// A conditional write against a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpdate {
    /// Version the writer observed; the write commits only if it still
    /// matches.
    pub expected_version: u64,
    /// New status, or `None` to keep the stored one.
    pub status: Option<TaskStatus>,
    /// Replacement metadata, or `None` to keep the stored one.
    pub metadata: Option<Metadata>,
    /// Commit timestamp.
    pub updated_at: DateTime<Utc>,
}

impl EntityUpdate {
    /// Creates an update that only bumps the version and timestamp.
    #[must_use]
    pub const fn new(expected_version: u64, updated_at: DateTime<Utc>) -> Self {
        Self {
            expected_version,
            status: None,
            metadata: None,
            updated_at,
        }
    }

    /// Sets the new status.
    #[must_use]
    pub const fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the replacement metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Applies the update to `current`, producing the committed snapshot.
    ///
    /// The caller is responsible for the version check. Fails with
    /// [`StoreError::Corrupt`] if the version cannot be incremented.
    pub fn apply_to(self, current: &EntitySnapshot) -> Result<EntitySnapshot, StoreError> {
        let version = current
            .version
            .checked_add(1)
            .ok_or_else(|| StoreError::Corrupt {
                id: current.id.clone(),
                reason: format!("version {} cannot be incremented", current.version),
            })?;
        Ok(EntitySnapshot {
            id: current.id.clone(),
            status: self.status.unwrap_or(current.status),
            version,
            updated_at: self.updated_at,
            metadata: self.metadata.unwrap_or_else(|| current.metadata.clone()),
        })
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write committed; carries the new snapshot.
    Committed(EntitySnapshot),

    /// The stored version no longer matches the expected one.
    VersionMismatch {
        /// The version currently stored.
        actual: u64,
    },

    /// The entity no longer exists.
    Missing,
}

impl UpdateOutcome {
    /// Returns `true` if the write committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Returns the committed snapshot, if any.
    #[must_use]
    pub const fn committed(&self) -> Option<&EntitySnapshot> {
        match self {
            Self::Committed(snapshot) => Some(snapshot),
            Self::VersionMismatch { .. } | Self::Missing => None,
        }
    }
}

/// Versioned entity repository.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Loads an entity, or `None` if it does not exist.
    async fn get(&self, id: &str) -> Result<Option<EntitySnapshot>, StoreError>;

    /// Atomically applies `update` if the stored version equals
    /// `update.expected_version`.
    ///
    /// On commit the stored version becomes `expected_version + 1`.
    async fn update(&self, id: &str, update: EntityUpdate) -> Result<UpdateOutcome, StoreError>;
}

#[async_trait]
impl<T: EntityStore + ?Sized> EntityStore for Arc<T> {
    async fn get(&self, id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
        (**self).get(id).await
    }

    async fn update(&self, id: &str, update: EntityUpdate) -> Result<UpdateOutcome, StoreError> {
        (**self).update(id, update).await
    }
}

/// In-process [`EntityStore`].
///
/// Used by tests and embedded deployments. The write lock is held across the
/// version check and the write, which makes `update` a true compare-and-swap.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<String, EntitySnapshot>>,
    unavailable: AtomicBool,
}

impl InMemoryEntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity as-is.
    ///
    /// This models the owning repository creating the entity; it bypasses
    /// version checks.
    pub async fn insert(&self, snapshot: EntitySnapshot) {
        self.entities
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot);
    }

    /// Removes an entity, returning it if it existed.
    pub async fn remove(&self, id: &str) -> Option<EntitySnapshot> {
        self.entities.write().await.remove(id)
    }

    /// Returns the number of stored entities.
    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Returns `true` if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    /// Simulates loss of connectivity: while set, every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
        self.check_available()?;
        Ok(self.entities.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, update: EntityUpdate) -> Result<UpdateOutcome, StoreError> {
        self.check_available()?;
        let mut entities = self.entities.write().await;

        let Some(current) = entities.get(id) else {
            return Ok(UpdateOutcome::Missing);
        };
        if current.version != update.expected_version {
            trace!(
                id,
                expected = update.expected_version,
                actual = current.version,
                "conditional update rejected"
            );
            return Ok(UpdateOutcome::VersionMismatch {
                actual: current.version,
            });
        }

        let next = update.apply_to(current)?;
        entities.insert(id.to_string(), next.clone());
        Ok(UpdateOutcome::Committed(next))
    }
}
