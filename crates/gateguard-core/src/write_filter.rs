//! Terminal-state filter for direct writes.
//!
//! Workflows unrelated to the gate (bulk status updates, manual edits) write
//! to the entity store directly. Every such write passes through
//! [`TerminalWriteFilter`]: if the resulting status is terminal, all gate
//! markers are stripped from the metadata in the same conditional write,
//! whether or not the caller meant to touch them. This keeps "a terminal
//! entity carries no gate markers" true regardless of entry point.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::invariant::TerminalInvariant;
use crate::state::{EntitySnapshot, Metadata, TaskStatus};
use crate::store::{EntityStore, EntityUpdate, UpdateOutcome};

/// A direct mutation requested by a non-gate workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectWrite {
    /// New status, or `None` to keep the current one.
    pub status: Option<TaskStatus>,
    /// Metadata entries to insert or overwrite.
    pub set_metadata: Metadata,
    /// Metadata keys to remove.
    pub remove_metadata: Vec<String>,
}

impl DirectWrite {
    /// A write that only changes the status.
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Adds a metadata entry to set.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set_metadata.insert(key.into(), value);
        self
    }

    /// Adds a metadata key to remove.
    #[must_use]
    pub fn without_metadata(mut self, key: impl Into<String>) -> Self {
        self.remove_metadata.push(key.into());
        self
    }
}

/// Result of a filtered direct write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectWriteReport {
    /// The store's verdict on the conditional write.
    pub outcome: UpdateOutcome,
    /// Gate markers removed by the filter.
    pub stripped_markers: Vec<String>,
}

/// Wraps an [`EntityStore`] so that every direct write honors the
/// terminal-state invariant.
pub struct TerminalWriteFilter<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for TerminalWriteFilter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalWriteFilter")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<S> TerminalInvariant for TerminalWriteFilter<S> {}

impl<S: EntityStore> TerminalWriteFilter<S> {
    /// Creates a filter using the system clock.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates a filter with an explicit clock.
    #[must_use]
    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Computes the conditional update for `write` against `current`,
    /// applying the terminal-state filter.
    ///
    /// Returns the update and the markers it strips.
    #[must_use]
    pub fn prepare(
        &self,
        current: &EntitySnapshot,
        write: &DirectWrite,
        now: DateTime<Utc>,
    ) -> (EntityUpdate, Vec<String>) {
        let status = write.status.unwrap_or(current.status);
        let mut metadata = current.metadata.clone();
        for key in &write.remove_metadata {
            metadata.remove(key);
        }
        metadata.extend(
            write
                .set_metadata
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        let stripped = self.enforce_on_write(status, &mut metadata);

        let update = EntityUpdate::new(current.version, now)
            .with_status(status)
            .with_metadata(metadata);
        (update, stripped)
    }

    /// Applies `write` to entity `id` if its version is still
    /// `expected_version`.
    pub async fn apply(
        &self,
        id: &str,
        expected_version: u64,
        write: &DirectWrite,
    ) -> Result<DirectWriteReport, StoreError> {
        let Some(current) = self.store.get(id).await? else {
            return Ok(DirectWriteReport {
                outcome: UpdateOutcome::Missing,
                stripped_markers: Vec::new(),
            });
        };
        if current.version != expected_version {
            return Ok(DirectWriteReport {
                outcome: UpdateOutcome::VersionMismatch {
                    actual: current.version,
                },
                stripped_markers: Vec::new(),
            });
        }
        self.commit(id, &current, write).await
    }

    /// Applies `write` to the current version of entity `id`.
    ///
    /// A single attempt: if the entity changes between read and write the
    /// report carries [`UpdateOutcome::VersionMismatch`].
    pub async fn apply_latest(
        &self,
        id: &str,
        write: &DirectWrite,
    ) -> Result<DirectWriteReport, StoreError> {
        let Some(current) = self.store.get(id).await? else {
            return Ok(DirectWriteReport {
                outcome: UpdateOutcome::Missing,
                stripped_markers: Vec::new(),
            });
        };
        self.commit(id, &current, write).await
    }

    /// Sets `status` on the current version of entity `id`.
    pub async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<DirectWriteReport, StoreError> {
        self.apply_latest(id, &DirectWrite::status(status)).await
    }

    /// Sets `status` on every entity in `ids`, each as its own conditional
    /// write.
    ///
    /// Per-entity conflicts are reported, not retried. A store failure
    /// aborts the batch; writes already committed stay committed.
    pub async fn bulk_set_status(
        &self,
        ids: &[String],
        status: TaskStatus,
    ) -> Result<Vec<(String, DirectWriteReport)>, StoreError> {
        let write = DirectWrite::status(status);
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            let report = self.apply_latest(id, &write).await?;
            reports.push((id.clone(), report));
        }
        let committed = reports
            .iter()
            .filter(|(_, report)| report.outcome.is_committed())
            .count();
        info!(
            requested = ids.len(),
            committed,
            status = %status,
            "bulk status update"
        );
        Ok(reports)
    }

    async fn commit(
        &self,
        id: &str,
        current: &EntitySnapshot,
        write: &DirectWrite,
    ) -> Result<DirectWriteReport, StoreError> {
        let (update, stripped_markers) = self.prepare(current, write, self.clock.now());
        let outcome = self.store.update(id, update).await?;
        if !stripped_markers.is_empty() && outcome.is_committed() {
            debug!(
                id,
                markers = ?stripped_markers,
                "stripped gate markers from terminal entity"
            );
        }
        Ok(DirectWriteReport {
            outcome,
            stripped_markers,
        })
    }
}
