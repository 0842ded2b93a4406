//! Task status and entity snapshots.
//!
//! An [`EntitySnapshot`] is the slice of a task that the guard reads and
//! writes: its status, its compare-and-swap version, the commit timestamp and
//! a free-form metadata map that carries gate markers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Auxiliary metadata attached to an entity.
///
/// A `BTreeMap` keeps serialization and equality deterministic.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a task.
///
/// Variants are declared in lifecycle order; `Done` and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Captured but not yet scheduled.
    Backlog,
    /// Scheduled, not started.
    Todo,
    /// Being worked on.
    InProgress,
    /// Awaiting review.
    Review,
    /// Blocked on a clarification from the author.
    NeedsClarification,
    /// Finished.
    Done,
    /// Abandoned.
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Backlog,
        Self::Todo,
        Self::InProgress,
        Self::Review,
        Self::NeedsClarification,
        Self::Done,
        Self::Cancelled,
    ];

    /// Returns the wire name of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::NeedsClarification => "needs_clarification",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` if no gate-driven mutation is permitted from this
    /// status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known [`TaskStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task status: {value}")]
pub struct ParseStatusError {
    /// The rejected input.
    pub value: String,
}

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                value: s.to_string(),
            })
    }
}

/// Versioned view of a task as held by the entity store.
///
/// `version` increases by exactly one per committed mutation and is the
/// compare-and-swap token for conditional updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Opaque, unique entity ID.
    pub id: String,
    /// Current status.
    pub status: TaskStatus,
    /// Compare-and-swap version.
    pub version: u64,
    /// Timestamp of the last committed mutation.
    pub updated_at: DateTime<Utc>,
    /// Auxiliary metadata, including gate markers.
    #[serde(default)]
    pub metadata: Metadata,
}

impl EntitySnapshot {
    /// Creates a snapshot at version 1 with empty metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, status: TaskStatus, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status,
            version: 1,
            updated_at,
            metadata: Metadata::new(),
        }
    }

    /// Sets the version.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Inserts a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns `true` if the snapshot is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![TaskStatus::Done, TaskStatus::Cancelled]);
    }

    #[test]
    fn test_status_order_follows_lifecycle() {
        assert!(TaskStatus::Backlog < TaskStatus::InProgress);
        assert!(TaskStatus::Review < TaskStatus::NeedsClarification);
        assert!(TaskStatus::NeedsClarification < TaskStatus::Done);
    }

    #[test]
    fn test_status_parse_round_trips_wire_names() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        let err = "archived".parse::<TaskStatus>().unwrap_err();
        assert_eq!(err.value, "archived");
        assert_eq!(err.to_string(), "invalid task status: archived");
    }

    #[test]
    fn test_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::NeedsClarification).unwrap();
        assert_eq!(json, "\"needs_clarification\"");
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot = EntitySnapshot::new("task-1", TaskStatus::Todo, DateTime::UNIX_EPOCH);
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.metadata.is_empty());
        assert!(!snapshot.is_terminal());
    }
}
