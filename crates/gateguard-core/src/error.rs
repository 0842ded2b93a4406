//! Infrastructure error types.
//!
//! Expected guard outcomes (duplicate, terminal, not found, conflict) are not
//! errors; see [`crate::guard::Rejection`]. The types here describe loss of
//! the backing store or ledger, which the delivery layer must retry with its
//! own backoff.

use thiserror::Error;

/// Errors raised by an [`EntityStore`](crate::store::EntityStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached.
    #[error("entity store unavailable: {reason}")]
    Unavailable {
        /// Description of the connectivity failure.
        reason: String,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt entity {id}: {reason}")]
    Corrupt {
        /// The entity ID of the undecodable row.
        id: String,
        /// What failed to decode.
        reason: String,
    },

    /// Metadata could not be encoded for storage.
    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by an [`EventLedger`](crate::ledger::EventLedger).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The ledger could not be reached.
    #[error("event ledger unavailable: {reason}")]
    Unavailable {
        /// Description of the connectivity failure.
        reason: String,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Errors that escape [`GateGuard::process_event`](crate::guard::GateGuard::process_event).
///
/// Only infrastructure failures are reported here. An event that fails with
/// a `GuardError` has not been marked processed and is safe to redeliver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GuardError {
    /// The entity store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl GuardError {
    /// Returns `true` if the failure originated in the entity store.
    #[must_use]
    pub const fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns `true` if the failure originated in the event ledger.
    #[must_use]
    pub const fn is_ledger_failure(&self) -> bool {
        matches!(self, Self::Ledger(_))
    }
}
