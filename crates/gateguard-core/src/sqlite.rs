//! `SQLite`-backed entity store and event ledger.
//!
//! Both types wrap a single connection in a mutex and run statements
//! synchronously inside their async trait methods. The entity store's write
//! is one conditional statement:
//!
//! ```sql
//! UPDATE entities SET ..., version = version + 1
//!  WHERE id = ?id AND version = ?expected
//! ```
//!
//! so it is a compare-and-swap even when several processes share the
//! database file.

// SQLite stores integers as i64; versions and counts are never negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, StoreError};
use crate::ledger::EventLedger;
use crate::state::{EntitySnapshot, Metadata, TaskStatus};
use crate::store::{EntityStore, EntityUpdate, UpdateOutcome};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(conn)
}

fn open_in_memory() -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(conn)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// =============================================================================
// SqliteEntityStore
// =============================================================================

/// [`EntityStore`] persisted in `SQLite`.
#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEntityStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_connection(path.as_ref())?))
    }

    /// Creates an in-memory store for testing.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an entity. Fails if the ID already exists.
    pub fn insert(&self, snapshot: &EntitySnapshot) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&snapshot.metadata)?;
        let version = i64::try_from(snapshot.version).map_err(|_| StoreError::Corrupt {
            id: snapshot.id.clone(),
            reason: format!("version {} exceeds the storable range", snapshot.version),
        })?;
        self.conn().execute(
            "INSERT INTO entities (id, status, version, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.id,
                snapshot.status.as_str(),
                version,
                format_timestamp(snapshot.updated_at),
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Loads an entity synchronously.
    pub fn get_sync(&self, id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
        Self::select(&self.conn(), id)
    }

    /// Applies a conditional update synchronously.
    pub fn update_sync(
        &self,
        id: &str,
        update: &EntityUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        let metadata = update
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        if update.expected_version >= i64::MAX as u64 {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: format!("version {} cannot be incremented", update.expected_version),
            });
        }
        let conn = self.conn();

        let changed = conn.execute(
            "UPDATE entities
                SET status = COALESCE(?1, status),
                    metadata = COALESCE(?2, metadata),
                    updated_at = ?3,
                    version = version + 1
              WHERE id = ?4 AND version = ?5",
            params![
                update.status.map(TaskStatus::as_str),
                metadata,
                format_timestamp(update.updated_at),
                id,
                update.expected_version as i64,
            ],
        )?;

        if changed == 0 {
            let actual: Option<i64> = conn
                .query_row(
                    "SELECT version FROM entities WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            trace!(
                id,
                expected = update.expected_version,
                ?actual,
                "conditional update rejected"
            );
            return Ok(actual.map_or(UpdateOutcome::Missing, |actual| {
                UpdateOutcome::VersionMismatch {
                    actual: actual as u64,
                }
            }));
        }

        let committed = Self::select(&conn, id)?.ok_or_else(|| StoreError::Corrupt {
            id: id.to_string(),
            reason: "row vanished after committed update".to_string(),
        })?;
        Ok(UpdateOutcome::Committed(committed))
    }

    fn select(conn: &Connection, id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
        let row: Option<(String, i64, String, String)> = conn
            .query_row(
                "SELECT status, version, updated_at, metadata FROM entities WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((status, version, updated_at, metadata)) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.to_string(),
            reason,
        };
        let status: TaskStatus = status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| corrupt(format!("updated_at: {e}")))?
            .with_timezone(&Utc);
        let metadata: Metadata =
            serde_json::from_str(&metadata).map_err(|e| corrupt(format!("metadata: {e}")))?;

        Ok(Some(EntitySnapshot {
            id: id.to_string(),
            status,
            version: version as u64,
            updated_at,
            metadata,
        }))
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn get(&self, id: &str) -> Result<Option<EntitySnapshot>, StoreError> {
        self.get_sync(id)
    }

    async fn update(&self, id: &str, update: EntityUpdate) -> Result<UpdateOutcome, StoreError> {
        self.update_sync(id, &update)
    }
}

// =============================================================================
// SqliteEventLedger
// =============================================================================

/// [`EventLedger`] persisted in `SQLite`, with the same capacity and age
/// limits as [`BoundedEventLedger`](crate::ledger::BoundedEventLedger).
///
/// Eviction order is ascending `seq`, i.e. insertion order.
#[derive(Debug, Clone)]
pub struct SqliteEventLedger {
    conn: Arc<Mutex<Connection>>,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
}

impl SqliteEventLedger {
    /// Opens or creates the ledger at `path`.
    pub fn open(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self, LedgerError> {
        Ok(Self::from_connection(
            open_connection(path.as_ref())?,
            config,
            Arc::new(SystemClock),
        ))
    }

    /// Creates an in-memory ledger for testing.
    pub fn in_memory(config: LedgerConfig, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        Ok(Self::from_connection(open_in_memory()?, config, clock))
    }

    fn from_connection(conn: Connection, config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            clock,
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of retained entries.
    pub fn len(&self) -> Result<usize, LedgerError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM processed_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Returns `true` if no entries are retained.
    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }

    fn has_processed_sync(&self, event_id: &str) -> Result<bool, LedgerError> {
        let hit = self
            .conn()
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(hit)
    }

    fn mark_processed_sync(&self, event_id: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let mut conn = self.conn();
        // Immediate so a second connection on the same file cannot slip in
        // between the capacity count and the insert.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(());
        }

        // A horizon reaching past the representable range purges nothing.
        if let Some(cutoff) = self
            .config
            .max_age()
            .and_then(|max_age| now.checked_sub_signed(max_age))
        {
            tx.execute(
                "DELETE FROM processed_events WHERE processed_at < ?1",
                params![format_timestamp(cutoff)],
            )?;
        }

        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM processed_events", [], |row| row.get(0))?;
        if count as usize >= self.config.max_entries {
            let evicted = tx.execute(
                "DELETE FROM processed_events WHERE seq IN
                    (SELECT seq FROM processed_events ORDER BY seq ASC LIMIT ?1)",
                params![self.config.eviction_batch() as i64],
            )?;
            debug!(
                evicted,
                max_entries = self.config.max_entries,
                "ledger at capacity, evicted oldest entries"
            );
        }

        tx.execute(
            "INSERT OR IGNORE INTO processed_events (event_id, processed_at) VALUES (?1, ?2)",
            params![event_id, format_timestamp(now)],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl EventLedger for SqliteEventLedger {
    async fn has_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        self.has_processed_sync(event_id)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), LedgerError> {
        self.mark_processed_sync(event_id)
    }
}
