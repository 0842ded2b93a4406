//! Idempotency ledger for gate events.
//!
//! The ledger records which event IDs have already had effect so that
//! at-least-once delivery behaves as exactly-once effect. Entries are
//! write-once: marking an already-recorded ID is a no-op and does not refresh
//! its position.
//!
//! # Retention
//!
//! The ledger is bounded. When it holds `max_entries` IDs, the oldest
//! `eviction_percent` (by insertion order, at least one) are dropped in a
//! single batch before the new ID is inserted. An optional age horizon purges
//! entries processed before `now - max_age`.
//!
//! Eviction is a deliberate memory/correctness tradeoff: an event redelivered
//! after its entry has been evicted is treated as new. Size the ledger so that
//! its horizon exceeds the delivery layer's maximum redelivery window.
//!
//! ```text
//! BoundedEventLedger
//!     ├── entries: HashMap<EventId, processed_at>
//!     └── order:   VecDeque<EventId>   // insertion order, front = oldest
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::LedgerError;

/// Record of event IDs that have already had effect.
///
/// Implementations may suspend (network round trips) and may be shared by
/// many concurrent callers; `mark_processed` must be safe to call
/// redundantly for the same ID.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Returns `true` if `event_id` is recorded as processed.
    async fn has_processed(&self, event_id: &str) -> Result<bool, LedgerError>;

    /// Records `event_id` as processed. Idempotent.
    async fn mark_processed(&self, event_id: &str) -> Result<(), LedgerError>;
}

#[async_trait]
impl<T: EventLedger + ?Sized> EventLedger for Arc<T> {
    async fn has_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        (**self).has_processed(event_id).await
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), LedgerError> {
        (**self).mark_processed(event_id).await
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: HashMap<String, DateTime<Utc>>,
    order: VecDeque<String>,
}

impl LedgerState {
    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some(event_id) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&event_id);
            evicted += 1;
        }
        evicted
    }

    fn purge_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, processed_at| *processed_at >= cutoff);
        let entries = &self.entries;
        self.order.retain(|event_id| entries.contains_key(event_id));
        before - self.entries.len()
    }
}

/// In-process, bounded [`EventLedger`].
///
/// State is owned by the instance; independent guards never share it unless
/// the caller hands them the same `Arc`.
#[derive(Debug)]
pub struct BoundedEventLedger {
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl BoundedEventLedger {
    /// Creates a ledger using the system clock.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a ledger with an explicit clock.
    #[must_use]
    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Returns the number of retained entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Returns `true` if no entries are retained.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Returns when `event_id` was recorded, if it is retained.
    pub async fn processed_at(&self, event_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.entries.get(event_id).copied()
    }

    /// Drops every entry processed before `cutoff`, returning how many were
    /// removed.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let purged = self.state.lock().await.purge_older_than(cutoff);
        if purged > 0 {
            debug!(purged, %cutoff, "purged aged ledger entries");
        }
        purged
    }
}

#[async_trait]
impl EventLedger for BoundedEventLedger {
    async fn has_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        let hit = self.state.lock().await.entries.contains_key(event_id);
        trace!(event_id, hit, "ledger lookup");
        Ok(hit)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.entries.contains_key(event_id) {
            trace!(event_id, "ledger entry already present");
            return Ok(());
        }

        // A horizon reaching past the representable range purges nothing.
        if let Some(cutoff) = self
            .config
            .max_age()
            .and_then(|max_age| now.checked_sub_signed(max_age))
        {
            state.purge_older_than(cutoff);
        }

        if state.entries.len() >= self.config.max_entries {
            let evicted = state.evict_oldest(self.config.eviction_batch());
            debug!(
                evicted,
                max_entries = self.config.max_entries,
                "ledger at capacity, evicted oldest entries"
            );
        }

        state.entries.insert(event_id.to_string(), now);
        state.order.push_back(event_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn ledger(max_entries: usize) -> BoundedEventLedger {
        BoundedEventLedger::new(LedgerConfig::with_max_entries(max_entries))
    }

    #[tokio::test]
    async fn test_mark_then_has_processed() {
        let ledger = ledger(10);
        assert!(!ledger.has_processed("evt-1").await.unwrap());

        ledger.mark_processed("evt-1").await.unwrap();
        assert!(ledger.has_processed("evt-1").await.unwrap());
        assert!(!ledger.has_processed("evt-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_is_write_once() {
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));
        let ledger =
            BoundedEventLedger::with_clock(LedgerConfig::with_max_entries(10), clock.clone());

        ledger.mark_processed("evt-1").await.unwrap();
        let first = ledger.processed_at("evt-1").await.unwrap();

        clock.advance(Duration::seconds(5));
        ledger.mark_processed("evt-1").await.unwrap();

        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.processed_at("evt-1").await, Some(first));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_ten_percent() {
        let ledger = ledger(20);
        for i in 0..20 {
            ledger.mark_processed(&format!("evt-{i}")).await.unwrap();
        }
        assert_eq!(ledger.len().await, 20);

        ledger.mark_processed("evt-20").await.unwrap();

        // 10% of 20 = 2 oldest entries dropped before inserting.
        assert_eq!(ledger.len().await, 19);
        assert!(!ledger.has_processed("evt-0").await.unwrap());
        assert!(!ledger.has_processed("evt-1").await.unwrap());
        assert!(ledger.has_processed("evt-2").await.unwrap());
        assert!(ledger.has_processed("evt-20").await.unwrap());
    }

    #[tokio::test]
    async fn test_redundant_mark_does_not_refresh_position() {
        let ledger = ledger(10);
        for i in 0..10 {
            ledger.mark_processed(&format!("evt-{i}")).await.unwrap();
        }
        // Re-marking the oldest entry must not save it from eviction.
        ledger.mark_processed("evt-0").await.unwrap();
        ledger.mark_processed("evt-10").await.unwrap();

        assert!(!ledger.has_processed("evt-0").await.unwrap());
        assert!(ledger.has_processed("evt-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_of_one() {
        let ledger = ledger(1);
        ledger.mark_processed("a").await.unwrap();
        ledger.mark_processed("b").await.unwrap();

        assert_eq!(ledger.len().await, 1);
        assert!(!ledger.has_processed("a").await.unwrap());
        assert!(ledger.has_processed("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_age_based_retention() {
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));
        let config = LedgerConfig::with_max_entries(100).with_max_age_secs(60);
        let ledger = BoundedEventLedger::with_clock(config, clock.clone());

        ledger.mark_processed("old").await.unwrap();
        clock.advance(Duration::seconds(61));
        ledger.mark_processed("new").await.unwrap();

        assert!(!ledger.has_processed("old").await.unwrap());
        assert!(ledger.has_processed("new").await.unwrap());
    }

    #[tokio::test]
    async fn test_horizon_beyond_time_range_keeps_entries() {
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));
        let config = LedgerConfig::with_max_entries(100).with_max_age_secs(9_000_000_000_000_000);
        let ledger = BoundedEventLedger::with_clock(config, clock.clone());

        ledger.mark_processed("a").await.unwrap();
        clock.advance(Duration::days(365));
        ledger.mark_processed("b").await.unwrap();

        assert!(ledger.has_processed("a").await.unwrap());
        assert!(ledger.has_processed("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));
        let ledger =
            BoundedEventLedger::with_clock(LedgerConfig::with_max_entries(100), clock.clone());

        ledger.mark_processed("a").await.unwrap();
        clock.advance(Duration::seconds(10));
        ledger.mark_processed("b").await.unwrap();

        let purged = ledger.purge_older_than(clock.now()).await;
        assert_eq!(purged, 1);
        assert!(ledger.has_processed("b").await.unwrap());
        assert!(!ledger.has_processed("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let a = ledger(10);
        let b = ledger(10);
        a.mark_processed("evt-1").await.unwrap();
        assert!(!b.has_processed("evt-1").await.unwrap());
    }
}
