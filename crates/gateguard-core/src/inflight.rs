//! Producer-side in-flight tracking.
//!
//! A mark records that an event has been produced for a target and has not
//! yet been confirmed resolved. Marks are advisory hints, not locks: they
//! suppress duplicate *production* before first delivery, while the
//! [`GateGuard`](crate::guard::GateGuard) remains the only authority over
//! whether an event takes effect.
//!
//! Marks are cleared by the producer on confirmed resolution. When that
//! signal is lost (verdict processing crashed, terminal transition missed),
//! the periodic sweep reclaims marks older than the TTL so the target becomes
//! eligible again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::InFlightConfig;
use crate::error::StoreError;
use crate::state::TaskStatus;
use crate::store::EntityStore;

/// Outcome of the producer's pre-emission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionDecision {
    /// The target is eligible; it has been marked in flight and the producer
    /// should emit now.
    Emit {
        /// Version of the target observed during the live-status check.
        observed_version: u64,
    },

    /// An event for this target is already outstanding.
    InFlight,

    /// The target reached a terminal status since it was selected.
    Terminal {
        /// The live terminal status.
        status: TaskStatus,
    },

    /// The target no longer exists.
    Missing,
}

impl EmissionDecision {
    /// Returns `true` if the producer should emit.
    #[must_use]
    pub const fn should_emit(&self) -> bool {
        matches!(self, Self::Emit { .. })
    }
}

/// TTL-bounded set of targets with an outstanding gate event.
#[derive(Debug)]
pub struct InFlightTracker {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    marks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InFlightTracker {
    /// Creates a tracker using the system clock.
    #[must_use]
    pub fn new(config: &InFlightConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a tracker with an explicit clock.
    #[must_use]
    pub fn with_clock(config: &InFlightConfig, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(config.ttl()).unwrap_or(chrono::Duration::MAX);
        Self {
            ttl,
            clock,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Staleness threshold applied by [`sweep_stale`](Self::sweep_stale).
    #[must_use]
    pub const fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    fn marks(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `target_id` as having an outstanding event.
    ///
    /// Returns `false` if it was already marked; the original mark time is
    /// kept so the TTL is measured from first production.
    pub fn mark_in_flight(&self, target_id: &str) -> bool {
        let now = self.clock.now();
        let mut marks = self.marks();
        if marks.contains_key(target_id) {
            return false;
        }
        marks.insert(target_id.to_string(), now);
        trace!(target_id, "marked in flight");
        true
    }

    /// Returns `true` if `target_id` has an outstanding mark.
    #[must_use]
    pub fn is_in_flight(&self, target_id: &str) -> bool {
        self.marks().contains_key(target_id)
    }

    /// Clears the mark for `target_id`, returning whether one existed.
    pub fn clear_in_flight(&self, target_id: &str) -> bool {
        let cleared = self.marks().remove(target_id).is_some();
        if cleared {
            trace!(target_id, "cleared in-flight mark");
        }
        cleared
    }

    /// Returns when `target_id` was marked, if it is.
    #[must_use]
    pub fn marked_at(&self, target_id: &str) -> Option<DateTime<Utc>> {
        self.marks().get(target_id).copied()
    }

    /// Returns the number of outstanding marks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks().len()
    }

    /// Returns `true` if no marks are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks().is_empty()
    }

    /// Removes marks older than the TTL, returning how many were removed.
    ///
    /// Idempotent and safe to run concurrently with itself: each call
    /// removes whatever is stale at the moment it takes the lock.
    pub fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut marks = self.marks();
        let before = marks.len();
        marks.retain(|_, marked_at| now.signed_duration_since(*marked_at) <= ttl);
        let removed = before - marks.len();
        if removed > 0 {
            debug!(removed, remaining = marks.len(), "swept stale in-flight marks");
        }
        removed
    }

    /// Performs both producer obligations before emitting for `target_id`:
    /// the in-flight check and a re-read of the target's live status.
    ///
    /// The target is marked in flight only when the decision is
    /// [`EmissionDecision::Emit`]. Marking happens after the live read and is
    /// conditional on no mark existing, so two producers racing on the same
    /// target cannot both be told to emit.
    pub async fn check_emission<S>(
        &self,
        target_id: &str,
        store: &S,
    ) -> Result<EmissionDecision, StoreError>
    where
        S: EntityStore + ?Sized,
    {
        if self.is_in_flight(target_id) {
            return Ok(EmissionDecision::InFlight);
        }

        let Some(live) = store.get(target_id).await? else {
            return Ok(EmissionDecision::Missing);
        };
        if live.status.is_terminal() {
            debug!(target_id, status = %live.status, "skipping emission for terminal target");
            return Ok(EmissionDecision::Terminal {
                status: live.status,
            });
        }

        if !self.mark_in_flight(target_id) {
            return Ok(EmissionDecision::InFlight);
        }
        Ok(EmissionDecision::Emit {
            observed_version: live.version,
        })
    }

    /// Runs [`sweep_stale`](Self::sweep_stale) every `interval` on the
    /// current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the tracker is
    /// dropped. Spawning more than one sweeper is harmless.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    debug!("in-flight tracker dropped, stopping sweeper");
                    break;
                };
                tracker.sweep_stale();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::state::EntitySnapshot;
    use crate::store::InMemoryEntityStore;

    fn tracker(ttl_secs: u64) -> (InFlightTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));
        let config = InFlightConfig {
            ttl_secs,
            ..InFlightConfig::default()
        };
        (InFlightTracker::with_clock(&config, clock.clone()), clock)
    }

    #[test]
    fn test_mark_is_clear_cycle() {
        let (tracker, _) = tracker(600);
        assert!(!tracker.is_in_flight("task-1"));

        assert!(tracker.mark_in_flight("task-1"));
        assert!(tracker.is_in_flight("task-1"));

        assert!(tracker.clear_in_flight("task-1"));
        assert!(!tracker.is_in_flight("task-1"));
        assert!(!tracker.clear_in_flight("task-1"));
    }

    #[test]
    fn test_remark_keeps_original_time() {
        let (tracker, clock) = tracker(600);
        tracker.mark_in_flight("task-1");
        let first = tracker.marked_at("task-1").unwrap();

        clock.advance(ChronoDuration::seconds(30));
        assert!(!tracker.mark_in_flight("task-1"));
        assert_eq!(tracker.marked_at("task-1"), Some(first));
    }

    #[test]
    fn test_sweep_removes_only_stale_marks() {
        let (tracker, clock) = tracker(600);
        tracker.mark_in_flight("old");
        clock.advance(ChronoDuration::seconds(400));
        tracker.mark_in_flight("young");
        clock.advance(ChronoDuration::seconds(201));

        // "old" is 601s old, "young" is 201s old.
        assert_eq!(tracker.sweep_stale(), 1);
        assert!(!tracker.is_in_flight("old"));
        assert!(tracker.is_in_flight("young"));

        // Sweeping again is a no-op.
        assert_eq!(tracker.sweep_stale(), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_ttl_comes_from_config() {
        let (configured, _) = tracker(120);
        assert_eq!(configured.ttl(), ChronoDuration::seconds(120));

        // Unrepresentable horizons saturate instead of failing.
        let (unbounded, clock) = tracker(u64::MAX);
        assert_eq!(unbounded.ttl(), ChronoDuration::MAX);
        unbounded.mark_in_flight("task-1");
        clock.advance(ChronoDuration::days(365));
        assert_eq!(unbounded.sweep_stale(), 0);
    }

    #[test]
    fn test_mark_exactly_at_ttl_survives() {
        let (tracker, clock) = tracker(600);
        tracker.mark_in_flight("task-1");
        clock.advance(ChronoDuration::seconds(600));
        assert_eq!(tracker.sweep_stale(), 0);
        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(tracker.sweep_stale(), 1);
    }

    #[test]
    fn test_concurrent_sweeps_are_safe() {
        let (tracker, clock) = tracker(60);
        for i in 0..100 {
            tracker.mark_in_flight(&format!("task-{i}"));
        }
        clock.advance(ChronoDuration::seconds(61));

        let tracker = Arc::new(tracker);
        let removed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| tracker.sweep_stale()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(removed, 100);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_check_emission_marks_eligible_target() {
        let (tracker, clock) = tracker(600);
        let store = InMemoryEntityStore::new();
        store
            .insert(
                EntitySnapshot::new("task-1", TaskStatus::InProgress, clock.now()).with_version(4),
            )
            .await;

        let decision = tracker.check_emission("task-1", &store).await.unwrap();
        assert_eq!(decision, EmissionDecision::Emit { observed_version: 4 });
        assert!(tracker.is_in_flight("task-1"));

        let again = tracker.check_emission("task-1", &store).await.unwrap();
        assert_eq!(again, EmissionDecision::InFlight);
        assert!(!again.should_emit());
    }

    #[tokio::test]
    async fn test_check_emission_reverifies_live_status() {
        let (tracker, clock) = tracker(600);
        let store = InMemoryEntityStore::new();
        store
            .insert(EntitySnapshot::new("task-1", TaskStatus::Done, clock.now()))
            .await;

        let decision = tracker.check_emission("task-1", &store).await.unwrap();
        assert_eq!(
            decision,
            EmissionDecision::Terminal {
                status: TaskStatus::Done
            }
        );
        assert!(!tracker.is_in_flight("task-1"));

        let missing = tracker.check_emission("task-2", &store).await.unwrap();
        assert_eq!(missing, EmissionDecision::Missing);
        assert!(!tracker.is_in_flight("task-2"));
    }

    #[tokio::test]
    async fn test_check_emission_propagates_store_failure() {
        let (tracker, _) = tracker(600);
        let store = InMemoryEntityStore::new();
        store.set_unavailable(true);

        let result = tracker.check_emission("task-1", &store).await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
        assert!(!tracker.is_in_flight("task-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_stale_marks() {
        let clock = Arc::new(ManualClock::at_unix_secs(1_000));
        let config = InFlightConfig {
            ttl_secs: 60,
            sweep_interval_secs: 5,
        };
        let tracker = Arc::new(InFlightTracker::with_clock(&config, clock.clone()));
        tracker.mark_in_flight("task-1");

        let handle = tracker.spawn_sweeper(config.sweep_interval());
        clock.advance(ChronoDuration::seconds(61));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(!tracker.is_in_flight("task-1"));

        drop(tracker);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }
}
