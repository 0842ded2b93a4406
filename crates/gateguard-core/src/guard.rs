//! Consumer-side admission guard for gate events.
//!
//! [`GateGuard::process_event`] is the single authority deciding whether a
//! delivered [`GateEvent`] takes effect. Each step may short-circuit with no
//! further side effects:
//!
//! ```text
//! 1. idempotency    ledger has event_id            -> duplicate       (permanent)
//! 2. lookup         target absent                  -> not found       (permanent, marked)
//!                   target records this event_id   -> duplicate       (permanent, marked)
//! 3. terminal gate  target status terminal         -> terminal state  (permanent, marked)
//! 4. resolve        action -> target status
//! 5. re-read        version moved or now terminal  -> conflict        (retryable, NOT marked)
//! 6. commit         conditional write, version + 1 -> conflict on CAS failure
//! 7. mark           ledger records event_id        -> applied
//! ```
//!
//! # Concurrency
//!
//! No lock serializes work on a target. Correctness comes from the ledger's
//! write-once semantics, the version-checked commit, and the gate markers the
//! commit writes atomically with the status. The last applied event ID is
//! recorded under [`GATE_EVENT_MARKER`], so a concurrent delivery of the same
//! event that loses the compare-and-swap (or reads the snapshot between
//! commit and ledger mark) is classified as a duplicate rather than a
//! conflict.
//!
//! The guard performs no retries. Infrastructure failures propagate as
//! [`GuardError`] without marking the event processed.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::action::{GateAction, resolve_target_status};
use crate::clock::{Clock, SystemClock};
use crate::error::GuardError;
use crate::event::GateEvent;
use crate::invariant::{GATE_EVENT_MARKER, GATE_VERDICT_MARKER, TerminalInvariant};
use crate::ledger::EventLedger;
use crate::state::{EntitySnapshot, TaskStatus};
use crate::store::{EntityStore, EntityUpdate, UpdateOutcome};

/// Why an event did not take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The event already had effect.
    Duplicate,

    /// The target entity does not exist.
    NotFound,

    /// The target is in a terminal status; the action was suppressed.
    TerminalState {
        /// The target's current status.
        status: TaskStatus,
        /// The suppressed action.
        action: GateAction,
    },

    /// The target changed between read and commit. Retry against fresh
    /// state.
    ConcurrencyConflict {
        /// The version observed at lookup.
        expected_version: u64,
        /// The version found at commit time, or `None` if the target
        /// disappeared.
        actual_version: Option<u64>,
    },
}

impl Rejection {
    /// Returns a stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::NotFound => "not_found",
            Self::TerminalState { .. } => "terminal_state",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
        }
    }

    /// Returns `true` if redelivering the event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => f.write_str("duplicate"),
            Self::NotFound => f.write_str("not found"),
            Self::TerminalState { status, action } => {
                write!(f, "terminal state: target is {status}, suppressed {action}")
            },
            Self::ConcurrencyConflict {
                expected_version,
                actual_version: Some(actual),
            } => write!(
                f,
                "concurrency conflict: expected version {expected_version}, found {actual}"
            ),
            Self::ConcurrencyConflict {
                expected_version,
                actual_version: None,
            } => write!(
                f,
                "concurrency conflict: expected version {expected_version}, target disappeared"
            ),
        }
    }
}

impl Serialize for Rejection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Structured result of [`GateGuard::process_event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    /// Whether the event took effect.
    pub applied: bool,
    /// Why it did not, when `applied` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
    /// Whether the delivery layer should retry.
    pub retryable: bool,
    /// The event ID.
    pub event_id: String,
    /// The target entity ID.
    pub target_id: String,
    /// The committed snapshot, when applied.
    #[serde(skip)]
    pub committed: Option<EntitySnapshot>,
}

impl GateOutcome {
    fn applied(event: &GateEvent, committed: EntitySnapshot) -> Self {
        Self {
            applied: true,
            reason: None,
            retryable: false,
            event_id: event.event_id.clone(),
            target_id: event.target_id.clone(),
            committed: Some(committed),
        }
    }

    fn rejected(event: &GateEvent, reason: Rejection) -> Self {
        Self {
            applied: false,
            retryable: reason.is_retryable(),
            reason: Some(reason),
            event_id: event.event_id.clone(),
            target_id: event.target_id.clone(),
            committed: None,
        }
    }

    /// Returns `true` if the event was rejected as a duplicate.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self.reason, Some(Rejection::Duplicate))
    }

    /// Returns `true` if the event was rejected by the terminal-state gate.
    #[must_use]
    pub const fn is_terminal_rejection(&self) -> bool {
        matches!(self.reason, Some(Rejection::TerminalState { .. }))
    }

    /// Returns `true` if the event hit a concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.reason, Some(Rejection::ConcurrencyConflict { .. }))
    }
}

/// Admission guard over an entity store and an idempotency ledger.
///
/// The guard owns no tracking state of its own; the ledger and store are
/// injected, so independent guards never interfere unless they are given the
/// same instances.
pub struct GateGuard<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
}

impl<S, L> fmt::Debug for GateGuard<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateGuard")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<S, L> TerminalInvariant for GateGuard<S, L> {}

impl<S, L> GateGuard<S, L>
where
    S: EntityStore,
    L: EventLedger,
{
    /// Creates a guard using the system clock.
    #[must_use]
    pub fn new(store: Arc<S>, ledger: Arc<L>) -> Self {
        Self::with_clock(store, ledger, Arc::new(SystemClock))
    }

    /// Creates a guard with an explicit clock for commit timestamps.
    #[must_use]
    pub fn with_clock(store: Arc<S>, ledger: Arc<L>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// Returns the entity store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the event ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Decides whether `event` takes effect and, if so, commits it.
    ///
    /// Safe to call concurrently, including for the same event or target.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError`] only when the store or ledger is unreachable.
    /// The event is not marked processed in that case.
    pub async fn process_event(&self, event: &GateEvent) -> Result<GateOutcome, GuardError> {
        let event_id = event.event_id.as_str();
        let target_id = event.target_id.as_str();

        if self.ledger.has_processed(event_id).await? {
            debug!(event_id, target_id, "duplicate gate event");
            return Ok(GateOutcome::rejected(event, Rejection::Duplicate));
        }

        let Some(observed) = self.store.get(target_id).await? else {
            // Marked so a permanently missing target cannot cause a
            // redelivery storm.
            self.ledger.mark_processed(event_id).await?;
            warn!(event_id, target_id, "gate event targets unknown entity");
            return Ok(GateOutcome::rejected(event, Rejection::NotFound));
        };

        if records_event(&observed, event_id) {
            return self.duplicate_by_witness(event).await;
        }

        if self.ensure_gate_mutable(&observed).is_err() {
            self.ledger.mark_processed(event_id).await?;
            warn!(
                event_id,
                target_id,
                status = %observed.status,
                action = %event.action,
                "suppressed gate event for terminal entity"
            );
            return Ok(GateOutcome::rejected(
                event,
                Rejection::TerminalState {
                    status: observed.status,
                    action: event.action,
                },
            ));
        }

        let target_status = resolve_target_status(event.action);

        let Some(current) = self.store.get(target_id).await? else {
            return Ok(self.conflict(event, observed.version, None));
        };
        if current.version != observed.version || self.is_terminal(current.status) {
            if records_event(&current, event_id) {
                return self.duplicate_by_witness(event).await;
            }
            return Ok(self.conflict(event, observed.version, Some(current.version)));
        }

        let mut metadata = current.metadata.clone();
        metadata.insert(
            GATE_VERDICT_MARKER.to_string(),
            serde_json::Value::from(event.action.as_str()),
        );
        metadata.insert(
            GATE_EVENT_MARKER.to_string(),
            serde_json::Value::from(event_id),
        );
        let update = EntityUpdate::new(observed.version, self.clock.now())
            .with_status(target_status)
            .with_metadata(metadata);

        let committed = match self.store.update(target_id, update).await? {
            UpdateOutcome::Committed(snapshot) => snapshot,
            UpdateOutcome::VersionMismatch { actual } => {
                if let Some(latest) = self.store.get(target_id).await? {
                    if records_event(&latest, event_id) {
                        return self.duplicate_by_witness(event).await;
                    }
                }
                return Ok(self.conflict(event, observed.version, Some(actual)));
            },
            UpdateOutcome::Missing => {
                return Ok(self.conflict(event, observed.version, None));
            },
        };

        self.ledger.mark_processed(event_id).await?;
        info!(
            event_id,
            target_id,
            action = %event.action,
            from = %observed.status,
            to = %committed.status,
            version = committed.version,
            "applied gate event"
        );
        Ok(GateOutcome::applied(event, committed))
    }

    /// The target already records this event as its last applied verdict:
    /// another delivery committed it. Ensure the ledger agrees.
    async fn duplicate_by_witness(&self, event: &GateEvent) -> Result<GateOutcome, GuardError> {
        self.ledger.mark_processed(&event.event_id).await?;
        debug!(
            event_id = %event.event_id,
            target_id = %event.target_id,
            "gate event already recorded on target"
        );
        Ok(GateOutcome::rejected(event, Rejection::Duplicate))
    }

    #[allow(clippy::unused_self)]
    fn conflict(&self, event: &GateEvent, expected: u64, actual: Option<u64>) -> GateOutcome {
        warn!(
            event_id = %event.event_id,
            target_id = %event.target_id,
            expected_version = expected,
            actual_version = ?actual,
            "concurrency conflict applying gate event"
        );
        GateOutcome::rejected(
            event,
            Rejection::ConcurrencyConflict {
                expected_version: expected,
                actual_version: actual,
            },
        )
    }
}

fn records_event(snapshot: &EntitySnapshot, event_id: &str) -> bool {
    snapshot
        .metadata
        .get(GATE_EVENT_MARKER)
        .and_then(serde_json::Value::as_str)
        == Some(event_id)
}
