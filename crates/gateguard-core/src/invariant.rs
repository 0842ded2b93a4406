//! Terminal-state invariant shared by every enforcement point.
//!
//! Two independent paths mutate entities: the [`GateGuard`] (gate verdicts)
//! and the [`TerminalWriteFilter`] (direct writes from other workflows). Both
//! implement [`TerminalInvariant`] so they agree on:
//!
//! - which statuses are terminal ([`TaskStatus::is_terminal`]), and
//! - which metadata keys are gate-derived markers ([`GATE_MARKER_PREFIX`]).
//!
//! Invariant: an entity in a terminal status is never mutated by a gate event
//! and carries no gate markers.
//!
//! [`GateGuard`]: crate::guard::GateGuard
//! [`TerminalWriteFilter`]: crate::write_filter::TerminalWriteFilter

use thiserror::Error;

use crate::state::{EntitySnapshot, Metadata, TaskStatus};

/// Prefix shared by every gate-derived metadata key.
pub const GATE_MARKER_PREFIX: &str = "adversary_gate.";

/// Marker holding the action of the last applied gate verdict.
pub const GATE_VERDICT_MARKER: &str = "adversary_gate.verdict";

/// Marker holding the event ID of the last applied gate verdict.
pub const GATE_EVENT_MARKER: &str = "adversary_gate.event_id";

/// Marker set by producers while a review is outstanding.
pub const GATE_PENDING_MARKER: &str = "adversary_gate.pending";

/// Marker set by producers once a review has passed.
pub const GATE_PASSED_MARKER: &str = "adversary_gate.passed";

/// Returns `true` if `key` belongs to the gate marker vocabulary.
#[must_use]
pub fn is_gate_marker(key: &str) -> bool {
    key.starts_with(GATE_MARKER_PREFIX)
}

/// A gate-driven mutation was attempted on a terminal entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entity {entity_id} is in terminal state {status}")]
pub struct TerminalViolation {
    /// The entity ID.
    pub entity_id: String,
    /// The terminal status the entity is in.
    pub status: TaskStatus,
}

/// Terminal-state checks shared by the gate and direct-write paths.
///
/// All methods have canonical default implementations; implementors opt in
/// with an empty `impl` block and must not override them.
pub trait TerminalInvariant {
    /// Returns `true` if `status` forbids gate-driven mutation.
    fn is_terminal(&self, status: TaskStatus) -> bool {
        status.is_terminal()
    }

    /// Fails if a gate event may not mutate `snapshot`.
    fn ensure_gate_mutable(&self, snapshot: &EntitySnapshot) -> Result<(), TerminalViolation> {
        if self.is_terminal(snapshot.status) {
            return Err(TerminalViolation {
                entity_id: snapshot.id.clone(),
                status: snapshot.status,
            });
        }
        Ok(())
    }

    /// Removes every gate marker from `metadata`, returning the removed keys
    /// in sorted order.
    fn strip_gate_markers(&self, metadata: &mut Metadata) -> Vec<String> {
        let stripped: Vec<String> = metadata
            .keys()
            .filter(|key| is_gate_marker(key))
            .cloned()
            .collect();
        for key in &stripped {
            metadata.remove(key);
        }
        stripped
    }

    /// Brings a pending write into compliance: if `status` is terminal, gate
    /// markers are stripped from `metadata`.
    fn enforce_on_write(&self, status: TaskStatus, metadata: &mut Metadata) -> Vec<String> {
        if self.is_terminal(status) {
            self.strip_gate_markers(metadata)
        } else {
            Vec::new()
        }
    }

    /// Returns `true` if `snapshot` satisfies the invariant.
    fn holds_for(&self, snapshot: &EntitySnapshot) -> bool {
        !self.is_terminal(snapshot.status) || !snapshot.metadata.keys().any(|k| is_gate_marker(k))
    }
}
