#![allow(clippy::doc_markdown)]

//! gateguard-core - admission and consistency guard for gate verdict events.
//!
//! Gate verdicts ("adversary gate" events) arrive from an at-least-once
//! delivery layer: they may be duplicated, reordered, or delivered after the
//! target task has already moved on. This crate decides whether a delivered
//! event is allowed to take effect on the shared, versioned task store.
//!
//! # Architecture
//!
//! ```text
//! producer                         consumer(s)
//!    |                                  |
//!    v                                  v
//! InFlightTracker::check_emission   GateGuard::process_event
//!    |  (advisory, TTL-swept)           |-- EventLedger      (idempotency)
//!    |                                  |-- TerminalInvariant (terminal gate)
//!    +--------> delivery layer -------->|-- EntityStore      (CAS apply)
//!
//! direct writers --> TerminalWriteFilter --> EntityStore
//! ```
//!
//! # Modules
//!
//! - [`action`]: Gate actions and the fixed action-to-status table
//! - [`clock`]: Injectable time source
//! - [`config`]: TOML configuration for ledgers, in-flight tracking and storage
//! - [`error`]: Infrastructure error types shared by stores and ledgers
//! - [`event`]: The gate event wire contract
//! - [`guard`]: The consumer-side state machine
//! - [`inflight`]: Producer-side in-flight marks
//! - [`invariant`]: Canonical terminal states and gate marker vocabulary
//! - [`ledger`]: Bounded idempotency ledger
//! - [`sqlite`]: `SQLite` backed store and ledger
//! - [`state`]: Task status and entity snapshots
//! - [`store`]: Entity store contract and in-memory implementation
//! - [`write_filter`]: Terminal-state filter for direct writes

pub mod action;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod guard;
pub mod inflight;
pub mod invariant;
pub mod ledger;
pub mod sqlite;
pub mod state;
pub mod store;
pub mod write_filter;

pub use action::{ActionError, GateAction, resolve_target_status};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GuardConfig, InFlightConfig, LedgerConfig, StoreConfig};
pub use error::{GuardError, LedgerError, StoreError};
pub use event::{EventError, GateEvent};
pub use guard::{GateGuard, GateOutcome, Rejection};
pub use inflight::{EmissionDecision, InFlightTracker};
pub use invariant::{TerminalInvariant, TerminalViolation};
pub use ledger::{BoundedEventLedger, EventLedger};
pub use sqlite::{SqliteEntityStore, SqliteEventLedger};
pub use state::{EntitySnapshot, Metadata, ParseStatusError, TaskStatus};
pub use store::{EntityStore, EntityUpdate, InMemoryEntityStore, UpdateOutcome};
pub use write_filter::{DirectWrite, DirectWriteReport, TerminalWriteFilter};
