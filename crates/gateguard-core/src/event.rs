//! Gate event wire contract.
//!
//! Events travel as JSON objects:
//!
//! ```json
//! {
//!   "eventId": "6f1c...",
//!   "targetId": "task-42",
//!   "action": "challenge",
//!   "createdAt": "2026-01-05T10:00:00Z",
//!   "payload": { "finding": "..." }
//! }
//! ```
//!
//! Decoding validates the action against the fixed table and rejects empty
//! identifiers, so a [`GateEvent`] value is always well formed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::action::{ActionError, GateAction};

/// Errors raised while decoding a gate event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// The input was not a structurally valid event object.
    #[error("malformed gate event: {0}")]
    Json(#[from] serde_json::Error),

    /// The action is not in the recognized set.
    #[error(transparent)]
    UnknownAction(#[from] ActionError),

    /// A required identifier was empty.
    #[error("gate event field '{field}' must not be empty")]
    EmptyField {
        /// The offending field name.
        field: &'static str,
    },
}

/// A verdict produced by the adversary gate for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireGateEvent")]
pub struct GateEvent {
    /// Producer-assigned, globally unique event ID.
    pub event_id: String,
    /// ID of the entity this verdict targets.
    pub target_id: String,
    /// The verdict action.
    pub action: GateAction,
    /// Producer timestamp.
    pub created_at: DateTime<Utc>,
    /// Opaque producer payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Raw wire shape, before the action and identifiers are validated.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGateEvent {
    event_id: String,
    target_id: String,
    action: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

impl TryFrom<WireGateEvent> for GateEvent {
    type Error = EventError;

    fn try_from(wire: WireGateEvent) -> Result<Self, Self::Error> {
        if wire.event_id.is_empty() {
            return Err(EventError::EmptyField { field: "eventId" });
        }
        if wire.target_id.is_empty() {
            return Err(EventError::EmptyField { field: "targetId" });
        }
        let action = wire.action.parse()?;
        Ok(Self {
            event_id: wire.event_id,
            target_id: wire.target_id,
            action,
            created_at: wire.created_at,
            payload: wire.payload,
        })
    }
}

impl GateEvent {
    /// Creates an event with a freshly generated UUIDv4 `event_id`.
    ///
    /// Producers call this once per verdict; redeliveries reuse the value.
    #[must_use]
    pub fn new(
        target_id: impl Into<String>,
        action: GateAction,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), target_id, action, created_at)
    }

    /// Creates an event with an explicit `event_id`.
    #[must_use]
    pub fn with_id(
        event_id: impl Into<String>,
        target_id: impl Into<String>,
        action: GateAction,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            target_id: target_id.into(),
            action,
            created_at,
            payload: None,
        }
    }

    /// Attaches an opaque payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Decodes an event from its JSON wire form.
    ///
    /// Unlike going through `serde_json` directly, this keeps the action
    /// rejection as a typed [`EventError::UnknownAction`].
    pub fn from_json(input: &str) -> Result<Self, EventError> {
        let wire: WireGateEvent = serde_json::from_str(input)?;
        Self::try_from(wire)
    }

    /// Encodes the event to its JSON wire form.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}
