//! Gate actions and the status each one imposes.
//!
//! The mapping is a fixed table:
//!
//! | action            | target status          |
//! |-------------------|------------------------|
//! | `challenge`       | `review`               |
//! | `reject`          | `review`               |
//! | `request_changes` | `needs_clarification`  |
//! | `block`           | `needs_clarification`  |
//!
//! Anything else is rejected with [`ActionError::Unknown`] rather than mapped
//! to a default, so a misbehaving producer surfaces instead of silently
//! moving tasks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TaskStatus;

/// Verdict action carried by a gate event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    /// The reviewer challenged the work.
    Challenge,
    /// The reviewer rejected the work.
    Reject,
    /// The reviewer asked for changes.
    RequestChanges,
    /// The reviewer blocked the work pending clarification.
    Block,
}

impl GateAction {
    /// Every recognized action.
    pub const ALL: [Self; 4] = [
        Self::Challenge,
        Self::Reject,
        Self::RequestChanges,
        Self::Block,
    ];

    /// Returns the wire name of this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Challenge => "challenge",
            Self::Reject => "reject",
            Self::RequestChanges => "request_changes",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for actions outside the recognized set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ActionError {
    /// The action name is not one of [`GateAction::ALL`].
    #[error("unknown gate action: '{action}'")]
    Unknown {
        /// The rejected action name.
        action: String,
    },
}

impl FromStr for GateAction {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ActionError::Unknown {
                action: s.to_string(),
            })
    }
}

/// Returns the status a gate action imposes on its target.
#[must_use]
pub const fn resolve_target_status(action: GateAction) -> TaskStatus {
    match action {
        GateAction::Challenge | GateAction::Reject => TaskStatus::Review,
        GateAction::RequestChanges | GateAction::Block => TaskStatus::NeedsClarification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_challenge_and_reject_to_review() {
        assert_eq!(resolve_target_status(GateAction::Challenge), TaskStatus::Review);
        assert_eq!(resolve_target_status(GateAction::Reject), TaskStatus::Review);
    }

    #[test]
    fn test_resolve_request_changes_and_block_to_needs_clarification() {
        assert_eq!(
            resolve_target_status(GateAction::RequestChanges),
            TaskStatus::NeedsClarification
        );
        assert_eq!(
            resolve_target_status(GateAction::Block),
            TaskStatus::NeedsClarification
        );
    }

    #[test]
    fn test_no_action_resolves_to_terminal() {
        for action in GateAction::ALL {
            assert!(!resolve_target_status(action).is_terminal(), "{action}");
        }
    }

    #[test]
    fn test_parse_known_actions() {
        assert_eq!("challenge".parse(), Ok(GateAction::Challenge));
        assert_eq!("request_changes".parse(), Ok(GateAction::RequestChanges));
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        assert_eq!(
            "approve".parse::<GateAction>(),
            Err(ActionError::Unknown {
                action: "approve".to_string()
            })
        );
        // Case matters: producers must send the canonical wire name.
        assert!("Challenge".parse::<GateAction>().is_err());
    }
}
