//! Scenario, prediction and payout records plus the scenario status machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "YES" => Some(Side::Yes),
            "NO" => Some(Side::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Draft,
    Active,
    Closed,
    Resolved,
    Cancelled,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Draft => "draft",
            ScenarioStatus::Active => "active",
            ScenarioStatus::Closed => "closed",
            ScenarioStatus::Resolved => "resolved",
            ScenarioStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ScenarioStatus::Draft),
            "active" => Some(ScenarioStatus::Active),
            "closed" => Some(ScenarioStatus::Closed),
            "resolved" => Some(ScenarioStatus::Resolved),
            "cancelled" => Some(ScenarioStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioStatus::Resolved | ScenarioStatus::Cancelled)
    }

    /// Statuses from which `to` may be entered. Transitions only move forward.
    pub fn sources_for(to: ScenarioStatus) -> &'static [ScenarioStatus] {
        match to {
            ScenarioStatus::Draft => &[],
            ScenarioStatus::Active => &[ScenarioStatus::Draft],
            ScenarioStatus::Closed => &[ScenarioStatus::Active],
            ScenarioStatus::Resolved => &[ScenarioStatus::Active, ScenarioStatus::Closed],
            ScenarioStatus::Cancelled => &[
                ScenarioStatus::Draft,
                ScenarioStatus::Active,
                ScenarioStatus::Closed,
            ],
        }
    }

    pub fn can_transition_to(&self, to: ScenarioStatus) -> bool {
        Self::sources_for(to).contains(self)
    }

    pub fn check_transition(&self, to: ScenarioStatus) -> Result<(), LedgerError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(LedgerError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prediction market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    pub title: String,
    pub creator_id: Option<String>,
    pub status: ScenarioStatus,
    /// Set only on resolution
    pub result: Option<Side>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Pending,
    Won,
    Lost,
    Refunded,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "pending",
            PredictionStatus::Won => "won",
            PredictionStatus::Lost => "lost",
            PredictionStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PredictionStatus::Pending),
            "won" => Some(PredictionStatus::Won),
            "lost" => Some(PredictionStatus::Lost),
            "refunded" => Some(PredictionStatus::Refunded),
            _ => None,
        }
    }
}

/// One user's stake on a scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: String,
    pub scenario_id: String,
    pub user_id: String,
    pub side: Side,
    pub amount: i64,
    pub status: PredictionStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "completed" => Some(PayoutStatus::Completed),
            "failed" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }
}

/// Settlement of one scenario for one recipient. At most one per
/// `(scenario_id, recipient_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub id: String,
    pub scenario_id: String,
    pub recipient_id: String,
    pub payout_amount: i64,
    pub pool_total: i64,
    /// False when nobody staked the winning side (or the scenario was cancelled)
    pub was_fulfilled: bool,
    pub status: PayoutStatus,
    pub transaction_id: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        use ScenarioStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));
        assert!(Active.can_transition_to(Resolved));
        assert!(Closed.can_transition_to(Resolved));
        assert!(Closed.can_transition_to(Cancelled));

        assert!(!Draft.can_transition_to(Resolved));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Resolved.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Active));
    }

    #[test]
    fn test_check_transition_error() {
        let err = ScenarioStatus::Resolved
            .check_transition(ScenarioStatus::Active)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                from: "resolved".into(),
                to: "active".into()
            }
        );
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!(Side::from_str("yes"), Some(Side::Yes));
        assert_eq!(Side::from_str("NO"), Some(Side::No));
        assert_eq!(Side::from_str("maybe"), None);
        assert_eq!(serde_json::to_string(&Side::Yes).unwrap(), "\"YES\"");
    }
}
