use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Mission,
    Achievement,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::Mission => "mission",
            RewardKind::Achievement => "achievement",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "mission" => Some(RewardKind::Mission),
            "achievement" => Some(RewardKind::Achievement),
            _ => None,
        }
    }
}

/// Per-account progress towards one mission or achievement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardProgress {
    pub account_id: String,
    pub reward_ref: String,
    pub kind: RewardKind,
    pub progress: i64,
    pub target: i64,
    pub is_completed: bool,
    pub is_claimed: bool,
    pub ap_coins: i64,
    pub xp: i64,
    pub achievement_points: i64,
    pub claimed_at: Option<i64>,
}

/// Non-monetary progression; not part of the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    pub account_id: String,
    pub xp: i64,
    pub achievement_points: i64,
}
