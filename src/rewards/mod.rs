//! Missions and achievements.

pub mod issuer;
pub mod models;

pub use issuer::{ClaimReceipt, RewardDefinition, RewardIssuer};
pub use models::{RewardKind, RewardProgress, UserProgress};
