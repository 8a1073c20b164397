//! RewardIssuer
//!
//! Missions and achievements credit AP Coins once. The `is_claimed` flag on
//! the progress row is flipped with a conditional update before any credit;
//! only the caller that flips it records the `Bonus`. XP and achievement
//! points live outside the ledger and are best-effort.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::models::{TransactionType, TxReference};
use crate::ledger::recorder::{RecordRequest, TransactionRecorder};
use crate::ledger::store::LedgerStore;
use crate::rewards::models::{RewardKind, RewardProgress, UserProgress};

/// What completing a reward takes and what it pays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardDefinition {
    pub reward_ref: String,
    pub kind: RewardKind,
    pub target: i64,
    pub ap_coins: i64,
    #[serde(default)]
    pub xp: i64,
    #[serde(default)]
    pub achievement_points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub reward_ref: String,
    pub credited: i64,
    pub new_balance: i64,
    pub xp: i64,
    pub achievement_points: i64,
}

pub struct RewardIssuer {
    recorder: Arc<TransactionRecorder>,
    store: Arc<dyn LedgerStore>,
}

impl RewardIssuer {
    pub fn new(recorder: Arc<TransactionRecorder>) -> Self {
        let store = recorder.store().clone();
        Self { recorder, store }
    }

    /// Attach a reward to an account. Registering an existing reward returns
    /// the stored row unchanged.
    pub async fn register(
        &self,
        account_id: &str,
        definition: RewardDefinition,
    ) -> LedgerResult<RewardProgress> {
        if definition.reward_ref.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "reward ref is required".to_string(),
            ));
        }
        if definition.target <= 0 {
            return Err(LedgerError::ValidationError(format!(
                "target must be positive, got {}",
                definition.target
            )));
        }
        if definition.ap_coins < 0 || definition.xp < 0 || definition.achievement_points < 0 {
            return Err(LedgerError::InvalidAmount(
                "reward amounts must not be negative".to_string(),
            ));
        }
        // Fails with AccountNotFound for unknown accounts
        self.recorder.wallet_stats(account_id).await?;

        self.store
            .register_reward(RewardProgress {
                account_id: account_id.to_string(),
                reward_ref: definition.reward_ref,
                kind: definition.kind,
                progress: 0,
                target: definition.target,
                is_completed: false,
                is_claimed: false,
                ap_coins: definition.ap_coins,
                xp: definition.xp,
                achievement_points: definition.achievement_points,
                claimed_at: None,
            })
            .await
    }

    pub async fn get(&self, account_id: &str, reward_ref: &str) -> LedgerResult<RewardProgress> {
        self.store
            .get_reward(account_id, reward_ref)
            .await?
            .ok_or_else(|| LedgerError::not_found("reward", reward_ref))
    }

    pub async fn advance(
        &self,
        account_id: &str,
        reward_ref: &str,
        delta: i64,
    ) -> LedgerResult<RewardProgress> {
        if delta <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "progress delta must be positive, got {delta}"
            )));
        }
        let reward = self
            .store
            .advance_reward(account_id, reward_ref, delta)
            .await?
            .ok_or_else(|| LedgerError::not_found("reward", reward_ref))?;
        if reward.is_completed {
            info!(account_id, reward_ref, "Reward completed");
        }
        Ok(reward)
    }

    pub async fn progress(&self, account_id: &str) -> LedgerResult<UserProgress> {
        self.store.get_user_progress(account_id).await
    }

    /// Credit a completed reward exactly once.
    pub async fn claim(&self, account_id: &str, reward_ref: &str) -> LedgerResult<ClaimReceipt> {
        let reward = self.get(account_id, reward_ref).await?;
        if !reward.is_completed {
            return Err(LedgerError::RewardNotCompleted(reward_ref.to_string()));
        }

        let now = chrono::Utc::now().timestamp_millis();
        if !self
            .store
            .mark_reward_claimed(account_id, reward_ref, now)
            .await?
        {
            return Err(LedgerError::AlreadyClaimed(reward_ref.to_string()));
        }

        let new_balance = if reward.ap_coins > 0 {
            let credit = self
                .recorder
                .record(
                    RecordRequest::new(
                        account_id,
                        TransactionType::Bonus,
                        reward.ap_coins,
                        &format!("Reward: {reward_ref}"),
                    )
                    .with_reference(TxReference::reward(reward_ref))
                    .with_metadata(serde_json::json!({ "kind": reward.kind.as_str() })),
                )
                .await;
            match credit {
                Ok(outcome) => outcome.new_balance,
                Err(e) => {
                    // Reopen the claim so the user can retry
                    if let Err(release) = self.store.release_reward_claim(account_id, reward_ref).await {
                        warn!(account_id, reward_ref, error = %release, "Claim flag not released");
                    }
                    return Err(e);
                }
            }
        } else {
            self.recorder.wallet_stats(account_id).await?.balance
        };

        if reward.xp > 0 || reward.achievement_points > 0 {
            if let Err(e) = self
                .store
                .add_user_progress(account_id, reward.xp, reward.achievement_points)
                .await
            {
                warn!(account_id, reward_ref, error = %e, "XP not recorded for claimed reward");
            }
        }

        info!(account_id, reward_ref, credited = reward.ap_coins, "Reward claimed");
        Ok(ClaimReceipt {
            reward_ref: reward_ref.to_string(),
            credited: reward.ap_coins,
            new_balance,
            xp: reward.xp,
            achievement_points: reward.achievement_points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{FaultPoint, InMemoryLedgerStore};

    fn mission(reward_ref: &str, target: i64, ap_coins: i64) -> RewardDefinition {
        RewardDefinition {
            reward_ref: reward_ref.to_string(),
            kind: RewardKind::Mission,
            target,
            ap_coins,
            xp: 50,
            achievement_points: 5,
        }
    }

    async fn setup() -> (Arc<RewardIssuer>, Arc<TransactionRecorder>, Arc<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let recorder = Arc::new(TransactionRecorder::new(store.clone()).with_welcome_bonus(100));
        recorder.open_account("alice", false).await.unwrap();
        let issuer = Arc::new(RewardIssuer::new(recorder.clone()));
        (issuer, recorder, store)
    }

    #[tokio::test]
    async fn test_claim_requires_completion() {
        let (issuer, _recorder, _store) = setup().await;
        issuer.register("alice", mission("daily-login", 3, 200)).await.unwrap();

        let err = issuer.claim("alice", "daily-login").await.unwrap_err();
        assert_eq!(err, LedgerError::RewardNotCompleted("daily-login".into()));

        let progress = issuer.advance("alice", "daily-login", 2).await.unwrap();
        assert!(!progress.is_completed);
        let progress = issuer.advance("alice", "daily-login", 1).await.unwrap();
        assert!(progress.is_completed);
    }

    #[tokio::test]
    async fn test_claim_credits_once() {
        let (issuer, recorder, _store) = setup().await;
        issuer.register("alice", mission("first-bet", 1, 250)).await.unwrap();
        issuer.advance("alice", "first-bet", 1).await.unwrap();

        let receipt = issuer.claim("alice", "first-bet").await.unwrap();
        assert_eq!(receipt.credited, 250);
        assert_eq!(receipt.new_balance, 350);

        let err = issuer.claim("alice", "first-bet").await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyClaimed("first-bet".into()));
        assert_eq!(recorder.wallet_stats("alice").await.unwrap().balance, 350);

        let progress = issuer.progress("alice").await.unwrap();
        assert_eq!(progress.xp, 50);
        assert_eq!(progress.achievement_points, 5);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_credit() {
        let (issuer, recorder, store) = setup().await;
        issuer.register("alice", mission("streak", 1, 500)).await.unwrap();
        issuer.advance("alice", "streak", 1).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let issuer = issuer.clone();
                tokio::spawn(async move { issuer.claim("alice", "streak").await })
            })
            .collect();

        let mut credited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => credited += 1,
                Err(e) => assert_eq!(e, LedgerError::AlreadyClaimed("streak".into())),
            }
        }
        assert_eq!(credited, 1);
        assert_eq!(recorder.wallet_stats("alice").await.unwrap().balance, 600);
        let bonuses = store
            .all_transactions()
            .iter()
            .filter(|t| t.reference_type.as_deref() == Some("reward"))
            .count();
        assert_eq!(bonuses, 1);
    }

    #[tokio::test]
    async fn test_failed_credit_reopens_claim() {
        let (issuer, _recorder, store) = setup().await;
        // Row for an account the ledger does not know
        store
            .register_reward(RewardProgress {
                account_id: "ghost".into(),
                reward_ref: "orphan".into(),
                kind: RewardKind::Achievement,
                progress: 1,
                target: 1,
                is_completed: true,
                is_claimed: false,
                ap_coins: 100,
                xp: 0,
                achievement_points: 0,
                claimed_at: None,
            })
            .await
            .unwrap();

        let err = issuer.claim("ghost", "orphan").await.unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound("ghost".into()));
        let reward = issuer.get("ghost", "orphan").await.unwrap();
        assert!(!reward.is_claimed);
    }

    #[tokio::test]
    async fn test_progress_failure_does_not_undo_credit() {
        let (issuer, recorder, store) = setup().await;
        issuer.register("alice", mission("quest", 1, 40)).await.unwrap();
        issuer.advance("alice", "quest", 5).await.unwrap();

        store.inject_fault(FaultPoint::UserProgress);
        let receipt = issuer.claim("alice", "quest").await.unwrap();
        assert_eq!(receipt.new_balance, 140);
        assert_eq!(recorder.wallet_stats("alice").await.unwrap().balance, 140);
        assert_eq!(issuer.progress("alice").await.unwrap().xp, 0);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (issuer, _recorder, _store) = setup().await;

        let err = issuer.register("alice", mission("bad", 0, 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ValidationError(_)));
        let err = issuer.register("nobody", mission("ok", 1, 10)).await.unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound("nobody".into()));
        let err = issuer.advance("alice", "unknown", 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "reward", .. }));
    }
}
