//! In-memory `LedgerStore`
//!
//! One `parking_lot::Mutex` guards the whole state, so every method is
//! trivially atomic. Used by unit tests and by the server's `--in-memory` mode.
//! Faults can be armed at specific write points to exercise compensation paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::models::{
    Account, AppliedTransaction, BalanceGuard, IdempotencyKey, NewTransaction, Transaction,
};
use crate::ledger::store::LedgerStore;
use crate::market::scenario::{
    Payout, PayoutStatus, Prediction, PredictionStatus, Scenario, ScenarioStatus, Side,
};
use crate::rewards::models::{RewardProgress, UserProgress};
use crate::shop::models::{InventoryEntry, PurchaseRecord, ShopItem};

/// Write points where a one-shot storage failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    GrantPurchase,
    InsertPrediction,
    InsertPayout,
    UserProgress,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    transactions: Vec<Transaction>,
    idempotency: HashMap<IdempotencyKey, usize>,
    scenarios: HashMap<String, Scenario>,
    predictions: Vec<Prediction>,
    payouts: Vec<Payout>,
    items: HashMap<String, ShopItem>,
    inventory: HashMap<(String, String), i64>,
    purchases: HashMap<String, PurchaseRecord>,
    rewards: HashMap<(String, String), RewardProgress>,
    progress: HashMap<String, UserProgress>,
    faults: HashSet<FaultPoint>,
}

impl MemoryState {
    fn take_fault(&mut self, point: FaultPoint) -> LedgerResult<()> {
        if self.faults.remove(&point) {
            return Err(LedgerError::InternalError(format!(
                "injected fault at {:?}",
                point
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write at `point` with `InternalError`.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.state.lock().faults.insert(point);
    }

    /// Every ledger entry, oldest first.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.state.lock().transactions.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(&self, account: Account) -> LedgerResult<(Account, bool)> {
        let mut state = self.state.lock();
        if let Some(existing) = state.accounts.get(&account.id) {
            return Ok((existing.clone(), false));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok((account, true))
    }

    async fn get_account(&self, account_id: &str) -> LedgerResult<Option<Account>> {
        Ok(self.state.lock().accounts.get(account_id).cloned())
    }

    async fn apply_transaction(
        &self,
        entry: NewTransaction,
        guard: BalanceGuard,
    ) -> LedgerResult<AppliedTransaction> {
        let mut state = self.state.lock();
        let key = entry.idempotency_key();

        if let Some(key) = &key {
            if let Some(&idx) = state.idempotency.get(key) {
                return Ok(AppliedTransaction {
                    transaction: state.transactions[idx].clone(),
                    replayed: true,
                });
            }
        }

        let account = state
            .accounts
            .get_mut(&entry.account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(entry.account_id.clone()))?;

        if !guard.permits(account.balance, entry.amount) {
            return Err(LedgerError::InsufficientFunds {
                balance: account.balance,
                required: -entry.amount,
            });
        }

        account.apply(entry.kind, entry.amount)?;
        let tx = entry.into_transaction(account.balance);

        state.transactions.push(tx.clone());
        if let Some(key) = key {
            let idx = state.transactions.len() - 1;
            state.idempotency.insert(key, idx);
        }

        Ok(AppliedTransaction {
            transaction: tx,
            replayed: false,
        })
    }

    async fn find_transaction(&self, key: &IdempotencyKey) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock();
        Ok(state
            .idempotency
            .get(key)
            .map(|&idx| state.transactions[idx].clone()))
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ledger_sum(&self, account_id: &str) -> LedgerResult<(i64, usize)> {
        let state = self.state.lock();
        let (sum, count) = state
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .fold((0i64, 0usize), |(s, c), t| (s + t.amount, c + 1));
        Ok((sum, count))
    }

    async fn create_scenario(&self, scenario: Scenario) -> LedgerResult<()> {
        let mut state = self.state.lock();
        if state.scenarios.contains_key(&scenario.id) {
            return Err(LedgerError::ValidationError(format!(
                "scenario {} already exists",
                scenario.id
            )));
        }
        state.scenarios.insert(scenario.id.clone(), scenario);
        Ok(())
    }

    async fn get_scenario(&self, scenario_id: &str) -> LedgerResult<Option<Scenario>> {
        Ok(self.state.lock().scenarios.get(scenario_id).cloned())
    }

    async fn transition_scenario(
        &self,
        scenario_id: &str,
        from: &[ScenarioStatus],
        to: ScenarioStatus,
        result: Option<Side>,
        now: i64,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        let Some(scenario) = state.scenarios.get_mut(scenario_id) else {
            return Ok(false);
        };
        if !from.contains(&scenario.status) {
            return Ok(false);
        }
        scenario.status = to;
        if to.is_terminal() {
            scenario.resolved_at = Some(now);
        }
        if result.is_some() {
            scenario.result = result;
        }
        Ok(true)
    }

    async fn insert_prediction(&self, prediction: Prediction) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::InsertPrediction)?;
        let accepting = state
            .scenarios
            .get(&prediction.scenario_id)
            .is_some_and(|s| s.status == ScenarioStatus::Active);
        if !accepting {
            return Ok(false);
        }
        state.predictions.push(prediction);
        Ok(true)
    }

    async fn predictions_for_scenario(&self, scenario_id: &str) -> LedgerResult<Vec<Prediction>> {
        let state = self.state.lock();
        Ok(state
            .predictions
            .iter()
            .filter(|p| p.scenario_id == scenario_id)
            .cloned()
            .collect())
    }

    async fn settle_prediction(
        &self,
        prediction_id: &str,
        status: PredictionStatus,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        match state
            .predictions
            .iter_mut()
            .find(|p| p.id == prediction_id && p.status == PredictionStatus::Pending)
        {
            Some(p) => {
                p.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_payout(&self, payout: Payout) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::InsertPayout)?;
        let exists = state.payouts.iter().any(|p| {
            p.scenario_id == payout.scenario_id && p.recipient_id == payout.recipient_id
        });
        if exists {
            return Ok(false);
        }
        state.payouts.push(payout);
        Ok(true)
    }

    async fn update_payout(
        &self,
        scenario_id: &str,
        recipient_id: &str,
        status: PayoutStatus,
        transaction_id: Option<&str>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock();
        if let Some(p) = state
            .payouts
            .iter_mut()
            .find(|p| p.scenario_id == scenario_id && p.recipient_id == recipient_id)
        {
            p.status = status;
            if let Some(tx) = transaction_id {
                p.transaction_id = Some(tx.to_string());
            }
        }
        Ok(())
    }

    async fn payouts_for_scenario(&self, scenario_id: &str) -> LedgerResult<Vec<Payout>> {
        let state = self.state.lock();
        let mut out: Vec<Payout> = state
            .payouts
            .iter()
            .filter(|p| p.scenario_id == scenario_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.recipient_id.cmp(&b.recipient_id));
        Ok(out)
    }

    async fn upsert_item(&self, item: ShopItem) -> LedgerResult<()> {
        self.state.lock().items.insert(item.id.clone(), item);
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> LedgerResult<Option<ShopItem>> {
        Ok(self.state.lock().items.get(item_id).cloned())
    }

    async fn owned_quantity(&self, account_id: &str, item_id: &str) -> LedgerResult<i64> {
        let state = self.state.lock();
        Ok(state
            .inventory
            .get(&(account_id.to_string(), item_id.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn grant_purchase(&self, purchase: PurchaseRecord) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        if state.purchases.contains_key(&purchase.id) {
            return Ok(false);
        }
        state.take_fault(FaultPoint::GrantPurchase)?;

        let owned = state
            .inventory
            .get(&(purchase.account_id.clone(), purchase.item_id.clone()))
            .copied()
            .unwrap_or(0);
        let item = state
            .items
            .get_mut(&purchase.item_id)
            .ok_or_else(|| LedgerError::not_found("item", purchase.item_id.clone()))?;
        if let Some(max) = item.max_per_user {
            if owned + purchase.quantity > max {
                return Err(LedgerError::LimitExceeded {
                    item_id: purchase.item_id.clone(),
                    owned,
                    requested: purchase.quantity,
                    max,
                });
            }
        }
        if let Some(stock) = item.stock {
            if stock < purchase.quantity {
                return Err(LedgerError::StockExhausted {
                    item_id: purchase.item_id.clone(),
                    requested: purchase.quantity,
                    available: stock,
                });
            }
            item.stock = Some(stock - purchase.quantity);
        }

        *state
            .inventory
            .entry((purchase.account_id.clone(), purchase.item_id.clone()))
            .or_insert(0) += purchase.quantity;
        state.purchases.insert(purchase.id.clone(), purchase);
        Ok(true)
    }

    async fn get_purchase(&self, purchase_id: &str) -> LedgerResult<Option<PurchaseRecord>> {
        Ok(self.state.lock().purchases.get(purchase_id).cloned())
    }

    async fn inventory(&self, account_id: &str) -> LedgerResult<Vec<InventoryEntry>> {
        let state = self.state.lock();
        let mut out: Vec<InventoryEntry> = state
            .inventory
            .iter()
            .filter(|((acct, _), _)| acct == account_id)
            .map(|((acct, item), qty)| InventoryEntry {
                account_id: acct.clone(),
                item_id: item.clone(),
                quantity: *qty,
            })
            .collect();
        out.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(out)
    }

    async fn register_reward(&self, reward: RewardProgress) -> LedgerResult<RewardProgress> {
        let mut state = self.state.lock();
        let key = (reward.account_id.clone(), reward.reward_ref.clone());
        Ok(state.rewards.entry(key).or_insert(reward).clone())
    }

    async fn get_reward(
        &self,
        account_id: &str,
        reward_ref: &str,
    ) -> LedgerResult<Option<RewardProgress>> {
        let state = self.state.lock();
        Ok(state
            .rewards
            .get(&(account_id.to_string(), reward_ref.to_string()))
            .cloned())
    }

    async fn advance_reward(
        &self,
        account_id: &str,
        reward_ref: &str,
        delta: i64,
    ) -> LedgerResult<Option<RewardProgress>> {
        let mut state = self.state.lock();
        let Some(reward) = state
            .rewards
            .get_mut(&(account_id.to_string(), reward_ref.to_string()))
        else {
            return Ok(None);
        };
        reward.progress += delta;
        if reward.progress >= reward.target {
            reward.is_completed = true;
        }
        Ok(Some(reward.clone()))
    }

    async fn mark_reward_claimed(
        &self,
        account_id: &str,
        reward_ref: &str,
        now: i64,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        match state
            .rewards
            .get_mut(&(account_id.to_string(), reward_ref.to_string()))
        {
            Some(r) if r.is_completed && !r.is_claimed => {
                r.is_claimed = true;
                r.claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_reward_claim(&self, account_id: &str, reward_ref: &str) -> LedgerResult<bool> {
        let mut state = self.state.lock();
        match state
            .rewards
            .get_mut(&(account_id.to_string(), reward_ref.to_string()))
        {
            Some(r) if r.is_claimed => {
                r.is_claimed = false;
                r.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_user_progress(
        &self,
        account_id: &str,
        xp: i64,
        achievement_points: i64,
    ) -> LedgerResult<UserProgress> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::UserProgress)?;
        let entry = state
            .progress
            .entry(account_id.to_string())
            .or_insert_with(|| UserProgress {
                account_id: account_id.to_string(),
                ..Default::default()
            });
        entry.xp += xp;
        entry.achievement_points += achievement_points;
        Ok(entry.clone())
    }

    async fn get_user_progress(&self, account_id: &str) -> LedgerResult<UserProgress> {
        let state = self.state.lock();
        Ok(state
            .progress
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| UserProgress {
                account_id: account_id.to_string(),
                ..Default::default()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::TransactionType;

    fn badge(max_per_user: Option<i64>) -> ShopItem {
        ShopItem {
            id: "badge".into(),
            name: "Badge".into(),
            price: 10,
            discount_price: None,
            stock: None,
            max_per_user,
            is_active: true,
        }
    }

    fn purchase(id: &str, quantity: i64) -> PurchaseRecord {
        PurchaseRecord {
            id: id.into(),
            account_id: "alice".into(),
            item_id: "badge".into(),
            quantity,
            unit_price: 10,
            total: 10 * quantity,
            transaction_id: "tx".into(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_grant_refuses_to_exceed_per_user_limit() {
        let store = InMemoryLedgerStore::new();
        store.upsert_item(badge(Some(3))).await.unwrap();

        assert!(store.grant_purchase(purchase("p1", 2)).await.unwrap());
        let err = store.grant_purchase(purchase("p2", 2)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::LimitExceeded {
                item_id: "badge".into(),
                owned: 2,
                requested: 2,
                max: 3,
            }
        );
        assert_eq!(store.owned_quantity("alice", "badge").await.unwrap(), 2);
        assert!(store.get_purchase("p2").await.unwrap().is_none());

        assert!(store.grant_purchase(purchase("p3", 1)).await.unwrap());
        assert_eq!(store.owned_quantity("alice", "badge").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_overflowing_credit_leaves_state_untouched() {
        let store = InMemoryLedgerStore::new();
        store
            .create_account(Account::new("whale", i64::MAX, false, 0))
            .await
            .unwrap();

        let err = store
            .apply_transaction(
                NewTransaction {
                    id: "t1".into(),
                    account_id: "whale".into(),
                    kind: TransactionType::Bonus,
                    amount: 1,
                    description: "bonus".into(),
                    reference: None,
                    metadata: None,
                    created_at: 0,
                },
                BalanceGuard::NonNegative,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(
            store.get_account("whale").await.unwrap().unwrap().balance,
            i64::MAX
        );
        assert!(store.all_transactions().is_empty());
    }
}
