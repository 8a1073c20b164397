//! Storage interface
//!
//! All persisted state goes through `LedgerStore`. Implementations must make
//! every method that says "atomically" a single serializable unit against
//! concurrent callers (other tasks and other processes sharing the database).
//! Nothing outside [`crate::ledger::TransactionRecorder`] calls
//! [`LedgerStore::apply_transaction`].

use async_trait::async_trait;

use crate::error::LedgerResult;
use crate::ledger::models::{
    Account, AppliedTransaction, BalanceGuard, IdempotencyKey, NewTransaction, Transaction,
};
use crate::market::scenario::{
    Payout, PayoutStatus, Prediction, PredictionStatus, Scenario, ScenarioStatus, Side,
};
use crate::rewards::models::{RewardProgress, UserProgress};
use crate::shop::models::{InventoryEntry, PurchaseRecord, ShopItem};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- accounts & transactions ----

    /// Insert the account unless one with the same id exists.
    /// Returns the stored account and whether it was created.
    async fn create_account(&self, account: Account) -> LedgerResult<(Account, bool)>;

    async fn get_account(&self, account_id: &str) -> LedgerResult<Option<Account>>;

    /// Atomically:
    /// 1. if the entry has an idempotency key and a matching entry exists,
    ///    return it with `replayed = true` and change nothing;
    /// 2. add `amount` to the balance if `guard` permits it against the
    ///    current stored balance, else fail with `InsufficientFunds`;
    /// 3. bump lifetime counters and append the entry with `balance_after`.
    async fn apply_transaction(
        &self,
        entry: NewTransaction,
        guard: BalanceGuard,
    ) -> LedgerResult<AppliedTransaction>;

    async fn find_transaction(&self, key: &IdempotencyKey) -> LedgerResult<Option<Transaction>>;

    /// Newest first.
    async fn list_transactions(&self, account_id: &str, limit: usize)
        -> LedgerResult<Vec<Transaction>>;

    /// `(Σ amount, entry count)` over the account's ledger.
    async fn ledger_sum(&self, account_id: &str) -> LedgerResult<(i64, usize)>;

    // ---- scenarios ----

    async fn create_scenario(&self, scenario: Scenario) -> LedgerResult<()>;

    async fn get_scenario(&self, scenario_id: &str) -> LedgerResult<Option<Scenario>>;

    /// Conditional status update: succeeds only if the current status is one
    /// of `from`. Returns false when the row did not match.
    async fn transition_scenario(
        &self,
        scenario_id: &str,
        from: &[ScenarioStatus],
        to: ScenarioStatus,
        result: Option<Side>,
        now: i64,
    ) -> LedgerResult<bool>;

    /// Atomically insert the stake only while its scenario is `Active`.
    /// Returns false (and inserts nothing) otherwise, so a stake can never
    /// land after the resolution gate has closed.
    async fn insert_prediction(&self, prediction: Prediction) -> LedgerResult<bool>;

    async fn predictions_for_scenario(&self, scenario_id: &str) -> LedgerResult<Vec<Prediction>>;

    /// Moves a prediction out of `Pending`. Returns false if already settled.
    async fn settle_prediction(
        &self,
        prediction_id: &str,
        status: PredictionStatus,
    ) -> LedgerResult<bool>;

    /// Returns false when a row for `(scenario_id, recipient_id)` exists.
    async fn insert_payout(&self, payout: Payout) -> LedgerResult<bool>;

    async fn update_payout(
        &self,
        scenario_id: &str,
        recipient_id: &str,
        status: PayoutStatus,
        transaction_id: Option<&str>,
    ) -> LedgerResult<()>;

    async fn payouts_for_scenario(&self, scenario_id: &str) -> LedgerResult<Vec<Payout>>;

    // ---- shop ----

    async fn upsert_item(&self, item: ShopItem) -> LedgerResult<()>;

    async fn get_item(&self, item_id: &str) -> LedgerResult<Option<ShopItem>>;

    async fn owned_quantity(&self, account_id: &str, item_id: &str) -> LedgerResult<i64>;

    /// Atomically decrement tracked stock, add to the buyer's inventory and
    /// write the purchase row. Returns false (and changes nothing) if the
    /// purchase id was already granted; fails with `StockExhausted` if stock
    /// no longer covers the quantity, or `LimitExceeded` if the buyer would
    /// end up holding more than the item's `max_per_user`.
    async fn grant_purchase(&self, purchase: PurchaseRecord) -> LedgerResult<bool>;

    async fn get_purchase(&self, purchase_id: &str) -> LedgerResult<Option<PurchaseRecord>>;

    async fn inventory(&self, account_id: &str) -> LedgerResult<Vec<InventoryEntry>>;

    // ---- rewards ----

    /// Insert unless a row for `(account_id, reward_ref)` exists; returns the stored row.
    async fn register_reward(&self, reward: RewardProgress) -> LedgerResult<RewardProgress>;

    async fn get_reward(&self, account_id: &str, reward_ref: &str)
        -> LedgerResult<Option<RewardProgress>>;

    /// Add to progress, marking the reward completed once it meets its target.
    async fn advance_reward(
        &self,
        account_id: &str,
        reward_ref: &str,
        delta: i64,
    ) -> LedgerResult<Option<RewardProgress>>;

    /// Conditional `is_claimed = true WHERE is_claimed = false AND is_completed`.
    async fn mark_reward_claimed(
        &self,
        account_id: &str,
        reward_ref: &str,
        now: i64,
    ) -> LedgerResult<bool>;

    /// Undo a claim flag whose credit failed.
    async fn release_reward_claim(&self, account_id: &str, reward_ref: &str) -> LedgerResult<bool>;

    async fn add_user_progress(
        &self,
        account_id: &str,
        xp: i64,
        achievement_points: i64,
    ) -> LedgerResult<UserProgress>;

    async fn get_user_progress(&self, account_id: &str) -> LedgerResult<UserProgress>;
}
