//! Ledger Models
//! Accounts, immutable transaction entries, and the reference keys that make
//! balance mutations idempotent.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// A user's spendable AP Coin balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: i64,
    /// Balance before the first ledger entry; conservation is checked against it
    pub initial_balance: i64,
    pub lifetime_purchased: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
    /// Staff capability: debits skip the non-negative precondition
    pub has_unlimited_balance: bool,
    pub created_at: i64,
}

impl Account {
    pub fn new(id: &str, initial_balance: i64, has_unlimited_balance: bool, now: i64) -> Self {
        Self {
            id: id.to_string(),
            balance: initial_balance,
            initial_balance,
            lifetime_purchased: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
            has_unlimited_balance,
            created_at: now,
        }
    }

    /// Apply a signed delta and the lifetime counters it implies. Nothing is
    /// mutated when the balance or a counter would leave the i64 range.
    pub fn apply(&mut self, kind: TransactionType, amount: i64) -> LedgerResult<()> {
        let delta = kind.counter_delta(amount);
        let overflow = || {
            LedgerError::InvalidAmount(format!(
                "{kind} of {amount} overflows account {}",
                self.id
            ))
        };
        let balance = self.balance.checked_add(amount).ok_or_else(overflow)?;
        let purchased = self
            .lifetime_purchased
            .checked_add(delta.purchased)
            .ok_or_else(overflow)?;
        let earned = self
            .lifetime_earned
            .checked_add(delta.earned)
            .ok_or_else(overflow)?;
        let spent = self
            .lifetime_spent
            .checked_add(delta.spent)
            .ok_or_else(overflow)?
            .max(0);

        self.balance = balance;
        self.lifetime_purchased = purchased;
        self.lifetime_earned = earned;
        self.lifetime_spent = spent;
        Ok(())
    }

    pub fn stats(&self) -> WalletStats {
        WalletStats {
            account_id: self.id.clone(),
            balance: self.balance,
            lifetime_purchased: self.lifetime_purchased,
            lifetime_earned: self.lifetime_earned,
            lifetime_spent: self.lifetime_spent,
            has_unlimited_balance: self.has_unlimited_balance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Coins bought with real money
    Purchase,
    ScenarioPayout,
    ScenarioSteal,
    ItemPurchase,
    Refund,
    AdminAdjustment,
    Bonus,
    PredictionBet,
    PredictionWin,
}

/// Lifetime counter movements implied by one entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub purchased: i64,
    pub earned: i64,
    pub spent: i64,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::ScenarioPayout => "scenario_payout",
            TransactionType::ScenarioSteal => "scenario_steal",
            TransactionType::ItemPurchase => "item_purchase",
            TransactionType::Refund => "refund",
            TransactionType::AdminAdjustment => "admin_adjustment",
            TransactionType::Bonus => "bonus",
            TransactionType::PredictionBet => "prediction_bet",
            TransactionType::PredictionWin => "prediction_win",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(TransactionType::Purchase),
            "scenario_payout" => Some(TransactionType::ScenarioPayout),
            "scenario_steal" => Some(TransactionType::ScenarioSteal),
            "item_purchase" => Some(TransactionType::ItemPurchase),
            "refund" => Some(TransactionType::Refund),
            "admin_adjustment" => Some(TransactionType::AdminAdjustment),
            "bonus" => Some(TransactionType::Bonus),
            "prediction_bet" => Some(TransactionType::PredictionBet),
            "prediction_win" => Some(TransactionType::PredictionWin),
            _ => None,
        }
    }

    /// Purchases feed `lifetime_purchased`; winnings and bonuses feed
    /// `lifetime_earned`; item buys and stakes feed `lifetime_spent`, which a
    /// refund winds back. Admin adjustments touch no counter.
    pub fn counter_delta(&self, amount: i64) -> CounterDelta {
        let mut delta = CounterDelta::default();
        match self {
            TransactionType::Purchase => delta.purchased = amount,
            TransactionType::ScenarioPayout
            | TransactionType::PredictionWin
            | TransactionType::Bonus => delta.earned = amount.max(0),
            TransactionType::ItemPurchase | TransactionType::PredictionBet => {
                delta.spent = (-amount).max(0)
            }
            TransactionType::ScenarioSteal => {
                if amount >= 0 {
                    delta.earned = amount;
                } else {
                    delta.spent = -amount;
                }
            }
            TransactionType::Refund => delta.spent = -amount.max(0),
            TransactionType::AdminAdjustment => {}
        }
        delta
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External reference a ledger entry is bound to (scenario, purchase, reward, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxReference {
    pub reference_type: String,
    pub reference_id: String,
}

impl TxReference {
    pub fn new(reference_type: &str, reference_id: &str) -> Self {
        Self {
            reference_type: reference_type.to_string(),
            reference_id: reference_id.to_string(),
        }
    }

    pub fn scenario(scenario_id: &str) -> Self {
        Self::new("scenario", scenario_id)
    }

    pub fn prediction(prediction_id: &str) -> Self {
        Self::new("prediction", prediction_id)
    }

    pub fn purchase(purchase_id: &str) -> Self {
        Self::new("purchase", purchase_id)
    }

    pub fn reward(reward_ref: &str) -> Self {
        Self::new("reward", reward_ref)
    }

    pub fn welcome(account_id: &str) -> Self {
        Self::new("welcome", account_id)
    }

    /// Compensation entries point back at the transaction they undo.
    pub fn compensation(transaction_id: &str) -> Self {
        Self::new("compensation", transaction_id)
    }
}

/// Idempotency key: at most one entry per account, reference and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub account_id: String,
    pub reference: TxReference,
    pub kind: TransactionType,
}

/// One immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

impl Transaction {
    pub fn reference(&self) -> Option<TxReference> {
        match (&self.reference_type, &self.reference_id) {
            (Some(t), Some(id)) => Some(TxReference::new(t, id)),
            _ => None,
        }
    }
}

/// Entry handed to the store; the store fills in `balance_after`.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: String,
    pub account_id: String,
    pub kind: TransactionType,
    pub amount: i64,
    pub description: String,
    pub reference: Option<TxReference>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

impl NewTransaction {
    pub fn idempotency_key(&self) -> Option<IdempotencyKey> {
        self.reference.as_ref().map(|reference| IdempotencyKey {
            account_id: self.account_id.clone(),
            reference: reference.clone(),
            kind: self.kind,
        })
    }

    pub fn into_transaction(self, balance_after: i64) -> Transaction {
        let (reference_type, reference_id) = match self.reference {
            Some(r) => (Some(r.reference_type), Some(r.reference_id)),
            None => (None, None),
        };
        Transaction {
            id: self.id,
            account_id: self.account_id,
            kind: self.kind,
            amount: self.amount,
            balance_after,
            description: self.description,
            reference_type,
            reference_id,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

/// How the store must guard a debit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceGuard {
    /// Reject unless `balance + amount >= 0`
    NonNegative,
    /// Unlimited accounts: apply unconditionally
    Unbounded,
}

impl BalanceGuard {
    pub fn permits(&self, balance: i64, amount: i64) -> bool {
        match self {
            BalanceGuard::NonNegative => {
                amount >= 0 || balance.checked_add(amount).is_some_and(|b| b >= 0)
            }
            BalanceGuard::Unbounded => true,
        }
    }
}

/// Result of the store's atomic apply
#[derive(Debug, Clone)]
pub struct AppliedTransaction {
    pub transaction: Transaction,
    /// True when an entry with the same idempotency key already existed
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletStats {
    pub account_id: String,
    pub balance: i64,
    pub lifetime_purchased: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
    pub has_unlimited_balance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub account_id: String,
    pub initial_balance: i64,
    pub ledger_sum: i64,
    pub expected_balance: i64,
    pub actual_balance: i64,
    pub entries: usize,
    pub consistent: bool,
}
