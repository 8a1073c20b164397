//! TransactionRecorder
//!
//! The only path by which a balance changes. Every caller (market, shop,
//! rewards, the HTTP layer) builds a [`RecordRequest`] and goes through
//! [`TransactionRecorder::record`]; the unlimited-balance capability is read
//! here once per call and turned into a [`BalanceGuard`] for the store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::models::{
    Account, BalanceGuard, IdempotencyKey, NewTransaction, ReconcileReport, Transaction, TransactionType,
    TxReference, WalletStats,
};
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub account_id: String,
    pub kind: TransactionType,
    pub amount: i64,
    pub description: String,
    pub reference: Option<TxReference>,
    pub metadata: Option<serde_json::Value>,
}

impl RecordRequest {
    pub fn new(account_id: &str, kind: TransactionType, amount: i64, description: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            kind,
            amount,
            description: description.to_string(),
            reference: None,
            metadata: None,
        }
    }

    pub fn with_reference(mut self, reference: TxReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub transaction_id: String,
    pub new_balance: i64,
    /// The entry already existed; nothing was applied this time
    pub replayed: bool,
    /// The account skipped the non-negative check
    pub unbounded: bool,
}

pub struct TransactionRecorder {
    store: Arc<dyn LedgerStore>,
    welcome_bonus: i64,
    history_limit: usize,
}

impl TransactionRecorder {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            welcome_bonus: 1000,
            history_limit: 500,
        }
    }

    pub fn with_welcome_bonus(mut self, welcome_bonus: i64) -> Self {
        self.welcome_bonus = welcome_bonus;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Apply one signed delta and append its ledger entry.
    ///
    /// With a reference, a retry of the same `(account, reference, type)`
    /// returns the first entry's result without touching the balance.
    pub async fn record(&self, req: RecordRequest) -> LedgerResult<RecordOutcome> {
        if req.amount == 0 {
            return Err(LedgerError::InvalidAmount(
                "amount must be non-zero".to_string(),
            ));
        }

        let account = self
            .store
            .get_account(&req.account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(req.account_id.clone()))?;
        let guard = if account.has_unlimited_balance {
            BalanceGuard::Unbounded
        } else {
            BalanceGuard::NonNegative
        };

        let entry = NewTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: req.account_id.clone(),
            kind: req.kind,
            amount: req.amount,
            description: req.description,
            reference: req.reference,
            metadata: req.metadata,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        match self.store.apply_transaction(entry, guard).await {
            Ok(applied) => {
                let tx = applied.transaction;
                if applied.replayed {
                    debug!(
                        account_id = %tx.account_id,
                        kind = %tx.kind,
                        transaction_id = %tx.id,
                        "Replayed ledger entry"
                    );
                } else {
                    info!(
                        account_id = %tx.account_id,
                        kind = %tx.kind,
                        amount = tx.amount,
                        balance_after = tx.balance_after,
                        "Recorded ledger entry"
                    );
                }
                Ok(RecordOutcome {
                    transaction_id: tx.id,
                    new_balance: tx.balance_after,
                    replayed: applied.replayed,
                    unbounded: account.has_unlimited_balance,
                })
            }
            Err(e) => {
                if e.is_user_error() {
                    info!(account_id = %req.account_id, kind = %req.kind, amount = req.amount, error = %e, "Ledger entry rejected");
                } else {
                    warn!(account_id = %req.account_id, kind = %req.kind, amount = req.amount, error = %e, "Ledger entry failed");
                }
                Err(e)
            }
        }
    }

    /// Reverse a debit whose dependent step failed.
    ///
    /// Records a `Refund` of `-amount` bound to the original transaction id, so
    /// repeating the compensation is a no-op. Unbounded accounts are
    /// compensated too: their audit trail must net to zero.
    pub async fn compensate(
        &self,
        account_id: &str,
        original_transaction_id: &str,
        original_amount: i64,
        reason: &str,
    ) -> LedgerResult<RecordOutcome> {
        warn!(
            account_id,
            original_transaction_id,
            amount = -original_amount,
            reason,
            "Compensating ledger entry"
        );
        let req = RecordRequest::new(
            account_id,
            TransactionType::Refund,
            -original_amount,
            &format!("Compensation: {reason}"),
        )
        .with_reference(TxReference::compensation(original_transaction_id))
        .with_metadata(serde_json::json!({ "reason": reason }));

        self.record(req).await.map_err(|e| {
            error!(
                account_id,
                original_transaction_id,
                error = %e,
                "Compensation failed; ledger needs manual repair"
            );
            e
        })
    }

    /// Whether `transaction_id` has already been reversed by [`Self::compensate`].
    /// A replayed debit that was compensated must not be treated as paid.
    pub async fn is_compensated(
        &self,
        account_id: &str,
        transaction_id: &str,
    ) -> LedgerResult<bool> {
        let key = IdempotencyKey {
            account_id: account_id.to_string(),
            reference: TxReference::compensation(transaction_id),
            kind: TransactionType::Refund,
        };
        Ok(self.store.find_transaction(&key).await?.is_some())
    }

    /// Create an account seeded with the welcome bonus.
    ///
    /// The account starts at zero and the bonus is a ledger entry, so
    /// conservation holds from the first row. Opening twice is harmless.
    pub async fn open_account(
        &self,
        account_id: &str,
        has_unlimited_balance: bool,
    ) -> LedgerResult<WalletStats> {
        if account_id.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "account id must not be empty".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let (_, created) = self
            .store
            .create_account(Account::new(account_id, 0, has_unlimited_balance, now))
            .await?;
        if created {
            info!(account_id, has_unlimited_balance, "Opened account");
        }

        if self.welcome_bonus > 0 {
            let req = RecordRequest::new(
                account_id,
                TransactionType::Bonus,
                self.welcome_bonus,
                "Welcome bonus",
            )
            .with_reference(TxReference::welcome(account_id));
            self.record(req).await?;
        }

        self.wallet_stats(account_id).await
    }

    pub async fn wallet_stats(&self, account_id: &str) -> LedgerResult<WalletStats> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        Ok(account.stats())
    }

    /// Newest entries first, capped at the configured history limit.
    pub async fn history(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<Transaction>> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }
        let limit = limit
            .unwrap_or(self.history_limit)
            .clamp(1, self.history_limit);
        self.store.list_transactions(account_id, limit).await
    }

    pub async fn reconcile(&self, account_id: &str) -> LedgerResult<ReconcileReport> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        let (ledger_sum, entries) = self.store.ledger_sum(account_id).await?;
        let expected_balance = account.initial_balance + ledger_sum;
        let consistent = expected_balance == account.balance;

        if !consistent {
            error!(
                account_id,
                expected_balance,
                actual_balance = account.balance,
                "Balance does not match ledger"
            );
        }

        Ok(ReconcileReport {
            account_id: account_id.to_string(),
            initial_balance: account.initial_balance,
            ledger_sum,
            expected_balance,
            actual_balance: account.balance,
            entries,
            consistent,
        })
    }
}
