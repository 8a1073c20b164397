//! PurchaseProcessor
//!
//! Debit first, then grant. The grant (stock decrement + inventory upsert +
//! purchase row) is one store call; if it fails after the debit went through
//! the debit is reversed with a compensating `Refund`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::models::{TransactionType, TxReference};
use crate::ledger::recorder::{RecordRequest, TransactionRecorder};
use crate::ledger::store::LedgerStore;
use crate::shop::models::{InventoryEntry, PurchaseRecord, ShopItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub purchase_id: String,
    pub item_id: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub total: i64,
    pub new_balance: i64,
    /// Bought by an unlimited account: debited for the audit trail only
    pub was_free: bool,
    pub replayed: bool,
}

pub struct PurchaseProcessor {
    recorder: Arc<TransactionRecorder>,
    store: Arc<dyn LedgerStore>,
}

impl PurchaseProcessor {
    pub fn new(recorder: Arc<TransactionRecorder>) -> Self {
        let store = recorder.store().clone();
        Self { recorder, store }
    }

    pub async fn upsert_item(&self, item: ShopItem) -> LedgerResult<ShopItem> {
        if item.id.trim().is_empty() || item.name.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "item id and name are required".to_string(),
            ));
        }
        if item.price <= 0 {
            return Err(LedgerError::ValidationError(format!(
                "price must be positive, got {}",
                item.price
            )));
        }
        if let Some(discount) = item.discount_price {
            if discount <= 0 || discount > item.price {
                return Err(LedgerError::ValidationError(format!(
                    "discount price {discount} must be between 1 and {}",
                    item.price
                )));
            }
        }
        if item.stock.is_some_and(|s| s < 0) {
            return Err(LedgerError::ValidationError(
                "stock must not be negative".to_string(),
            ));
        }
        if item.max_per_user.is_some_and(|m| m <= 0) {
            return Err(LedgerError::ValidationError(
                "max per user must be positive".to_string(),
            ));
        }

        self.store.upsert_item(item.clone()).await?;
        info!(item_id = %item.id, price = item.price, stock = ?item.stock, "Catalog item saved");
        Ok(item)
    }

    pub async fn get_item(&self, item_id: &str) -> LedgerResult<ShopItem> {
        self.store
            .get_item(item_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("item", item_id))
    }

    pub async fn inventory(&self, account_id: &str) -> LedgerResult<Vec<InventoryEntry>> {
        self.store.inventory(account_id).await
    }

    /// Buy `quantity` of an item.
    ///
    /// `request_id` makes the purchase safe to retry: the same id for the
    /// same account returns the first receipt.
    pub async fn purchase(
        &self,
        account_id: &str,
        item_id: &str,
        quantity: i64,
        request_id: Option<&str>,
    ) -> LedgerResult<PurchaseReceipt> {
        if quantity <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "quantity must be positive, got {quantity}"
            )));
        }

        let purchase_id = match request_id {
            Some(r) => format!("{account_id}:{r}"),
            None => uuid::Uuid::new_v4().to_string(),
        };
        if request_id.is_some() {
            if let Some(existing) = self.store.get_purchase(&purchase_id).await? {
                return self.replayed_receipt(existing).await;
            }
        }

        let item = self.get_item(item_id).await?;
        if !item.is_active {
            return Err(LedgerError::ValidationError(format!(
                "item {item_id} is not for sale"
            )));
        }
        if let Some(stock) = item.stock {
            if stock < quantity {
                return Err(LedgerError::StockExhausted {
                    item_id: item_id.to_string(),
                    requested: quantity,
                    available: stock,
                });
            }
        }

        let unit_price = item.unit_price();
        let total = unit_price
            .checked_mul(quantity)
            .ok_or_else(|| LedgerError::InvalidAmount("purchase total overflows".to_string()))?;

        if let Some(max) = item.max_per_user {
            let owned = self.store.owned_quantity(account_id, item_id).await?;
            if owned + quantity > max {
                return Err(LedgerError::LimitExceeded {
                    item_id: item_id.to_string(),
                    owned,
                    requested: quantity,
                    max,
                });
            }
        }

        let debit = self
            .recorder
            .record(
                RecordRequest::new(
                    account_id,
                    TransactionType::ItemPurchase,
                    -total,
                    &format!("Purchased {quantity} x {}", item.name),
                )
                .with_reference(TxReference::purchase(&purchase_id))
                .with_metadata(serde_json::json!({
                    "item_id": item_id,
                    "quantity": quantity,
                    "unit_price": unit_price,
                })),
            )
            .await?;

        if debit.replayed
            && self
                .recorder
                .is_compensated(account_id, &debit.transaction_id)
                .await?
        {
            // A retry of an earlier attempt that was reversed
            return Err(LedgerError::ValidationError(format!(
                "purchase {purchase_id} was reversed; retry with a new request id"
            )));
        }

        let record = PurchaseRecord {
            id: purchase_id.clone(),
            account_id: account_id.to_string(),
            item_id: item_id.to_string(),
            quantity,
            unit_price,
            total,
            transaction_id: debit.transaction_id.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        match self.store.grant_purchase(record).await {
            Ok(granted) => {
                if granted {
                    info!(account_id, item_id, quantity, total, was_free = debit.unbounded, "Purchase completed");
                } else {
                    debug!(account_id, %purchase_id, "Purchase already granted");
                }
                Ok(PurchaseReceipt {
                    purchase_id,
                    item_id: item_id.to_string(),
                    quantity,
                    unit_price,
                    total,
                    new_balance: debit.new_balance,
                    was_free: debit.unbounded,
                    replayed: !granted,
                })
            }
            Err(e) => {
                self.recorder
                    .compensate(account_id, &debit.transaction_id, -total, "inventory grant failed")
                    .await?;
                Err(e)
            }
        }
    }

    async fn replayed_receipt(&self, purchase: PurchaseRecord) -> LedgerResult<PurchaseReceipt> {
        let stats = self.recorder.wallet_stats(&purchase.account_id).await?;
        debug!(account_id = %purchase.account_id, purchase_id = %purchase.id, "Replayed purchase");
        Ok(PurchaseReceipt {
            purchase_id: purchase.id,
            item_id: purchase.item_id,
            quantity: purchase.quantity,
            unit_price: purchase.unit_price,
            total: purchase.total,
            new_balance: stats.balance,
            was_free: stats.has_unlimited_balance,
            replayed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{FaultPoint, InMemoryLedgerStore};

    async fn setup() -> (PurchaseProcessor, Arc<TransactionRecorder>, Arc<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let recorder = Arc::new(TransactionRecorder::new(store.clone()).with_welcome_bonus(1000));
        recorder.open_account("alice", false).await.unwrap();
        recorder.open_account("staff", true).await.unwrap();
        let processor = PurchaseProcessor::new(recorder.clone());
        processor
            .upsert_item(ShopItem {
                id: "badge".into(),
                name: "Gold badge".into(),
                price: 200,
                discount_price: Some(150),
                stock: Some(5),
                max_per_user: Some(3),
                is_active: true,
            })
            .await
            .unwrap();
        (processor, recorder, store)
    }

    async fn balance(recorder: &TransactionRecorder, user: &str) -> i64 {
        recorder.wallet_stats(user).await.unwrap().balance
    }

    #[tokio::test]
    async fn test_purchase_uses_discount_and_grants_inventory() {
        let (processor, recorder, _store) = setup().await;

        let receipt = processor.purchase("alice", "badge", 2, None).await.unwrap();
        assert_eq!(receipt.unit_price, 150);
        assert_eq!(receipt.total, 300);
        assert_eq!(receipt.new_balance, 700);
        assert!(!receipt.was_free);

        let inventory = processor.inventory("alice").await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].quantity, 2);
        assert_eq!(processor.get_item("badge").await.unwrap().stock, Some(3));
        assert_eq!(recorder.wallet_stats("alice").await.unwrap().lifetime_spent, 300);
    }

    #[tokio::test]
    async fn test_stock_and_limit_rejections_leave_balance_untouched() {
        let (processor, recorder, store) = setup().await;
        let entries = store.all_transactions().len();

        let err = processor.purchase("alice", "badge", 6, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::StockExhausted { available: 5, .. }));

        processor.purchase("alice", "badge", 2, None).await.unwrap();
        let err = processor.purchase("alice", "badge", 2, None).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::LimitExceeded {
                item_id: "badge".into(),
                owned: 2,
                requested: 2,
                max: 3
            }
        );

        assert_eq!(balance(&recorder, "alice").await, 700);
        assert_eq!(store.all_transactions().len(), entries + 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_grants_nothing() {
        let (processor, recorder, _store) = setup().await;
        processor
            .upsert_item(ShopItem {
                id: "yacht".into(),
                name: "Yacht".into(),
                price: 5000,
                discount_price: None,
                stock: None,
                max_per_user: None,
                is_active: true,
            })
            .await
            .unwrap();

        let err = processor.purchase("alice", "yacht", 1, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance(&recorder, "alice").await, 1000);
        assert!(processor.inventory("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_grant_is_refunded_exactly() {
        let (processor, recorder, store) = setup().await;

        store.inject_fault(FaultPoint::GrantPurchase);
        let err = processor.purchase("alice", "badge", 2, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InternalError(_)));

        assert_eq!(balance(&recorder, "alice").await, 1000);
        let refund = store
            .all_transactions()
            .into_iter()
            .find(|t| t.kind == TransactionType::Refund)
            .unwrap();
        assert_eq!(refund.amount, 300);
        assert_eq!(refund.reference_type.as_deref(), Some("compensation"));
        assert!(processor.inventory("alice").await.unwrap().is_empty());
        assert_eq!(processor.get_item("badge").await.unwrap().stock, Some(5));
        assert!(recorder.reconcile("alice").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_unlimited_account_is_free_but_audited() {
        let (processor, recorder, store) = setup().await;

        let receipt = processor.purchase("staff", "badge", 3, None).await.unwrap();
        assert!(receipt.was_free);
        assert_eq!(receipt.new_balance, 1000 - 450);

        let debit = store
            .all_transactions()
            .into_iter()
            .find(|t| t.account_id == "staff" && t.kind == TransactionType::ItemPurchase)
            .unwrap();
        assert_eq!(debit.amount, -450);
        assert!(recorder.reconcile("staff").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_request_id_makes_purchase_idempotent() {
        let (processor, recorder, _store) = setup().await;

        let first = processor.purchase("alice", "badge", 1, Some("req-1")).await.unwrap();
        let second = processor.purchase("alice", "badge", 1, Some("req-1")).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.purchase_id, second.purchase_id);
        assert_eq!(balance(&recorder, "alice").await, 850);
        assert_eq!(processor.inventory("alice").await.unwrap()[0].quantity, 1);
    }

    #[tokio::test]
    async fn test_reversed_request_id_cannot_be_reused() {
        let (processor, recorder, store) = setup().await;

        store.inject_fault(FaultPoint::GrantPurchase);
        processor
            .purchase("alice", "badge", 1, Some("req-9"))
            .await
            .unwrap_err();

        let err = processor
            .purchase("alice", "badge", 1, Some("req-9"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ValidationError(_)));
        assert_eq!(balance(&recorder, "alice").await, 1000);
        assert!(processor.inventory("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_validation() {
        let (processor, _recorder, _store) = setup().await;

        let mut item = processor.get_item("badge").await.unwrap();
        item.discount_price = Some(500);
        assert!(matches!(
            processor.upsert_item(item.clone()).await,
            Err(LedgerError::ValidationError(_))
        ));

        item.discount_price = None;
        item.is_active = false;
        processor.upsert_item(item).await.unwrap();
        let err = processor.purchase("alice", "badge", 1, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::ValidationError(_)));

        let err = processor.purchase("alice", "missing", 1, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "item", .. }));
    }
}
