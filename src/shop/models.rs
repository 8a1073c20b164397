use serde::{Deserialize, Serialize};

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopItem {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub discount_price: Option<i64>,
    /// `None` = unlimited stock
    pub stock: Option<i64>,
    /// `None` = no per-user cap
    pub max_per_user: Option<i64>,
    pub is_active: bool,
}

impl ShopItem {
    pub fn unit_price(&self) -> i64 {
        self.discount_price.unwrap_or(self.price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub account_id: String,
    pub item_id: String,
    pub quantity: i64,
}

/// Completed purchase, written together with the inventory grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRecord {
    pub id: String,
    pub account_id: String,
    pub item_id: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub total: i64,
    pub transaction_id: String,
    pub created_at: i64,
}
