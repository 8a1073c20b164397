//! Shop: catalog, inventory and the purchase pipeline.

pub mod models;
pub mod processor;

pub use models::{InventoryEntry, PurchaseRecord, ShopItem};
pub use processor::{PurchaseProcessor, PurchaseReceipt};
