//! Wallet ledger: accounts, the append-only transaction log, and the
//! recorder that is the sole writer of balances.

pub mod memory;
pub mod models;
pub mod recorder;
pub mod sqlite;
pub mod store;

pub use memory::{FaultPoint, InMemoryLedgerStore};
pub use models::{
    Account, ReconcileReport, Transaction, TransactionType, TxReference, WalletStats,
};
pub use recorder::{RecordOutcome, RecordRequest, TransactionRecorder};
pub use sqlite::SqliteLedgerStore;
pub use store::LedgerStore;
