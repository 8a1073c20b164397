//! SQLite-backed `LedgerStore`
//!
//! Balance mutation is one `BEGIN IMMEDIATE` transaction holding a conditional
//! `UPDATE accounts SET balance = balance + ?` plus the ledger insert, so
//! concurrent writers (including other processes on the same file) serialize
//! on the database write lock rather than on application memory.

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::models::{
    Account, AppliedTransaction, BalanceGuard, IdempotencyKey, NewTransaction, Transaction,
    TransactionType,
};
use crate::ledger::store::LedgerStore;
use crate::market::scenario::{
    Payout, PayoutStatus, Prediction, PredictionStatus, Scenario, ScenarioStatus, Side,
};
use crate::rewards::models::{RewardKind, RewardProgress, UserProgress};
use crate::shop::models::{InventoryEntry, PurchaseRecord, ShopItem};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL,
    initial_balance INTEGER NOT NULL,
    lifetime_purchased INTEGER NOT NULL DEFAULT 0,
    lifetime_earned INTEGER NOT NULL DEFAULT 0,
    lifetime_spent INTEGER NOT NULL DEFAULT 0,
    has_unlimited_balance INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT UNIQUE NOT NULL,
    account_id TEXT NOT NULL,
    type TEXT NOT NULL,
    amount INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    description TEXT NOT NULL,
    reference_type TEXT,
    reference_id TEXT,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_reference
    ON transactions(account_id, reference_type, reference_id, type);
CREATE INDEX IF NOT EXISTS idx_transactions_account_seq
    ON transactions(account_id, seq DESC);

CREATE TABLE IF NOT EXISTS scenarios (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    creator_id TEXT,
    status TEXT NOT NULL,
    result TEXT,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER
);

CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    scenario_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    side TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_predictions_scenario ON predictions(scenario_id);

CREATE TABLE IF NOT EXISTS payouts (
    id TEXT PRIMARY KEY,
    scenario_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    payout_amount INTEGER NOT NULL,
    pool_total INTEGER NOT NULL,
    was_fulfilled INTEGER NOT NULL,
    status TEXT NOT NULL,
    transaction_id TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (scenario_id, recipient_id)
);

CREATE TABLE IF NOT EXISTS shop_items (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    price INTEGER NOT NULL,
    discount_price INTEGER,
    stock INTEGER CHECK (stock IS NULL OR stock >= 0),
    max_per_user INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS inventory (
    account_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    PRIMARY KEY (account_id, item_id)
);

CREATE TABLE IF NOT EXISTS purchases (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    unit_price INTEGER NOT NULL,
    total INTEGER NOT NULL,
    transaction_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reward_progress (
    account_id TEXT NOT NULL,
    reward_ref TEXT NOT NULL,
    kind TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    target INTEGER NOT NULL,
    is_completed INTEGER NOT NULL DEFAULT 0,
    is_claimed INTEGER NOT NULL DEFAULT 0,
    ap_coins INTEGER NOT NULL DEFAULT 0,
    xp INTEGER NOT NULL DEFAULT 0,
    achievement_points INTEGER NOT NULL DEFAULT 0,
    claimed_at INTEGER,
    PRIMARY KEY (account_id, reward_ref)
);

CREATE TABLE IF NOT EXISTS user_progress (
    account_id TEXT PRIMARY KEY,
    xp INTEGER NOT NULL DEFAULT 0,
    achievement_points INTEGER NOT NULL DEFAULT 0
);
";

const ACCOUNT_COLUMNS: &str = "id, balance, initial_balance, lifetime_purchased, lifetime_earned, \
     lifetime_spent, has_unlimited_balance, created_at";
const TRANSACTION_COLUMNS: &str = "id, account_id, type, amount, balance_after, description, \
     reference_type, reference_id, metadata, created_at";
const PAYOUT_COLUMNS: &str = "id, scenario_id, recipient_id, payout_amount, pool_total, \
     was_fulfilled, status, transaction_id, created_at";
const REWARD_COLUMNS: &str = "account_id, reward_ref, kind, progress, target, is_completed, \
     is_claimed, ap_coins, xp, achievement_points, claimed_at";

#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("set busy timeout")?;
        conn.execute_batch(SCHEMA).context("create ledger schema")?;
        info!(db_path, "ledger database ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh private database, for tests and ephemeral runs.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger db")?;
        conn.execute_batch(SCHEMA).context("create ledger schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_text<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognised value {raw:?}").into(),
        )
    })
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        balance: row.get(1)?,
        initial_balance: row.get(2)?,
        lifetime_purchased: row.get(3)?,
        lifetime_earned: row.get(4)?,
        lifetime_spent: row.get(5)?,
        has_unlimited_balance: row.get::<_, i64>(6)? == 1,
        created_at: row.get(7)?,
    })
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<Transaction> {
    let metadata: Option<String> = row.get(8)?;
    let metadata = match metadata {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind: parse_text(row, 2, TransactionType::from_str)?,
        amount: row.get(3)?,
        balance_after: row.get(4)?,
        description: row.get(5)?,
        reference_type: row.get(6)?,
        reference_id: row.get(7)?,
        metadata,
        created_at: row.get(9)?,
    })
}

fn scenario_from_row(row: &Row) -> rusqlite::Result<Scenario> {
    let result: Option<String> = row.get(4)?;
    Ok(Scenario {
        id: row.get(0)?,
        title: row.get(1)?,
        creator_id: row.get(2)?,
        status: parse_text(row, 3, ScenarioStatus::from_str)?,
        result: result.as_deref().and_then(Side::from_str),
        created_at: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

fn prediction_from_row(row: &Row) -> rusqlite::Result<Prediction> {
    Ok(Prediction {
        id: row.get(0)?,
        scenario_id: row.get(1)?,
        user_id: row.get(2)?,
        side: parse_text(row, 3, Side::from_str)?,
        amount: row.get(4)?,
        status: parse_text(row, 5, PredictionStatus::from_str)?,
        created_at: row.get(6)?,
    })
}

fn payout_from_row(row: &Row) -> rusqlite::Result<Payout> {
    Ok(Payout {
        id: row.get(0)?,
        scenario_id: row.get(1)?,
        recipient_id: row.get(2)?,
        payout_amount: row.get(3)?,
        pool_total: row.get(4)?,
        was_fulfilled: row.get::<_, i64>(5)? == 1,
        status: parse_text(row, 6, PayoutStatus::from_str)?,
        transaction_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn item_from_row(row: &Row) -> rusqlite::Result<ShopItem> {
    Ok(ShopItem {
        id: row.get(0)?,
        name: row.get(1)?,
        price: row.get(2)?,
        discount_price: row.get(3)?,
        stock: row.get(4)?,
        max_per_user: row.get(5)?,
        is_active: row.get::<_, i64>(6)? == 1,
    })
}

fn purchase_from_row(row: &Row) -> rusqlite::Result<PurchaseRecord> {
    Ok(PurchaseRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        item_id: row.get(2)?,
        quantity: row.get(3)?,
        unit_price: row.get(4)?,
        total: row.get(5)?,
        transaction_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn reward_from_row(row: &Row) -> rusqlite::Result<RewardProgress> {
    Ok(RewardProgress {
        account_id: row.get(0)?,
        reward_ref: row.get(1)?,
        kind: parse_text(row, 2, RewardKind::from_str)?,
        progress: row.get(3)?,
        target: row.get(4)?,
        is_completed: row.get::<_, i64>(5)? == 1,
        is_claimed: row.get::<_, i64>(6)? == 1,
        ap_coins: row.get(7)?,
        xp: row.get(8)?,
        achievement_points: row.get(9)?,
        claimed_at: row.get(10)?,
    })
}

fn find_by_key(conn: &Connection, key: &IdempotencyKey) -> rusqlite::Result<Option<Transaction>> {
    conn.query_row(
        &format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE account_id = ?1 AND reference_type = ?2 AND reference_id = ?3 AND type = ?4"
        ),
        params![
            key.account_id,
            key.reference.reference_type,
            key.reference.reference_id,
            key.kind.as_str()
        ],
        transaction_from_row,
    )
    .optional()
}

fn get_reward_row(
    conn: &Connection,
    account_id: &str,
    reward_ref: &str,
) -> rusqlite::Result<Option<RewardProgress>> {
    conn.query_row(
        &format!(
            "SELECT {REWARD_COLUMNS} FROM reward_progress WHERE account_id = ?1 AND reward_ref = ?2"
        ),
        params![account_id, reward_ref],
        reward_from_row,
    )
    .optional()
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn create_account(&self, account: Account) -> LedgerResult<(Account, bool)> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO accounts
             (id, balance, initial_balance, lifetime_purchased, lifetime_earned, lifetime_spent,
              has_unlimited_balance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                account.id,
                account.balance,
                account.initial_balance,
                account.lifetime_purchased,
                account.lifetime_earned,
                account.lifetime_spent,
                account.has_unlimited_balance as i64,
                account.created_at,
            ],
        )?;
        if inserted == 1 {
            return Ok((account, true));
        }
        let existing = conn.query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
            [&account.id],
            account_from_row,
        )?;
        Ok((existing, false))
    }

    async fn get_account(&self, account_id: &str) -> LedgerResult<Option<Account>> {
        let conn = self.conn.lock().await;
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                [account_id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    async fn apply_transaction(
        &self,
        entry: NewTransaction,
        guard: BalanceGuard,
    ) -> LedgerResult<AppliedTransaction> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = entry.idempotency_key() {
            if let Some(existing) = find_by_key(&tx, &key)? {
                return Ok(AppliedTransaction {
                    transaction: existing,
                    replayed: true,
                });
            }
        }

        // SQLite widens overflowing integer arithmetic to REAL; reject it first
        let current = tx
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                [&entry.account_id],
                account_from_row,
            )
            .optional()?;
        if let Some(mut account) = current {
            account.apply(entry.kind, entry.amount)?;
        }

        let delta = entry.kind.counter_delta(entry.amount);
        let unbounded = matches!(guard, BalanceGuard::Unbounded);
        let updated = tx.execute(
            "UPDATE accounts SET
                balance = balance + ?1,
                lifetime_purchased = lifetime_purchased + ?2,
                lifetime_earned = lifetime_earned + ?3,
                lifetime_spent = MAX(lifetime_spent + ?4, 0)
             WHERE id = ?5 AND (?6 = 1 OR ?1 >= 0 OR balance + ?1 >= 0)",
            params![
                entry.amount,
                delta.purchased,
                delta.earned,
                delta.spent,
                entry.account_id,
                unbounded as i64,
            ],
        )?;

        if updated == 0 {
            let balance: Option<i64> = tx
                .query_row(
                    "SELECT balance FROM accounts WHERE id = ?1",
                    [&entry.account_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match balance {
                None => LedgerError::AccountNotFound(entry.account_id.clone()),
                Some(balance) => LedgerError::InsufficientFunds {
                    balance,
                    required: -entry.amount,
                },
            });
        }

        let balance_after: i64 = tx.query_row(
            "SELECT balance FROM accounts WHERE id = ?1",
            [&entry.account_id],
            |row| row.get(0),
        )?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let record = entry.into_transaction(balance_after);

        tx.execute(
            "INSERT INTO transactions
             (id, account_id, type, amount, balance_after, description, reference_type,
              reference_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.account_id,
                record.kind.as_str(),
                record.amount,
                record.balance_after,
                record.description,
                record.reference_type,
                record.reference_id,
                metadata,
                record.created_at,
            ],
        )?;
        tx.commit()?;

        Ok(AppliedTransaction {
            transaction: record,
            replayed: false,
        })
    }

    async fn find_transaction(&self, key: &IdempotencyKey) -> LedgerResult<Option<Transaction>> {
        let conn = self.conn.lock().await;
        Ok(find_by_key(&conn, key)?)
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE account_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn ledger_sum(&self, account_id: &str) -> LedgerResult<(i64, usize)> {
        let conn = self.conn.lock().await;
        let (sum, count): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM transactions WHERE account_id = ?1",
            [account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((sum, count as usize))
    }

    async fn create_scenario(&self, scenario: Scenario) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scenarios (id, title, creator_id, status, result, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scenario.id,
                scenario.title,
                scenario.creator_id,
                scenario.status.as_str(),
                scenario.result.map(|s| s.as_str()),
                scenario.created_at,
                scenario.resolved_at,
            ],
        )?;
        if inserted == 0 {
            return Err(LedgerError::ValidationError(format!(
                "scenario {} already exists",
                scenario.id
            )));
        }
        Ok(())
    }

    async fn get_scenario(&self, scenario_id: &str) -> LedgerResult<Option<Scenario>> {
        let conn = self.conn.lock().await;
        let scenario = conn
            .query_row(
                "SELECT id, title, creator_id, status, result, created_at, resolved_at
                 FROM scenarios WHERE id = ?1",
                [scenario_id],
                scenario_from_row,
            )
            .optional()?;
        Ok(scenario)
    }

    async fn transition_scenario(
        &self,
        scenario_id: &str,
        from: &[ScenarioStatus],
        to: ScenarioStatus,
        result: Option<Side>,
        now: i64,
    ) -> LedgerResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        // Status names are fixed identifiers, safe to inline.
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let resolved_at = to.is_terminal().then_some(now);

        let conn = self.conn.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE scenarios SET
                    status = ?1,
                    result = COALESCE(?2, result),
                    resolved_at = COALESCE(?3, resolved_at)
                 WHERE id = ?4 AND status IN ({allowed})"
            ),
            params![to.as_str(), result.map(|s| s.as_str()), resolved_at, scenario_id],
        )?;
        Ok(updated == 1)
    }

    async fn insert_prediction(&self, prediction: Prediction) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO predictions (id, scenario_id, user_id, side, amount, status, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM scenarios WHERE id = ?2 AND status = 'active')",
            params![
                prediction.id,
                prediction.scenario_id,
                prediction.user_id,
                prediction.side.as_str(),
                prediction.amount,
                prediction.status.as_str(),
                prediction.created_at,
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn predictions_for_scenario(&self, scenario_id: &str) -> LedgerResult<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, scenario_id, user_id, side, amount, status, created_at
             FROM predictions WHERE scenario_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([scenario_id], prediction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn settle_prediction(
        &self,
        prediction_id: &str,
        status: PredictionStatus,
    ) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE predictions SET status = ?1 WHERE id = ?2 AND status = 'pending'",
            params![status.as_str(), prediction_id],
        )?;
        Ok(updated == 1)
    }

    async fn insert_payout(&self, payout: Payout) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO payouts
             (id, scenario_id, recipient_id, payout_amount, pool_total, was_fulfilled, status,
              transaction_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                payout.id,
                payout.scenario_id,
                payout.recipient_id,
                payout.payout_amount,
                payout.pool_total,
                payout.was_fulfilled as i64,
                payout.status.as_str(),
                payout.transaction_id,
                payout.created_at,
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn update_payout(
        &self,
        scenario_id: &str,
        recipient_id: &str,
        status: PayoutStatus,
        transaction_id: Option<&str>,
    ) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE payouts SET status = ?1, transaction_id = COALESCE(?2, transaction_id)
             WHERE scenario_id = ?3 AND recipient_id = ?4",
            params![status.as_str(), transaction_id, scenario_id, recipient_id],
        )?;
        Ok(())
    }

    async fn payouts_for_scenario(&self, scenario_id: &str) -> LedgerResult<Vec<Payout>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE scenario_id = ?1 ORDER BY recipient_id ASC"
        ))?;
        let rows = stmt
            .query_map([scenario_id], payout_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn upsert_item(&self, item: ShopItem) -> LedgerResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO shop_items (id, name, price, discount_price, stock, max_per_user, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                price = excluded.price,
                discount_price = excluded.discount_price,
                stock = excluded.stock,
                max_per_user = excluded.max_per_user,
                is_active = excluded.is_active",
            params![
                item.id,
                item.name,
                item.price,
                item.discount_price,
                item.stock,
                item.max_per_user,
                item.is_active as i64,
            ],
        )?;
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> LedgerResult<Option<ShopItem>> {
        let conn = self.conn.lock().await;
        let item = conn
            .query_row(
                "SELECT id, name, price, discount_price, stock, max_per_user, is_active
                 FROM shop_items WHERE id = ?1",
                [item_id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    async fn owned_quantity(&self, account_id: &str, item_id: &str) -> LedgerResult<i64> {
        let conn = self.conn.lock().await;
        let qty: Option<i64> = conn
            .query_row(
                "SELECT quantity FROM inventory WHERE account_id = ?1 AND item_id = ?2",
                params![account_id, item_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(qty.unwrap_or(0))
    }

    async fn grant_purchase(&self, purchase: PurchaseRecord) -> LedgerResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM purchases WHERE id = ?1",
                [&purchase.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }

        let limit: Option<Option<i64>> = tx
            .query_row(
                "SELECT max_per_user FROM shop_items WHERE id = ?1",
                [&purchase.item_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(Some(max)) = limit {
            let owned: i64 = tx.query_row(
                "SELECT COALESCE(SUM(quantity), 0) FROM inventory
                 WHERE account_id = ?1 AND item_id = ?2",
                params![purchase.account_id, purchase.item_id],
                |row| row.get(0),
            )?;
            if owned + purchase.quantity > max {
                return Err(LedgerError::LimitExceeded {
                    item_id: purchase.item_id.clone(),
                    owned,
                    requested: purchase.quantity,
                    max,
                });
            }
        }

        let updated = tx.execute(
            "UPDATE shop_items SET stock = CASE WHEN stock IS NULL THEN NULL ELSE stock - ?1 END
             WHERE id = ?2 AND (stock IS NULL OR stock >= ?1)",
            params![purchase.quantity, purchase.item_id],
        )?;
        if updated == 0 {
            let stock: Option<Option<i64>> = tx
                .query_row(
                    "SELECT stock FROM shop_items WHERE id = ?1",
                    [&purchase.item_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match stock {
                None => LedgerError::not_found("item", purchase.item_id.clone()),
                Some(available) => LedgerError::StockExhausted {
                    item_id: purchase.item_id.clone(),
                    requested: purchase.quantity,
                    available: available.unwrap_or(0),
                },
            });
        }

        tx.execute(
            "INSERT INTO inventory (account_id, item_id, quantity) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, item_id) DO UPDATE SET quantity = quantity + excluded.quantity",
            params![purchase.account_id, purchase.item_id, purchase.quantity],
        )?;
        tx.execute(
            "INSERT INTO purchases
             (id, account_id, item_id, quantity, unit_price, total, transaction_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                purchase.id,
                purchase.account_id,
                purchase.item_id,
                purchase.quantity,
                purchase.unit_price,
                purchase.total,
                purchase.transaction_id,
                purchase.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn get_purchase(&self, purchase_id: &str) -> LedgerResult<Option<PurchaseRecord>> {
        let conn = self.conn.lock().await;
        let purchase = conn
            .query_row(
                "SELECT id, account_id, item_id, quantity, unit_price, total, transaction_id, created_at
                 FROM purchases WHERE id = ?1",
                [purchase_id],
                purchase_from_row,
            )
            .optional()?;
        Ok(purchase)
    }

    async fn inventory(&self, account_id: &str) -> LedgerResult<Vec<InventoryEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, item_id, quantity FROM inventory
             WHERE account_id = ?1 ORDER BY item_id ASC",
        )?;
        let rows = stmt
            .query_map([account_id], |row| {
                Ok(InventoryEntry {
                    account_id: row.get(0)?,
                    item_id: row.get(1)?,
                    quantity: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn register_reward(&self, reward: RewardProgress) -> LedgerResult<RewardProgress> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO reward_progress ({REWARD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                reward.account_id,
                reward.reward_ref,
                reward.kind.as_str(),
                reward.progress,
                reward.target,
                reward.is_completed as i64,
                reward.is_claimed as i64,
                reward.ap_coins,
                reward.xp,
                reward.achievement_points,
                reward.claimed_at,
            ],
        )?;
        get_reward_row(&conn, &reward.account_id, &reward.reward_ref)?.ok_or_else(|| {
            LedgerError::InternalError(format!("reward {} vanished after insert", reward.reward_ref))
        })
    }

    async fn get_reward(
        &self,
        account_id: &str,
        reward_ref: &str,
    ) -> LedgerResult<Option<RewardProgress>> {
        let conn = self.conn.lock().await;
        Ok(get_reward_row(&conn, account_id, reward_ref)?)
    }

    async fn advance_reward(
        &self,
        account_id: &str,
        reward_ref: &str,
        delta: i64,
    ) -> LedgerResult<Option<RewardProgress>> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reward_progress SET
                progress = progress + ?1,
                is_completed = CASE WHEN progress + ?1 >= target THEN 1 ELSE is_completed END
             WHERE account_id = ?2 AND reward_ref = ?3",
            params![delta, account_id, reward_ref],
        )?;
        Ok(get_reward_row(&conn, account_id, reward_ref)?)
    }

    async fn mark_reward_claimed(
        &self,
        account_id: &str,
        reward_ref: &str,
        now: i64,
    ) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE reward_progress SET is_claimed = 1, claimed_at = ?1
             WHERE account_id = ?2 AND reward_ref = ?3 AND is_claimed = 0 AND is_completed = 1",
            params![now, account_id, reward_ref],
        )?;
        Ok(updated == 1)
    }

    async fn release_reward_claim(&self, account_id: &str, reward_ref: &str) -> LedgerResult<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE reward_progress SET is_claimed = 0, claimed_at = NULL
             WHERE account_id = ?1 AND reward_ref = ?2 AND is_claimed = 1",
            params![account_id, reward_ref],
        )?;
        Ok(updated == 1)
    }

    async fn add_user_progress(
        &self,
        account_id: &str,
        xp: i64,
        achievement_points: i64,
    ) -> LedgerResult<UserProgress> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_progress (account_id, xp, achievement_points) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id) DO UPDATE SET
                xp = xp + excluded.xp,
                achievement_points = achievement_points + excluded.achievement_points",
            params![account_id, xp, achievement_points],
        )?;
        let progress = conn.query_row(
            "SELECT account_id, xp, achievement_points FROM user_progress WHERE account_id = ?1",
            [account_id],
            |row| {
                Ok(UserProgress {
                    account_id: row.get(0)?,
                    xp: row.get(1)?,
                    achievement_points: row.get(2)?,
                })
            },
        )?;
        Ok(progress)
    }

    async fn get_user_progress(&self, account_id: &str) -> LedgerResult<UserProgress> {
        let conn = self.conn.lock().await;
        let progress = conn
            .query_row(
                "SELECT account_id, xp, achievement_points FROM user_progress WHERE account_id = ?1",
                [account_id],
                |row| {
                    Ok(UserProgress {
                        account_id: row.get(0)?,
                        xp: row.get(1)?,
                        achievement_points: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(progress.unwrap_or_else(|| UserProgress {
            account_id: account_id.to_string(),
            ..Default::default()
        }))
    }
}
