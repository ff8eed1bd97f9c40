//! SQLite-backed implementation of the store traits.
//!
//! Follows the teacher's `sql_storage.rs` shape: a single connection guarded
//! by a mutex, `CREATE TABLE IF NOT EXISTS` schema setup run once at open
//! time, and every multi-step invariant wrapped in an explicit
//! `BEGIN IMMEDIATE` transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{PaymentCoreError, Result};
use crate::types::*;

use super::{CatalogRepo, KeyRepo, PaymentRepo, SubscriptionRepo};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                payment_id      TEXT NOT NULL UNIQUE,
                user_id         INTEGER NOT NULL,
                tariff_id       INTEGER NOT NULL,
                amount          INTEGER NOT NULL,
                currency        TEXT NOT NULL,
                email           TEXT,
                status          TEXT NOT NULL,
                country         TEXT,
                protocol        TEXT,
                provider        TEXT NOT NULL,
                method          TEXT,
                description     TEXT,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL,
                paid_at         INTEGER,
                metadata        TEXT NOT NULL DEFAULT '{}',
                subscription_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);
            CREATE INDEX IF NOT EXISTS idx_payments_created_at ON payments(created_at);
            CREATE INDEX IF NOT EXISTS idx_payments_user_id ON payments(user_id);
            CREATE INDEX IF NOT EXISTS idx_payments_tariff_id ON payments(tariff_id);
            CREATE INDEX IF NOT EXISTS idx_payments_user_status ON payments(user_id, status);

            CREATE TABLE IF NOT EXISTS subscriptions (
                id                         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id                    INTEGER NOT NULL,
                subscription_token         TEXT NOT NULL UNIQUE,
                created_at                 INTEGER NOT NULL,
                expires_at                 INTEGER NOT NULL,
                tariff_id                  INTEGER NOT NULL,
                is_active                  INTEGER NOT NULL DEFAULT 1,
                last_updated_at            INTEGER NOT NULL,
                purchase_notification_sent INTEGER NOT NULL DEFAULT 0,
                traffic_limit_mb           INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_subscriptions_user_id ON subscriptions(user_id);

            CREATE TABLE IF NOT EXISTS keys (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id        INTEGER NOT NULL,
                user_id          INTEGER NOT NULL,
                access_url       TEXT NOT NULL,
                traffic_limit_mb INTEGER NOT NULL DEFAULT 0,
                key_id           TEXT NOT NULL,
                created_at       INTEGER NOT NULL,
                email            TEXT NOT NULL,
                tariff_id        INTEGER NOT NULL,
                subscription_id  INTEGER,
                UNIQUE(server_id, subscription_id)
            );

            CREATE TABLE IF NOT EXISTS v2ray_keys (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id        INTEGER NOT NULL,
                user_id          INTEGER NOT NULL,
                v2ray_uuid       TEXT NOT NULL,
                email            TEXT NOT NULL,
                created_at       INTEGER NOT NULL,
                tariff_id        INTEGER NOT NULL,
                client_config    TEXT NOT NULL,
                subscription_id  INTEGER,
                traffic_limit_mb INTEGER NOT NULL DEFAULT 0,
                UNIQUE(server_id, subscription_id)
            );

            CREATE TABLE IF NOT EXISTS tariffs (
                id                 INTEGER PRIMARY KEY,
                name               TEXT NOT NULL,
                duration_sec       INTEGER NOT NULL,
                price_minor_units  INTEGER NOT NULL,
                currency           TEXT NOT NULL,
                traffic_limit_mb   INTEGER NOT NULL DEFAULT 0,
                is_vip             INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS servers (
                id            INTEGER PRIMARY KEY,
                protocol      TEXT NOT NULL,
                api_url       TEXT NOT NULL,
                api_key       TEXT,
                country       TEXT,
                active        INTEGER NOT NULL DEFAULT 1,
                access_level  TEXT NOT NULL DEFAULT 'all'
            );

            CREATE TABLE IF NOT EXISTS users (
                id     INTEGER PRIMARY KEY,
                is_vip INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS referrals (
                referrer_id  INTEGER NOT NULL,
                referred_id  INTEGER NOT NULL,
                bonus_issued INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    /// Test-only seeding helper for the read-only catalog tables, which have
    /// no writer in production (they are populated by an external admin
    /// tool this core does not own).
    #[cfg(test)]
    pub fn seed_tariff(&self, tariff: &Tariff) {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tariffs (id, name, duration_sec, price_minor_units,
                currency, traffic_limit_mb, is_vip) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                tariff.id,
                tariff.name,
                tariff.duration_sec,
                tariff.price_minor_units,
                payment_currency_str_from(tariff.currency),
                tariff.traffic_limit_mb,
                tariff.is_vip as i64,
            ],
        )
        .unwrap();
    }

    #[cfg(test)]
    pub fn seed_server(&self, server: &Server) {
        let conn = self.conn.lock();
        let access_level = match server.access_level {
            AccessLevel::All => "all",
            AccessLevel::Paid => "paid",
            AccessLevel::Vip => "vip",
        };
        conn.execute(
            "INSERT OR REPLACE INTO servers (id, protocol, api_url, api_key, country, active,
                access_level) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                server.id,
                server.protocol.as_str(),
                server.api_url,
                server.api_key,
                server.country,
                server.active as i64,
                access_level,
            ],
        )
        .unwrap();
    }

    #[cfg(test)]
    pub fn seed_user(&self, user: &User) {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, is_vip) VALUES (?1,?2)",
            params![user.id, user.is_vip as i64],
        )
        .unwrap();
    }

    /// Retry wrapper for the primitives that must tolerate SQLITE_BUSY under
    /// concurrent webhook/reconciler access (SPEC_FULL.md §4.1).
    fn with_retry<T>(&self, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let conn = self.conn.lock();
                f(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient_storage() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(
                        RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn row_to_payment(row: &rusqlite::Row) -> rusqlite::Result<Payment> {
    let currency: String = row.get("currency")?;
    let status: String = row.get("status")?;
    let provider: String = row.get("provider")?;
    let protocol: Option<String> = row.get("protocol")?;
    let method: Option<String> = row.get("method")?;
    let metadata_raw: String = row.get("metadata")?;
    let metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();

    Ok(Payment {
        id: row.get("id")?,
        payment_id: row.get("payment_id")?,
        user_id: row.get("user_id")?,
        tariff_id: row.get("tariff_id")?,
        amount: row.get("amount")?,
        currency: Currency::parse(&currency).unwrap_or(Currency::Rub),
        email: row.get("email")?,
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Pending),
        country: row.get("country")?,
        protocol: protocol.as_deref().and_then(VpnProtocol::parse),
        provider: PaymentProvider::parse(&provider).unwrap_or(PaymentProvider::Yookassa),
        method: method.as_deref().and_then(|m| match m {
            "card" => Some(PaymentMethod::Card),
            "sbp" => Some(PaymentMethod::Sbp),
            "wallet" => Some(PaymentMethod::Wallet),
            "bank_transfer" => Some(PaymentMethod::BankTransfer),
            _ => None,
        }),
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        paid_at: row.get("paid_at")?,
        metadata,
        subscription_id: row.get("subscription_id")?,
    })
}

fn row_to_subscription(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        subscription_token: row.get("subscription_token")?,
        created_at: row.get("created_at")?,
        expires_at: row.get("expires_at")?,
        tariff_id: row.get("tariff_id")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        last_updated_at: row.get("last_updated_at")?,
        purchase_notification_sent: row.get::<_, i64>("purchase_notification_sent")? != 0,
        traffic_limit_mb: row.get("traffic_limit_mb")?,
    })
}

#[async_trait]
impl PaymentRepo for SqliteStore {
    async fn create(&self, payment: &Payment) -> Result<Payment> {
        if let Some(existing) = self.get_by_payment_id(&payment.payment_id).await? {
            return Ok(existing);
        }
        let metadata_raw = serde_json::to_string(&payment.metadata)?;
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO payments (payment_id, user_id, tariff_id, amount, currency, email,
                    status, country, protocol, provider, method, description, created_at,
                    updated_at, paid_at, metadata, subscription_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
                 ON CONFLICT(payment_id) DO NOTHING",
                params![
                    payment.payment_id,
                    payment.user_id,
                    payment.tariff_id,
                    payment.amount,
                    payment_currency_str(payment),
                    payment.email,
                    payment.status.as_str(),
                    payment.country,
                    payment.protocol.map(|p| p.as_str()),
                    payment.provider.as_str(),
                    payment.method.map(payment_method_str),
                    payment.description,
                    payment.created_at,
                    payment.updated_at,
                    payment.paid_at,
                    metadata_raw,
                    payment.subscription_id,
                ],
            )?;
            Ok(())
        })?;
        self.get_by_payment_id(&payment.payment_id)
            .await?
            .ok_or_else(|| PaymentCoreError::internal("payment vanished after insert"))
    }

    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<Payment>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM payments WHERE payment_id = ?1",
                    params![payment_id],
                    row_to_payment,
                )
                .optional()?)
        })
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM payments WHERE id = ?1",
                    params![id],
                    row_to_payment,
                )
                .optional()?)
        })
    }

    async fn update(&self, payment: &Payment) -> Result<()> {
        let metadata_raw = serde_json::to_string(&payment.metadata)?;
        let affected = self.with_retry(|conn| {
            Ok(conn.execute(
                "UPDATE payments SET user_id=?1, tariff_id=?2, amount=?3, currency=?4, email=?5,
                    status=?6, country=?7, protocol=?8, provider=?9, method=?10, description=?11,
                    updated_at=?12, paid_at=?13, metadata=?14, subscription_id=?15
                 WHERE payment_id=?16",
                params![
                    payment.user_id,
                    payment.tariff_id,
                    payment.amount,
                    payment_currency_str(payment),
                    payment.email,
                    payment.status.as_str(),
                    payment.country,
                    payment.protocol.map(|p| p.as_str()),
                    payment.provider.as_str(),
                    payment.method.map(payment_method_str),
                    payment.description,
                    payment.updated_at,
                    payment.paid_at,
                    metadata_raw,
                    payment.subscription_id,
                    payment.payment_id,
                ],
            )?)
        })?;
        if affected == 0 {
            return Err(PaymentCoreError::not_found(format!(
                "payment {} not found",
                payment.payment_id
            )));
        }
        Ok(())
    }

    async fn try_update_status(
        &self,
        payment_id: &str,
        to: PaymentStatus,
        expected_from: PaymentStatus,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let paid_at_clause = matches!(to, PaymentStatus::Paid);
        self.with_retry(|conn| {
            let affected = if paid_at_clause {
                conn.execute(
                    "UPDATE payments SET status=?1, updated_at=?2, paid_at=?2
                     WHERE payment_id=?3 AND status=?4",
                    params![to.as_str(), now, payment_id, expected_from.as_str()],
                )?
            } else {
                conn.execute(
                    "UPDATE payments SET status=?1, updated_at=?2
                     WHERE payment_id=?3 AND status=?4",
                    params![to.as_str(), now, payment_id, expected_from.as_str()],
                )?
            };
            Ok(affected > 0)
        })
    }

    async fn try_acquire_processing_lock(
        &self,
        payment_id: &str,
        staleness_seconds: i64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let row: Option<(String, String)> = tx
                .query_row(
                    "SELECT status, metadata FROM payments WHERE payment_id = ?1",
                    params![payment_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((status, metadata_raw)) = row else {
                return Ok(false);
            };
            if status == PaymentStatus::Completed.as_str() {
                return Ok(false);
            }
            let mut metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();
            if let Some(started_at) = metadata
                .get(METADATA_PROCESSING_LOCK_STARTED_AT)
                .and_then(|v| v.as_i64())
            {
                if metadata
                    .get(METADATA_PROCESSING_LOCK)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                    && now - started_at < staleness_seconds
                {
                    return Ok(false);
                }
            }
            metadata.insert(METADATA_PROCESSING_LOCK.to_string(), serde_json::json!(true));
            metadata.insert(
                METADATA_PROCESSING_LOCK_STARTED_AT.to_string(),
                serde_json::json!(now),
            );
            let metadata_raw = serde_json::to_string(&metadata).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?;
            let affected = tx.execute(
                "UPDATE payments SET metadata=?1 WHERE payment_id=?2 AND status != ?3",
                params![metadata_raw, payment_id, PaymentStatus::Completed.as_str()],
            )?;
            tx.commit()?;
            Ok(affected > 0)
        })
    }

    async fn release_processing_lock(&self, payment_id: &str) -> Result<()> {
        self.with_retry(|conn| {
            let metadata_raw: Option<String> = conn
                .query_row(
                    "SELECT metadata FROM payments WHERE payment_id = ?1",
                    params![payment_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(metadata_raw) = metadata_raw else {
                return Ok(());
            };
            let mut metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();
            metadata.remove(METADATA_PROCESSING_LOCK);
            metadata.remove(METADATA_PROCESSING_LOCK_STARTED_AT);
            let metadata_raw = serde_json::to_string(&metadata).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?;
            conn.execute(
                "UPDATE payments SET metadata=?1 WHERE payment_id=?2",
                params![metadata_raw, payment_id],
            )?;
            Ok(())
        })
    }

    async fn update_subscription_id(&self, payment_id: &str, subscription_id: i64) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE payments SET subscription_id=?1 WHERE payment_id=?2",
                params![subscription_id, payment_id],
            )?;
            Ok(())
        })
    }

    async fn try_set_metadata_flag(&self, payment_id: &str, key: &str) -> Result<bool> {
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let metadata_raw: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM payments WHERE payment_id = ?1",
                    params![payment_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(metadata_raw) = metadata_raw else {
                return Ok(false);
            };
            let mut metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();
            if metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(false) {
                return Ok(false);
            }
            metadata.insert(key.to_string(), serde_json::json!(true));
            let metadata_raw = serde_json::to_string(&metadata).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?;
            tx.execute(
                "UPDATE payments SET metadata=?1 WHERE payment_id=?2",
                params![metadata_raw, payment_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    async fn filter(
        &self,
        filter: &PaymentFilter,
        sort_by: SortBy,
        sort_order: SortOrder,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payment>> {
        let (clause, values) = build_filter_clause(filter);
        let order = match sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT * FROM payments WHERE 1=1 {} ORDER BY {} {} LIMIT ?{} OFFSET ?{}",
            clause,
            sort_by.column(),
            order,
            values.len() + 1,
            values.len() + 2
        );
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut all_params: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            all_params.push(&limit);
            all_params.push(&offset);
            let rows = stmt.query_map(all_params.as_slice(), row_to_payment)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    async fn count_filtered(&self, filter: &PaymentFilter) -> Result<i64> {
        let (clause, values) = build_filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM payments WHERE 1=1 {}", clause);
        self.with_retry(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            Ok(conn.query_row(&sql, params_refs.as_slice(), |r| r.get(0))?)
        })
    }

    async fn get_paid_payments_without_keys(&self) -> Result<Vec<Payment>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.* FROM payments p
                 LEFT JOIN subscriptions s ON p.subscription_id = s.id
                 WHERE p.status = 'paid'
                   AND (
                     p.protocol = 'v2ray'
                     OR NOT EXISTS (
                       SELECT 1 FROM v2ray_keys k WHERE k.subscription_id = p.subscription_id
                       UNION
                       SELECT 1 FROM keys k2 WHERE k2.subscription_id = p.subscription_id
                     )
                   )",
            )?;
            let rows = stmt.query_map([], row_to_payment)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    async fn get_pending_payments(&self) -> Result<Vec<Payment>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM payments WHERE status = 'pending'")?;
            let rows = stmt.query_map([], row_to_payment)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    async fn get_statistics(&self) -> Result<PaymentStatistics> {
        self.with_retry(|conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))?;
            let (completed, sum): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), SUM(amount) FROM payments WHERE status = 'completed'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(PaymentStatistics {
                total_payments: total,
                completed_payments: completed,
                completed_amount_sum: sum.unwrap_or(0),
            })
        })
    }
}

fn payment_currency_str(p: &Payment) -> &'static str {
    payment_currency_str_from(p.currency)
}

fn payment_currency_str_from(currency: Currency) -> &'static str {
    match currency {
        Currency::Rub => "RUB",
        Currency::Usd => "USD",
        Currency::Eur => "EUR",
    }
}

fn payment_method_str(m: PaymentMethod) -> &'static str {
    match m {
        PaymentMethod::Card => "card",
        PaymentMethod::Sbp => "sbp",
        PaymentMethod::Wallet => "wallet",
        PaymentMethod::BankTransfer => "bank_transfer",
    }
}

fn build_filter_clause(filter: &PaymentFilter) -> (String, Vec<rusqlite::types::Value>) {
    let mut clause = String::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(user_id) = filter.user_id {
        values.push(rusqlite::types::Value::Integer(user_id));
        clause.push_str(&format!(" AND user_id = ?{}", values.len()));
    }
    if let Some(tariff_id) = filter.tariff_id {
        values.push(rusqlite::types::Value::Integer(tariff_id));
        clause.push_str(&format!(" AND tariff_id = ?{}", values.len()));
    }
    if let Some(status) = filter.status {
        values.push(rusqlite::types::Value::Text(status.as_str().to_string()));
        clause.push_str(&format!(" AND status = ?{}", values.len()));
    }
    if let Some(provider) = filter.provider {
        values.push(rusqlite::types::Value::Text(provider.as_str().to_string()));
        clause.push_str(&format!(" AND provider = ?{}", values.len()));
    }
    if let Some(protocol) = filter.protocol {
        values.push(rusqlite::types::Value::Text(protocol.as_str().to_string()));
        clause.push_str(&format!(" AND protocol = ?{}", values.len()));
    }
    if let Some(country) = &filter.country {
        values.push(rusqlite::types::Value::Text(country.clone()));
        clause.push_str(&format!(" AND country = ?{}", values.len()));
    }
    if let Some(after) = filter.created_after {
        values.push(rusqlite::types::Value::Integer(after));
        clause.push_str(&format!(" AND created_at >= ?{}", values.len()));
    }
    if let Some(before) = filter.created_before {
        values.push(rusqlite::types::Value::Integer(before));
        clause.push_str(&format!(" AND created_at <= ?{}", values.len()));
    }
    if let Some(query) = &filter.query {
        values.push(rusqlite::types::Value::Text(format!("%{}%", query)));
        let idx = values.len();
        clause.push_str(&format!(
            " AND (payment_id LIKE ?{idx} OR email LIKE ?{idx} OR description LIKE ?{idx})"
        ));
    }

    (clause, values)
}

#[async_trait]
impl SubscriptionRepo for SqliteStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<Subscription>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM subscriptions WHERE id = ?1",
                    params![id],
                    row_to_subscription,
                )
                .optional()?)
        })
    }

    async fn get_active_for_user(&self, user_id: i64, now: i64) -> Result<Option<Subscription>> {
        let threshold = now - ACTIVE_GRACE_SECONDS;
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM subscriptions WHERE user_id = ?1 AND is_active = 1
                     AND expires_at > ?2 ORDER BY expires_at DESC LIMIT 1",
                    params![user_id, threshold],
                    row_to_subscription,
                )
                .optional()?)
        })
    }

    async fn get_or_create_active(
        &self,
        user_id: i64,
        tariff_id: i64,
        traffic_limit_mb: i64,
        now: i64,
    ) -> Result<(Subscription, bool)> {
        let threshold = now - ACTIVE_GRACE_SECONDS;
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM subscriptions WHERE user_id = ?1 AND is_active = 1
                     AND expires_at > ?2 ORDER BY expires_at DESC LIMIT 1",
                    params![user_id, threshold],
                    |r| r.get(0),
                )
                .optional()?;
            let (id, created) = if let Some(id) = existing {
                (id, false)
            } else {
                let token = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO subscriptions (user_id, subscription_token, created_at,
                        expires_at, tariff_id, is_active, last_updated_at,
                        purchase_notification_sent, traffic_limit_mb)
                     VALUES (?1,?2,?3,?3,?4,1,?3,0,?5)",
                    params![user_id, token, now, tariff_id, traffic_limit_mb],
                )?;
                (tx.last_insert_rowid(), true)
            };
            tx.commit()?;
            let row = conn.query_row(
                "SELECT * FROM subscriptions WHERE id = ?1",
                params![id],
                row_to_subscription,
            )?;
            Ok((row, created))
        })
    }

    async fn set_expiry_and_traffic_limit(
        &self,
        subscription_id: i64,
        expires_at: i64,
        traffic_limit_mb: i64,
        tariff_id: i64,
    ) -> Result<Subscription> {
        let now = chrono::Utc::now().timestamp();
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE subscriptions SET expires_at=?1, traffic_limit_mb=?2, tariff_id=?3,
                    last_updated_at=?4, is_active=1 WHERE id=?5",
                params![expires_at, traffic_limit_mb, tariff_id, now, subscription_id],
            )?;
            tx.commit()?;
            Ok(conn.query_row(
                "SELECT * FROM subscriptions WHERE id = ?1",
                params![subscription_id],
                row_to_subscription,
            )?)
        })
    }

    async fn try_mark_purchase_notified(&self, subscription_id: i64) -> Result<bool> {
        self.with_retry(|conn| {
            let affected = conn.execute(
                "UPDATE subscriptions SET purchase_notification_sent=1
                 WHERE id=?1 AND purchase_notification_sent=0",
                params![subscription_id],
            )?;
            Ok(affected > 0)
        })
    }

    async fn count_keys(&self, subscription_id: i64) -> Result<i64> {
        self.with_retry(|conn| {
            let a: i64 = conn.query_row(
                "SELECT COUNT(*) FROM v2ray_keys WHERE subscription_id = ?1",
                params![subscription_id],
                |r| r.get(0),
            )?;
            let b: i64 = conn.query_row(
                "SELECT COUNT(*) FROM keys WHERE subscription_id = ?1",
                params![subscription_id],
                |r| r.get(0),
            )?;
            Ok(a + b)
        })
    }

    async fn sum_completed_tariff_duration(&self, subscription_id: i64) -> Result<i64> {
        self.with_retry(|conn| {
            let sum: Option<i64> = conn.query_row(
                "SELECT SUM(t.duration_sec) FROM payments p
                 JOIN tariffs t ON t.id = p.tariff_id
                 WHERE p.subscription_id = ?1 AND p.status = 'completed'",
                params![subscription_id],
                |r| r.get(0),
            )?;
            Ok(sum.unwrap_or(0))
        })
    }

    async fn earliest_completed_payment_created_at(
        &self,
        subscription_id: i64,
    ) -> Result<Option<i64>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT MIN(created_at) FROM payments
                     WHERE subscription_id = ?1 AND status = 'completed'",
                    params![subscription_id],
                    |r| r.get(0),
                )
                .optional()?
                .flatten())
        })
    }
}

#[async_trait]
impl KeyRepo for SqliteStore {
    async fn get_outline_key(
        &self,
        server_id: i64,
        subscription_id: i64,
    ) -> Result<Option<OutlineKey>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM keys WHERE server_id = ?1 AND subscription_id = ?2",
                    params![server_id, subscription_id],
                    row_to_outline_key,
                )
                .optional()?)
        })
    }

    async fn insert_outline_key(&self, key: &OutlineKey) -> Result<OutlineKey> {
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM keys WHERE server_id = ?1 AND subscription_id = ?2",
                    params![key.server_id, key.subscription_id],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_some() {
                tx.commit()?;
                return Err(PaymentCoreError::consistency(
                    "outline key already exists for (server_id, subscription_id)",
                ));
            }
            tx.execute(
                "INSERT INTO keys (server_id, user_id, access_url, traffic_limit_mb, key_id,
                    created_at, email, tariff_id, subscription_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    key.server_id,
                    key.user_id,
                    key.access_url,
                    key.traffic_limit_mb,
                    key.key_id,
                    key.created_at,
                    key.email,
                    key.tariff_id,
                    key.subscription_id,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(conn.query_row(
                "SELECT * FROM keys WHERE id = ?1",
                params![id],
                row_to_outline_key,
            )?)
        })
    }

    async fn get_v2ray_key(&self, server_id: i64, subscription_id: i64) -> Result<Option<V2rayKey>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM v2ray_keys WHERE server_id = ?1 AND subscription_id = ?2",
                    params![server_id, subscription_id],
                    row_to_v2ray_key,
                )
                .optional()?)
        })
    }

    async fn insert_v2ray_key(&self, key: &V2rayKey) -> Result<V2rayKey> {
        self.with_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM v2ray_keys WHERE server_id = ?1 AND subscription_id = ?2",
                    params![key.server_id, key.subscription_id],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_some() {
                tx.commit()?;
                return Err(PaymentCoreError::consistency(
                    "v2ray key already exists for (server_id, subscription_id)",
                ));
            }
            tx.execute(
                "INSERT INTO v2ray_keys (server_id, user_id, v2ray_uuid, email, created_at,
                    tariff_id, client_config, subscription_id, traffic_limit_mb)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    key.server_id,
                    key.user_id,
                    key.v2ray_uuid,
                    key.email,
                    key.created_at,
                    key.tariff_id,
                    key.client_config,
                    key.subscription_id,
                    key.traffic_limit_mb,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(conn.query_row(
                "SELECT * FROM v2ray_keys WHERE id = ?1",
                params![id],
                row_to_v2ray_key,
            )?)
        })
    }

    async fn keys_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<(Vec<OutlineKey>, Vec<V2rayKey>)> {
        self.with_retry(|conn| {
            let mut outline_stmt =
                conn.prepare("SELECT * FROM keys WHERE subscription_id = ?1")?;
            let outline: Vec<OutlineKey> = outline_stmt
                .query_map(params![subscription_id], row_to_outline_key)?
                .collect::<rusqlite::Result<_>>()?;
            let mut v2ray_stmt =
                conn.prepare("SELECT * FROM v2ray_keys WHERE subscription_id = ?1")?;
            let v2ray: Vec<V2rayKey> = v2ray_stmt
                .query_map(params![subscription_id], row_to_v2ray_key)?
                .collect::<rusqlite::Result<_>>()?;
            Ok((outline, v2ray))
        })
    }

    async fn reset_traffic_counters(&self, _subscription_id: i64) -> Result<()> {
        // Traffic counters live on the remote VPN servers; the local schema
        // keeps no cached counter to reset here. Present for symmetry with
        // the VPNAdapter-level reset triggered by the purchase service.
        Ok(())
    }

    async fn has_active_credential(
        &self,
        user_id: i64,
        protocol: VpnProtocol,
        now: i64,
    ) -> Result<bool> {
        let threshold = now - ACTIVE_GRACE_SECONDS;
        self.with_retry(|conn| {
            let count: i64 = match protocol {
                VpnProtocol::V2ray => conn.query_row(
                    "SELECT COUNT(*) FROM v2ray_keys k
                     JOIN subscriptions s ON s.id = k.subscription_id
                     WHERE k.user_id = ?1 AND s.expires_at > ?2",
                    params![user_id, threshold],
                    |r| r.get(0),
                )?,
                VpnProtocol::Outline => conn.query_row(
                    "SELECT COUNT(*) FROM keys k
                     JOIN subscriptions s ON s.id = k.subscription_id
                     WHERE k.user_id = ?1 AND s.expires_at > ?2",
                    params![user_id, threshold],
                    |r| r.get(0),
                )?,
            };
            Ok(count > 0)
        })
    }
}

fn row_to_outline_key(row: &rusqlite::Row) -> rusqlite::Result<OutlineKey> {
    Ok(OutlineKey {
        id: row.get("id")?,
        server_id: row.get("server_id")?,
        user_id: row.get("user_id")?,
        access_url: row.get("access_url")?,
        traffic_limit_mb: row.get("traffic_limit_mb")?,
        key_id: row.get("key_id")?,
        created_at: row.get("created_at")?,
        email: row.get("email")?,
        tariff_id: row.get("tariff_id")?,
        subscription_id: row.get("subscription_id")?,
    })
}

fn row_to_v2ray_key(row: &rusqlite::Row) -> rusqlite::Result<V2rayKey> {
    Ok(V2rayKey {
        id: row.get("id")?,
        server_id: row.get("server_id")?,
        user_id: row.get("user_id")?,
        v2ray_uuid: row.get("v2ray_uuid")?,
        email: row.get("email")?,
        created_at: row.get("created_at")?,
        tariff_id: row.get("tariff_id")?,
        client_config: row.get("client_config")?,
        subscription_id: row.get("subscription_id")?,
        traffic_limit_mb: row.get("traffic_limit_mb")?,
    })
}

fn row_to_server(row: &rusqlite::Row) -> rusqlite::Result<Server> {
    let protocol: String = row.get("protocol")?;
    let access_level: String = row.get("access_level")?;
    Ok(Server {
        id: row.get("id")?,
        protocol: VpnProtocol::parse(&protocol).unwrap_or(VpnProtocol::V2ray),
        api_url: row.get("api_url")?,
        api_key: row.get("api_key")?,
        country: row.get("country")?,
        active: row.get::<_, i64>("active")? != 0,
        access_level: match access_level.as_str() {
            "vip" => AccessLevel::Vip,
            "paid" => AccessLevel::Paid,
            _ => AccessLevel::All,
        },
    })
}

#[async_trait]
impl CatalogRepo for SqliteStore {
    async fn get_tariff(&self, id: i64) -> Result<Option<Tariff>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row("SELECT * FROM tariffs WHERE id = ?1", params![id], |row| {
                    let currency: String = row.get("currency")?;
                    Ok(Tariff {
                        id: row.get("id")?,
                        name: row.get("name")?,
                        duration_sec: row.get("duration_sec")?,
                        price_minor_units: row.get("price_minor_units")?,
                        currency: Currency::parse(&currency).unwrap_or(Currency::Rub),
                        traffic_limit_mb: row.get("traffic_limit_mb")?,
                        is_vip: row.get::<_, i64>("is_vip")? != 0,
                    })
                })
                .optional()?)
        })
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.with_retry(|conn| {
            Ok(conn
                .query_row("SELECT * FROM users WHERE id = ?1", params![id], |row| {
                    Ok(User {
                        id: row.get("id")?,
                        is_vip: row.get::<_, i64>("is_vip")? != 0,
                    })
                })
                .optional()?)
        })
    }

    async fn active_servers(&self, protocol: VpnProtocol) -> Result<Vec<Server>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM servers WHERE protocol = ?1 AND active = 1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![protocol.as_str()], row_to_server)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    async fn has_active_paid_subscription(&self, user_id: i64, now: i64) -> Result<bool> {
        let threshold = now - ACTIVE_GRACE_SECONDS;
        self.with_retry(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM subscriptions WHERE user_id = ?1 AND expires_at > ?2",
                params![user_id, threshold],
                |r| r.get(0),
            )?;
            Ok(count > 0)
        })
    }

    async fn eligible_referral_count(&self, user_id: i64, cutoff: i64) -> Result<i64> {
        self.with_retry(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM referrals r
                 WHERE r.referrer_id = ?1 AND r.bonus_issued = 1
                   AND EXISTS (
                     SELECT 1 FROM payments p
                     WHERE p.user_id = r.referred_id AND p.status = 'completed'
                       AND p.amount > 0 AND p.created_at <= ?2
                   )",
                params![user_id, cutoff],
                |r| r.get(0),
            )?)
        })
    }

    async fn referrals(&self, user_id: i64) -> Result<Vec<Referral>> {
        self.with_retry(|conn| {
            let mut stmt =
                conn.prepare("SELECT referrer_id, referred_id, bonus_issued FROM referrals WHERE referrer_id = ?1")?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(Referral {
                    referrer_id: row.get(0)?,
                    referred_id: row.get(1)?,
                    bonus_issued: row.get::<_, i64>(2)? != 0,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }
}

#[allow(dead_code)]
fn empty_metadata() -> HashMap<String, serde_json::Value> {
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payment(payment_id: &str, user_id: i64) -> Payment {
        let now = 1_700_000_000;
        Payment {
            id: 0,
            payment_id: payment_id.to_string(),
            user_id,
            tariff_id: 1,
            amount: 19_900,
            currency: Currency::Rub,
            email: Some("user@example.com".to_string()),
            status: PaymentStatus::Pending,
            country: None,
            protocol: Some(VpnProtocol::V2ray),
            provider: PaymentProvider::Yookassa,
            method: None,
            description: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            metadata: {
                let mut m = Metadata::new();
                m.insert(
                    METADATA_KEY_TYPE.to_string(),
                    serde_json::json!(METADATA_VALUE_SUBSCRIPTION),
                );
                m
            },
            subscription_id: None,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_on_payment_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = sample_payment("pay_1", 42);
        let a = PaymentRepo::create(&store, &p).await.unwrap();
        let b = PaymentRepo::create(&store, &p).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn cas_status_transition_only_succeeds_from_expected_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = sample_payment("pay_2", 42);
        PaymentRepo::create(&store, &p).await.unwrap();
        let first = store
            .try_update_status("pay_2", PaymentStatus::Paid, PaymentStatus::Pending)
            .await
            .unwrap();
        assert!(first);
        let second = store
            .try_update_status("pay_2", PaymentStatus::Paid, PaymentStatus::Pending)
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn processing_lock_rejects_concurrent_holder_until_stale() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = sample_payment("pay_3", 42);
        PaymentRepo::create(&store, &p).await.unwrap();
        let first = store.try_acquire_processing_lock("pay_3", 600).await.unwrap();
        assert!(first);
        let second = store.try_acquire_processing_lock("pay_3", 600).await.unwrap();
        assert!(!second);
        // Staleness window of zero seconds means any existing lock is stale.
        let third = store.try_acquire_processing_lock("pay_3", 0).await.unwrap();
        assert!(third);
    }

    #[tokio::test]
    async fn get_or_create_active_subscription_is_stable_across_calls() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = 1_700_000_000;
        let (first, created_first) = store.get_or_create_active(7, 1, 1000, now).await.unwrap();
        assert!(created_first);
        let (second, created_second) = store.get_or_create_active(7, 1, 1000, now).await.unwrap();
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn duplicate_key_insert_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (sub, _) = store.get_or_create_active(1, 1, 0, 1_700_000_000).await.unwrap();
        let key = V2rayKey {
            id: 0,
            server_id: 1,
            user_id: 1,
            v2ray_uuid: "uuid-1".to_string(),
            email: "1@vpn".to_string(),
            created_at: 1_700_000_000,
            tariff_id: 1,
            client_config: "vless://...".to_string(),
            subscription_id: Some(sub.id),
            traffic_limit_mb: 0,
        };
        KeyRepo::insert_v2ray_key(&store, &key).await.unwrap();
        let err = KeyRepo::insert_v2ray_key(&store, &key).await.unwrap_err();
        assert!(matches!(err, PaymentCoreError::Consistency(_)));
    }
}
