use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use super::{DegreeCount, DegreeDirection, NodeActivity, TransactionStore, schema};
use crate::core::Transaction;
use crate::core::tx::timestamp_from_millis;
use crate::error::StoreError;

pub struct Database {
    conn: Connection,
}

/// Local transaction store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Worker(format!("create {}: {e}", parent.display())))?;
        }
        Ok(Self::from_db(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_db(Database::open_in_memory()?))
    }

    fn from_db(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a blocking closure against the connection off the async workers.
    async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let db = inner
                .lock()
                .map_err(|_| StoreError::Worker("database lock poisoned".into()))?;
            f(&db)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Insert a transaction. A hash already present is left untouched.
    pub fn insert_transaction(&self, tx: &Transaction) -> Result<bool, rusqlite::Error> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO transactions
                (hash, block_number, timestamp_ms, sender, recipient, amount, contract, confirmed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx.hash,
                tx.block_number as i64,
                tx.timestamp.timestamp_millis(),
                tx.from,
                tx.to,
                tx.amount.to_string(),
                tx.contract,
                tx.confirmed,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn transactions_between(
        &self,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, block_number, timestamp_ms, sender, recipient, amount, contract, confirmed
             FROM transactions
             WHERE timestamp_ms BETWEEN ?1 AND ?2
             ORDER BY timestamp_ms DESC, hash DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![start_ms, end_ms, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (hash, block, ts, from, to, amount, contract, confirmed) = row?;
            let amount = Decimal::from_str(&amount)
                .map_err(|e| StoreError::InvalidRow(format!("{hash}: amount {amount:?}: {e}")))?;
            let timestamp = timestamp_from_millis(ts)
                .ok_or_else(|| StoreError::InvalidRow(format!("{hash}: timestamp {ts}")))?;
            out.push(Transaction {
                hash,
                block_number: block as u64,
                timestamp,
                from,
                to,
                amount,
                contract,
                confirmed,
            });
        }
        // Newest rows survive the limit; callers get them oldest first.
        out.reverse();
        Ok(out)
    }

    pub fn node_activity(&self, address: &str) -> Result<Option<NodeActivity>, StoreError> {
        let (count, first, last, sent, received): (i64, Option<i64>, Option<i64>, i64, i64) =
            self.conn.query_row(
                "SELECT COUNT(*), MIN(timestamp_ms), MAX(timestamp_ms),
                        COALESCE(SUM(sender = ?1), 0), COALESCE(SUM(recipient = ?1), 0)
                 FROM transactions
                 WHERE sender = ?1 OR recipient = ?1",
                params![address],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        if count == 0 {
            return Ok(None);
        }

        let previous: Option<i64> = match last {
            Some(last) => self
                .conn
                .query_row(
                    "SELECT MAX(timestamp_ms) FROM transactions
                     WHERE (sender = ?1 OR recipient = ?1) AND timestamp_ms < ?2",
                    params![address, last],
                    |row| row.get(0),
                )
                .optional()?
                .flatten(),
            None => None,
        };

        Ok(Some(NodeActivity {
            address: address.to_string(),
            first_seen: first.and_then(timestamp_from_millis),
            last_seen: last.and_then(timestamp_from_millis),
            previous_seen: previous.and_then(timestamp_from_millis),
            transaction_count: count as u64,
            sent_count: sent as u64,
            received_count: received as u64,
        }))
    }

    pub fn degrees(
        &self,
        start_ms: i64,
        end_ms: i64,
        direction: DegreeDirection,
        min_degree: usize,
    ) -> Result<Vec<DegreeCount>, StoreError> {
        let sql = match direction {
            DegreeDirection::Out => {
                "SELECT sender, COUNT(DISTINCT recipient) AS degree, COUNT(*)
                 FROM transactions WHERE timestamp_ms BETWEEN ?1 AND ?2
                 GROUP BY sender HAVING degree > ?3
                 ORDER BY degree DESC, sender ASC"
            }
            DegreeDirection::In => {
                "SELECT recipient, COUNT(DISTINCT sender) AS degree, COUNT(*)
                 FROM transactions WHERE timestamp_ms BETWEEN ?1 AND ?2
                 GROUP BY recipient HAVING degree > ?3
                 ORDER BY degree DESC, recipient ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![start_ms, end_ms, min_degree as i64], |row| {
            Ok(DegreeCount {
                address: row.get(0)?,
                degree: row.get::<_, i64>(1)? as usize,
                transactions: row.get::<_, i64>(2)? as usize,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn write_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        let tx = tx.clone();
        self.with_db(move |db| {
            if !db.insert_transaction(&tx)? {
                tracing::debug!(tx = %tx.hash, "Transaction already stored");
            }
            Ok(())
        })
        .await
    }

    async fn query_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        self.with_db(move |db| db.transactions_between(start_ms, end_ms, limit))
            .await
    }

    async fn query_node_activity(&self, address: &str) -> Result<Option<NodeActivity>, StoreError> {
        let address = address.to_string();
        self.with_db(move |db| db.node_activity(&address)).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.with_db(|db| {
            db.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn query_degrees(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        direction: DegreeDirection,
        min_degree: usize,
    ) -> Result<Vec<DegreeCount>, StoreError> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        self.with_db(move |db| db.degrees(start_ms, end_ms, direction, min_degree))
            .await
    }
}
