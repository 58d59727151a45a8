//! SQLite storage backend implementation.
//!
//! This module provides a persistent voucher store for single-instance
//! deployments. The redemption transition is a single conditional `UPDATE`
//! whose changed-row count decides the winner of concurrent redemptions.

use super::{StorageStats, VoucherStore};
use crate::voucher::error::VoucherError;
use crate::voucher::record::{Member, Voucher, VoucherDetails, VoucherKind, VoucherStatus};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::{Arc, Mutex, MutexGuard};

const VOUCHER_COLUMNS: &str =
    "id, member_id, status, redeemed_at, tag, friendly_code, details";

/// SQLite-based storage backend for vouchers and members.
///
/// # Features
///
/// - **Persistent storage**: Data survives application restarts
/// - **Atomic redemption**: One `UPDATE … WHERE` per transition, no read-then-write
/// - **Case-insensitive code lookups**: Typed codes compare with `COLLATE NOCASE`;
///   `find_by_id` stays exact
/// - **Thread-safe**: Uses `Arc<Mutex<Connection>>` for concurrent access
///
/// # Example
///
/// ```rust
/// use voucher_redeem::storage::SqliteVoucherStore;
///
/// # fn example() -> Result<(), voucher_redeem::VoucherError> {
/// // File-based storage
/// let storage = SqliteVoucherStore::new("./data/vouchers.db")?;
///
/// // In-memory storage (for testing)
/// let memory_storage = SqliteVoucherStore::new(":memory:")?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteVoucherStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteVoucherStore {
    /// Create a new SQLite storage backend.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file, or ":memory:" for in-memory database
    pub fn new(db_path: &str) -> Result<Self, VoucherError> {
        let connection = if db_path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(db_path)
        };

        let connection = connection.map_err(VoucherError::from_database_error)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, VoucherError> {
        self.connection
            .lock()
            .map_err(|_| VoucherError::from_database_message("SQLite connection lock poisoned"))
    }

    /// Create the database schema if it doesn't exist.
    fn init_schema(&self) -> Result<(), VoucherError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vouchers (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                status TEXT NOT NULL,
                redeemed_at INTEGER,
                tag TEXT,
                friendly_code TEXT COLLATE NOCASE,
                details TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );
            CREATE INDEX IF NOT EXISTS idx_voucher_friendly_code
                ON vouchers (kind, friendly_code);
            CREATE TABLE IF NOT EXISTS members (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT
            );
            "#,
        )
        .map_err(VoucherError::from_database_error)?;

        Ok(())
    }

    fn read_voucher(row: &Row<'_>) -> rusqlite::Result<StoredVoucher> {
        Ok(StoredVoucher {
            id: row.get(0)?,
            member_id: row.get(1)?,
            status: row.get(2)?,
            redeemed_at: row.get(3)?,
            tag: row.get(4)?,
            friendly_code: row.get(5)?,
            details: row.get(6)?,
        })
    }
}

/// Raw row, converted outside the rusqlite closure so domain errors propagate.
struct StoredVoucher {
    id: String,
    member_id: String,
    status: String,
    redeemed_at: Option<i64>,
    tag: Option<String>,
    friendly_code: Option<String>,
    details: String,
}

impl StoredVoucher {
    fn into_voucher(self) -> Result<Voucher, VoucherError> {
        let details: VoucherDetails = serde_json::from_str(&self.details).map_err(|e| {
            VoucherError::from_database_message(format!("corrupt voucher details: {e}"))
        })?;
        Ok(Voucher {
            id: self.id,
            member_id: self.member_id,
            status: self.status.parse()?,
            redeemed_at: self.redeemed_at,
            tag: self.tag,
            friendly_code: self.friendly_code,
            details,
        })
    }
}

#[async_trait]
impl VoucherStore for SqliteVoucherStore {
    async fn init(&self) -> Result<(), VoucherError> {
        self.init_schema()
    }

    async fn insert(&self, voucher: &Voucher) -> Result<(), VoucherError> {
        let details = serde_json::to_string(&voucher.details)
            .map_err(|e| VoucherError::EncodingError(e.to_string()))?;
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO vouchers (kind, id, member_id, status, redeemed_at, tag, friendly_code, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                voucher.kind().as_str(),
                voucher.id,
                voucher.member_id,
                voucher.status.as_str(),
                voucher.redeemed_at,
                voucher.tag,
                voucher.friendly_code,
                details,
            ],
        )
        .map_err(VoucherError::from_database_error)?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        kind: VoucherKind,
        id: &str,
    ) -> Result<Option<Voucher>, VoucherError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {VOUCHER_COLUMNS} FROM vouchers WHERE kind = ?1 AND id = ?2"),
                params![kind.as_str(), id],
                Self::read_voucher,
            )
            .optional()
            .map_err(VoucherError::from_database_error)?;

        row.map(StoredVoucher::into_voucher).transpose()
    }

    async fn find_by_friendly_code_or_id(
        &self,
        kind: VoucherKind,
        code: &str,
    ) -> Result<Option<Voucher>, VoucherError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {VOUCHER_COLUMNS} FROM vouchers
                     WHERE kind = ?1 AND (friendly_code = ?2 OR id = ?2 COLLATE NOCASE)
                     ORDER BY CASE WHEN friendly_code = ?2 THEN 0 ELSE 1 END
                     LIMIT 1"
                ),
                params![kind.as_str(), code],
                Self::read_voucher,
            )
            .optional()
            .map_err(VoucherError::from_database_error)?;

        row.map(StoredVoucher::into_voucher).transpose()
    }

    async fn transition_to_redeemed(
        &self,
        kind: VoucherKind,
        id: &str,
        redeemed_at: i64,
    ) -> Result<u64, VoucherError> {
        let conn = self.lock()?;

        let changes = match kind {
            VoucherKind::Tourism => conn.execute(
                "UPDATE vouchers SET redeemed_at = ?3
                 WHERE kind = ?1 AND id = ?2 AND status = ?4 AND redeemed_at IS NULL",
                params![kind.as_str(), id, redeemed_at, VoucherStatus::Paid.as_str()],
            ),
            _ => conn.execute(
                "UPDATE vouchers SET status = ?4, redeemed_at = ?3
                 WHERE kind = ?1 AND id = ?2 AND status IN (?5, ?6)",
                params![
                    kind.as_str(),
                    id,
                    redeemed_at,
                    VoucherStatus::Redeemed.as_str(),
                    VoucherStatus::Active.as_str(),
                    VoucherStatus::Pending.as_str(),
                ],
            ),
        }
        .map_err(VoucherError::from_database_error)?;

        Ok(changes as u64)
    }

    async fn upsert_member(&self, member: &Member) -> Result<(), VoucherError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO members (id, name, email) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
            params![member.id, member.name, member.email],
        )
        .map_err(VoucherError::from_database_error)?;
        Ok(())
    }

    async fn find_member(&self, member_id: &str) -> Result<Option<Member>, VoucherError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, email FROM members WHERE id = ?1",
            params![member_id],
            |row| {
                Ok(Member {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(VoucherError::from_database_error)
    }

    async fn get_stats(&self) -> Result<StorageStats, VoucherError> {
        let conn = self.lock()?;

        let (total, redeemed): (usize, usize) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(redeemed_at IS NOT NULL), 0) FROM vouchers",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(VoucherError::from_database_error)?;

        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(4096);

        Ok(StorageStats {
            total_vouchers: total,
            redeemed_vouchers: redeemed,
            backend_info: format!(
                "SQLite storage ({} bytes, {} pages)",
                page_count * page_size,
                page_count
            ),
        })
    }
}
