// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the operational store.
//!
//! One table per collection, same layout on SQLite and MySQL:
//!
//! ```sql
//! items            (item_code PK, name, quantity, unit_price, category, location,
//!                   last_synced_at, source_checksum)
//! count_sessions   (session_id PK, status, opened_at, closed_at)
//! count_entries    (session_id, item_code, counted_quantity, counted_by, counted_at,
//!                   status, PK(session_id, item_code))
//! variances        (item_code, session_id, authoritative_quantity, counted_quantity,
//!                   delta, severity, status, created_at, updated_at, resolved_at,
//!                   resolved_by, revision, PK(item_code, session_id))
//! sync_checkpoint  (installation_id PK, last_run_at, last_cursor, items_processed,
//!                   run_status, fencing_token)
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver cannot bind `u64`, so counters are stored as `BIGINT` and
//! cast at the boundary. MySQL `TEXT` columns come back as bytes, so text
//! reads try `String` first and fall back to UTF-8 decoding of `Vec<u8>`.

use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{OperationalStore, StorageError};
use crate::model::{
    AuthoritativeItem, CountEntry, CountSession, ParseEnumError, SyncCheckpoint, VarianceRecord,
    VarianceStatus, WriteOutcome,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS items (
        item_code TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        quantity REAL NOT NULL,
        unit_price REAL NOT NULL DEFAULT 0,
        category TEXT,
        location TEXT,
        last_synced_at INTEGER NOT NULL,
        source_checksum TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_items_last_synced ON items (last_synced_at)",
    r#"
    CREATE TABLE IF NOT EXISTS count_sessions (
        session_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        opened_at INTEGER NOT NULL,
        closed_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS count_entries (
        session_id TEXT NOT NULL,
        item_code TEXT NOT NULL,
        counted_quantity REAL NOT NULL,
        counted_by TEXT NOT NULL,
        counted_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        PRIMARY KEY (session_id, item_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS variances (
        item_code TEXT NOT NULL,
        session_id TEXT NOT NULL,
        authoritative_quantity REAL,
        counted_quantity REAL NOT NULL,
        delta REAL NOT NULL,
        severity TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        resolved_at INTEGER,
        resolved_by TEXT,
        revision INTEGER NOT NULL,
        PRIMARY KEY (item_code, session_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_variances_status ON variances (status)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoint (
        installation_id TEXT PRIMARY KEY,
        last_run_at INTEGER,
        last_cursor TEXT,
        items_processed INTEGER NOT NULL DEFAULT 0,
        run_status TEXT NOT NULL,
        fencing_token INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS items (
        item_code VARCHAR(191) PRIMARY KEY,
        name VARCHAR(512) NOT NULL,
        quantity DOUBLE NOT NULL,
        unit_price DOUBLE NOT NULL DEFAULT 0,
        category VARCHAR(191),
        location VARCHAR(191),
        last_synced_at BIGINT NOT NULL,
        source_checksum VARCHAR(128) NOT NULL,
        INDEX idx_items_last_synced (last_synced_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS count_sessions (
        session_id VARCHAR(191) PRIMARY KEY,
        status VARCHAR(16) NOT NULL,
        opened_at BIGINT NOT NULL,
        closed_at BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS count_entries (
        session_id VARCHAR(191) NOT NULL,
        item_code VARCHAR(191) NOT NULL,
        counted_quantity DOUBLE NOT NULL,
        counted_by VARCHAR(191) NOT NULL,
        counted_at BIGINT NOT NULL,
        status VARCHAR(16) NOT NULL,
        PRIMARY KEY (session_id, item_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS variances (
        item_code VARCHAR(191) NOT NULL,
        session_id VARCHAR(191) NOT NULL,
        authoritative_quantity DOUBLE,
        counted_quantity DOUBLE NOT NULL,
        delta DOUBLE NOT NULL,
        severity VARCHAR(16) NOT NULL,
        status VARCHAR(16) NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        resolved_at BIGINT,
        resolved_by VARCHAR(191),
        revision BIGINT NOT NULL,
        PRIMARY KEY (item_code, session_id),
        INDEX idx_variances_status (status)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoint (
        installation_id VARCHAR(191) PRIMARY KEY,
        last_run_at BIGINT,
        last_cursor VARCHAR(512),
        items_processed BIGINT NOT NULL DEFAULT 0,
        run_status VARCHAR(16) NOT NULL,
        fencing_token BIGINT NOT NULL DEFAULT 0
    )
    "#,
];

const ITEM_COLUMNS: &str =
    "item_code, name, quantity, unit_price, category, location, last_synced_at, source_checksum";
const COUNT_COLUMNS: &str =
    "session_id, item_code, counted_quantity, counted_by, counted_at, status";
const VARIANCE_COLUMNS: &str = "item_code, session_id, authoritative_quantity, counted_quantity, \
     delta, severity, status, created_at, updated_at, resolved_at, resolved_by, revision";

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Clone of the pool, for sharing with [`crate::lock::SqlLockManager`].
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    /// WAL journal lets count submissions read while a sync run writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }
}

// ----- row decoding -----

pub(crate) fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn required_text(
    row: &AnyRow,
    collection: &'static str,
    column: &str,
) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::InvalidRecord {
        collection,
        reason: format!("missing {}", column),
    })
}

fn real(row: &AnyRow, collection: &'static str, column: &str) -> Result<f64, StorageError> {
    row.try_get::<f64, _>(column)
        .ok()
        .or_else(|| row.try_get::<i64, _>(column).ok().map(|v| v as f64))
        .ok_or_else(|| StorageError::InvalidRecord {
            collection,
            reason: format!("missing {}", column),
        })
}

fn optional_real(row: &AnyRow, column: &str) -> Option<f64> {
    row.try_get::<Option<f64>, _>(column)
        .ok()
        .flatten()
        .or_else(|| row.try_get::<Option<i64>, _>(column).ok().flatten().map(|v| v as f64))
}

fn integer(row: &AnyRow, collection: &'static str, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StorageError::InvalidRecord {
            collection,
            reason: format!("{}: {}", column, e),
        })
}

fn optional_integer(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<Option<i64>, _>(column).ok().flatten()
}

fn parse_enum<T>(row: &AnyRow, collection: &'static str, column: &str) -> Result<T, StorageError>
where
    T: FromStr<Err = ParseEnumError>,
{
    required_text(row, collection, column)?
        .parse::<T>()
        .map_err(|e| StorageError::InvalidRecord {
            collection,
            reason: e.to_string(),
        })
}

fn item_from_row(row: &AnyRow) -> Result<AuthoritativeItem, StorageError> {
    Ok(AuthoritativeItem {
        item_code: required_text(row, "items", "item_code")?,
        name: required_text(row, "items", "name")?,
        quantity: real(row, "items", "quantity")?,
        unit_price: real(row, "items", "unit_price")?,
        category: text(row, "category"),
        location: text(row, "location"),
        last_synced_at: integer(row, "items", "last_synced_at")?,
        source_checksum: required_text(row, "items", "source_checksum")?,
    })
}

fn session_from_row(row: &AnyRow) -> Result<CountSession, StorageError> {
    Ok(CountSession {
        session_id: required_text(row, "count_sessions", "session_id")?,
        status: parse_enum(row, "count_sessions", "status")?,
        opened_at: integer(row, "count_sessions", "opened_at")?,
        closed_at: optional_integer(row, "closed_at"),
    })
}

fn count_from_row(row: &AnyRow) -> Result<CountEntry, StorageError> {
    Ok(CountEntry {
        session_id: required_text(row, "count_entries", "session_id")?,
        item_code: required_text(row, "count_entries", "item_code")?,
        counted_quantity: real(row, "count_entries", "counted_quantity")?,
        counted_by: required_text(row, "count_entries", "counted_by")?,
        counted_at: integer(row, "count_entries", "counted_at")?,
        status: parse_enum(row, "count_entries", "status")?,
    })
}

fn variance_from_row(row: &AnyRow) -> Result<VarianceRecord, StorageError> {
    Ok(VarianceRecord {
        item_code: required_text(row, "variances", "item_code")?,
        session_id: required_text(row, "variances", "session_id")?,
        authoritative_quantity: optional_real(row, "authoritative_quantity"),
        counted_quantity: real(row, "variances", "counted_quantity")?,
        delta: real(row, "variances", "delta")?,
        severity: parse_enum(row, "variances", "severity")?,
        status: parse_enum(row, "variances", "status")?,
        created_at: integer(row, "variances", "created_at")?,
        updated_at: integer(row, "variances", "updated_at")?,
        resolved_at: optional_integer(row, "resolved_at"),
        resolved_by: text(row, "resolved_by"),
        revision: integer(row, "variances", "revision")? as u64,
    })
}

fn checkpoint_from_row(row: &AnyRow) -> Result<SyncCheckpoint, StorageError> {
    Ok(SyncCheckpoint {
        installation_id: required_text(row, "sync_checkpoint", "installation_id")?,
        last_run_at: optional_integer(row, "last_run_at"),
        last_cursor: text(row, "last_cursor"),
        items_processed: integer(row, "sync_checkpoint", "items_processed")? as u64,
        run_status: parse_enum(row, "sync_checkpoint", "run_status")?,
        fencing_token: integer(row, "sync_checkpoint", "fencing_token")? as u64,
    })
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl OperationalStore for SqlStore {
    async fn get_item(&self, item_code: &str) -> Result<Option<AuthoritativeItem>, StorageError> {
        let sql = format!("SELECT {} FROM items WHERE item_code = ?", ITEM_COLUMNS);

        let row = retry("sql_get_item", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(item_code)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn upsert_item(&self, item: &AuthoritativeItem) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO items (item_code, name, quantity, unit_price, category, location, last_synced_at, source_checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(item_code) DO UPDATE SET
                name = excluded.name,
                quantity = excluded.quantity,
                unit_price = excluded.unit_price,
                category = excluded.category,
                location = excluded.location,
                last_synced_at = excluded.last_synced_at,
                source_checksum = excluded.source_checksum"
        } else {
            "INSERT INTO items (item_code, name, quantity, unit_price, category, location, last_synced_at, source_checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                name = VALUES(name),
                quantity = VALUES(quantity),
                unit_price = VALUES(unit_price),
                category = VALUES(category),
                location = VALUES(location),
                last_synced_at = VALUES(last_synced_at),
                source_checksum = VALUES(source_checksum)"
        };

        retry("sql_upsert_item", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&item.item_code)
                .bind(&item.name)
                .bind(item.quantity)
                .bind(item.unit_price)
                .bind(&item.category)
                .bind(&item.location)
                .bind(item.last_synced_at)
                .bind(&item.source_checksum)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete_item(&self, item_code: &str) -> Result<bool, StorageError> {
        retry("sql_delete_item", &RetryConfig::query(), || async {
            let result = sqlx::query("DELETE FROM items WHERE item_code = ?")
                .bind(item_code)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn items_synced_before(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<AuthoritativeItem>, StorageError> {
        let sql = format!(
            "SELECT {} FROM items WHERE last_synced_at < ? ORDER BY last_synced_at, item_code LIMIT ?",
            ITEM_COLUMNS
        );

        let rows = retry("sql_items_synced_before", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(cutoff)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn count_items(&self) -> Result<u64, StorageError> {
        let row = retry("sql_count_items", &RetryConfig::query(), || async {
            sqlx::query("SELECT COUNT(*) AS n FROM items")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(integer(&row, "items", "n")? as u64)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<CountSession>, StorageError> {
        let row = retry("sql_get_session", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT session_id, status, opened_at, closed_at FROM count_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn put_session(&self, session: &CountSession) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO count_sessions (session_id, status, opened_at, closed_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET status = excluded.status, closed_at = excluded.closed_at"
        } else {
            "INSERT INTO count_sessions (session_id, status, opened_at, closed_at) VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE status = VALUES(status), closed_at = VALUES(closed_at)"
        };

        retry("sql_put_session", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&session.session_id)
                .bind(session.status.as_str())
                .bind(session.opened_at)
                .bind(session.closed_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_count(
        &self,
        session_id: &str,
        item_code: &str,
    ) -> Result<Option<CountEntry>, StorageError> {
        let sql = format!(
            "SELECT {} FROM count_entries WHERE session_id = ? AND item_code = ?",
            COUNT_COLUMNS
        );

        let row = retry("sql_get_count", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(session_id)
                .bind(item_code)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(count_from_row).transpose()
    }

    async fn put_count(&self, entry: &CountEntry) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO count_entries (session_id, item_code, counted_quantity, counted_by, counted_at, status)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, item_code) DO UPDATE SET
                counted_quantity = excluded.counted_quantity,
                counted_by = excluded.counted_by,
                counted_at = excluded.counted_at,
                status = excluded.status"
        } else {
            "INSERT INTO count_entries (session_id, item_code, counted_quantity, counted_by, counted_at, status)
             VALUES (?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                counted_quantity = VALUES(counted_quantity),
                counted_by = VALUES(counted_by),
                counted_at = VALUES(counted_at),
                status = VALUES(status)"
        };

        retry("sql_put_count", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&entry.session_id)
                .bind(&entry.item_code)
                .bind(entry.counted_quantity)
                .bind(&entry.counted_by)
                .bind(entry.counted_at)
                .bind(entry.status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn counts_for_session(&self, session_id: &str) -> Result<Vec<CountEntry>, StorageError> {
        let sql = format!(
            "SELECT {} FROM count_entries WHERE session_id = ? ORDER BY item_code",
            COUNT_COLUMNS
        );

        let rows = retry("sql_counts_for_session", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(session_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(count_from_row).collect()
    }

    async fn get_variance(
        &self,
        item_code: &str,
        session_id: &str,
    ) -> Result<Option<VarianceRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM variances WHERE item_code = ? AND session_id = ?",
            VARIANCE_COLUMNS
        );

        let row = retry("sql_get_variance", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(item_code)
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(variance_from_row).transpose()
    }

    async fn insert_variance(&self, record: &VarianceRecord) -> Result<WriteOutcome, StorageError> {
        let sql = format!(
            "INSERT INTO variances ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            VARIANCE_COLUMNS
        );

        retry("sql_insert_variance", &RetryConfig::query(), || async {
            let result = sqlx::query(&sql)
                .bind(&record.item_code)
                .bind(&record.session_id)
                .bind(record.authoritative_quantity)
                .bind(record.counted_quantity)
                .bind(record.delta)
                .bind(record.severity.as_str())
                .bind(record.status.as_str())
                .bind(record.created_at)
                .bind(record.updated_at)
                .bind(record.resolved_at)
                .bind(&record.resolved_by)
                .bind(record.revision as i64)
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => Ok(WriteOutcome::Applied),
                Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::Conflict),
                Err(e) => Err(StorageError::Backend(e.to_string())),
            }
        })
        .await
    }

    async fn update_variance(
        &self,
        record: &VarianceRecord,
        expected_revision: u64,
    ) -> Result<WriteOutcome, StorageError> {
        let sql = "UPDATE variances SET
                authoritative_quantity = ?,
                counted_quantity = ?,
                delta = ?,
                severity = ?,
                status = ?,
                updated_at = ?,
                resolved_at = ?,
                resolved_by = ?,
                revision = ?
             WHERE item_code = ? AND session_id = ? AND revision = ?";

        retry("sql_update_variance", &RetryConfig::query(), || async {
            let result = sqlx::query(sql)
                .bind(record.authoritative_quantity)
                .bind(record.counted_quantity)
                .bind(record.delta)
                .bind(record.severity.as_str())
                .bind(record.status.as_str())
                .bind(record.updated_at)
                .bind(record.resolved_at)
                .bind(&record.resolved_by)
                .bind(record.revision as i64)
                .bind(&record.item_code)
                .bind(&record.session_id)
                .bind(expected_revision as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            Ok(if result.rows_affected() == 1 {
                WriteOutcome::Applied
            } else {
                WriteOutcome::Conflict
            })
        })
        .await
    }

    async fn list_variances(
        &self,
        status: Option<VarianceStatus>,
    ) -> Result<Vec<VarianceRecord>, StorageError> {
        let sql = match status {
            Some(_) => format!(
                "SELECT {} FROM variances WHERE status = ? ORDER BY created_at, item_code",
                VARIANCE_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM variances ORDER BY created_at, item_code",
                VARIANCE_COLUMNS
            ),
        };

        let rows = retry("sql_list_variances", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            if let Some(status) = status {
                query = query.bind(status.as_str());
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(variance_from_row).collect()
    }

    async fn load_checkpoint(
        &self,
        installation_id: &str,
    ) -> Result<Option<SyncCheckpoint>, StorageError> {
        let row = retry("sql_load_checkpoint", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT installation_id, last_run_at, last_cursor, items_processed, run_status, fencing_token
                 FROM sync_checkpoint WHERE installation_id = ?",
            )
            .bind(installation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &SyncCheckpoint,
    ) -> Result<WriteOutcome, StorageError> {
        let token = checkpoint.fencing_token as i64;

        let updated = retry("sql_save_checkpoint", &RetryConfig::query(), || async {
            let result = sqlx::query(
                "UPDATE sync_checkpoint SET
                    last_run_at = ?, last_cursor = ?, items_processed = ?, run_status = ?, fencing_token = ?
                 WHERE installation_id = ? AND fencing_token <= ?",
            )
            .bind(checkpoint.last_run_at)
            .bind(&checkpoint.last_cursor)
            .bind(checkpoint.items_processed as i64)
            .bind(checkpoint.run_status.as_str())
            .bind(token)
            .bind(&checkpoint.installation_id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 1 {
            return Ok(WriteOutcome::Applied);
        }

        // Nothing updated: either fenced out, unchanged (MySQL reports 0), or no row yet.
        if let Some(stored) = self.load_checkpoint(&checkpoint.installation_id).await? {
            return Ok(if stored.fencing_token > checkpoint.fencing_token {
                WriteOutcome::Conflict
            } else {
                WriteOutcome::Applied
            });
        }

        retry("sql_insert_checkpoint", &RetryConfig::query(), || async {
            let result = sqlx::query(
                "INSERT INTO sync_checkpoint
                    (installation_id, last_run_at, last_cursor, items_processed, run_status, fencing_token)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&checkpoint.installation_id)
            .bind(checkpoint.last_run_at)
            .bind(&checkpoint.last_cursor)
            .bind(checkpoint.items_processed as i64)
            .bind(checkpoint.run_status.as_str())
            .bind(token)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(WriteOutcome::Applied),
                Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::Conflict),
                Err(e) => Err(StorageError::Backend(e.to_string())),
            }
        })
        .await
    }
}
