// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lease storage in the operational SQL database.
//!
//! ```sql
//! locks        (resource_key PK, holder_id, acquired_at, expires_at, ttl_ms, fencing_token)
//! lock_fencing (resource_key PK, last_token)
//! ```
//!
//! Exclusion comes from the `locks` primary key: an acquisition first clears
//! an expired row for the key, then inserts; a duplicate-key failure means
//! the lease is live elsewhere. `lock_fencing` outlives the lease rows so
//! tokens keep increasing across release and expiry. Both steps run in one
//! transaction.
//!
//! Expiry compares against the acquiring process's clock, so hosts sharing a
//! lock table need loosely synchronized clocks (skew well under the TTL).

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{Acquisition, Lease, LockManager, Renewal};
use crate::model::now_millis;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::{install_drivers, is_unique_violation, text};
use crate::storage::traits::StorageError;

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        resource_key TEXT PRIMARY KEY,
        holder_id TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        ttl_ms INTEGER NOT NULL,
        fencing_token INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lock_fencing (
        resource_key TEXT PRIMARY KEY,
        last_token INTEGER NOT NULL
    )
    "#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        resource_key VARCHAR(191) PRIMARY KEY,
        holder_id VARCHAR(191) NOT NULL,
        acquired_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL,
        ttl_ms BIGINT NOT NULL,
        fencing_token BIGINT NOT NULL,
        INDEX idx_locks_expires (expires_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lock_fencing (
        resource_key VARCHAR(191) PRIMARY KEY,
        last_token BIGINT NOT NULL
    )
    "#,
];

pub struct SqlLockManager {
    pool: AnyPool,
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl SqlLockManager {
    /// Share an existing pool (usually [`crate::storage::SqlStore::pool`]).
    pub async fn from_pool(pool: AnyPool, is_sqlite: bool) -> Result<Self, StorageError> {
        install_drivers();
        let manager = Self { pool };
        manager.init_schema(is_sqlite).await?;
        Ok(manager)
    }

    async fn init_schema(&self, is_sqlite: bool) -> Result<(), StorageError> {
        let statements = if is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };
        for sql in statements {
            retry("sql_lock_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    async fn try_acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl_ms: u64,
    ) -> Result<Acquisition, StorageError> {
        let now = now_millis();
        let expires_at = now + ttl_ms as i64;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query("DELETE FROM locks WHERE resource_key = ? AND expires_at <= ?")
            .bind(resource_key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let inserted = sqlx::query(
            "INSERT INTO locks (resource_key, holder_id, acquired_at, expires_at, ttl_ms, fencing_token)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(resource_key)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .bind(ttl_ms as i64)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(backend)?;
                return self.busy(resource_key).await;
            }
            Err(e) => return Err(backend(e)),
        }

        let bumped = sqlx::query(
            "UPDATE lock_fencing SET last_token = last_token + 1 WHERE resource_key = ?",
        )
        .bind(resource_key)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if bumped.rows_affected() == 0 {
            sqlx::query("INSERT INTO lock_fencing (resource_key, last_token) VALUES (?, 1)")
                .bind(resource_key)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        let row = sqlx::query("SELECT last_token FROM lock_fencing WHERE resource_key = ?")
            .bind(resource_key)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;
        let token: i64 = row.try_get("last_token").map_err(backend)?;

        sqlx::query("UPDATE locks SET fencing_token = ? WHERE resource_key = ?")
            .bind(token)
            .bind(resource_key)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        debug!(resource_key, holder_id, fencing_token = token, "Lease granted");
        Ok(Acquisition::Granted(Lease {
            resource_key: resource_key.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at,
            ttl_ms,
            fencing_token: token as u64,
        }))
    }

    async fn busy(&self, resource_key: &str) -> Result<Acquisition, StorageError> {
        let row = sqlx::query("SELECT holder_id, expires_at FROM locks WHERE resource_key = ?")
            .bind(resource_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        Ok(Acquisition::Busy {
            holder_id: row.as_ref().and_then(|r| text(r, "holder_id")),
            expires_at: row.as_ref().and_then(|r| r.try_get::<i64, _>("expires_at").ok()),
        })
    }
}

#[async_trait]
impl LockManager for SqlLockManager {
    #[tracing::instrument(skip(self))]
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Acquisition, StorageError> {
        let ttl_ms = ttl.as_millis() as u64;
        retry("sql_lock_acquire", &RetryConfig::query(), || {
            self.try_acquire(resource_key, holder_id, ttl_ms)
        })
        .await
    }

    async fn renew(&self, lease: &Lease) -> Result<Renewal, StorageError> {
        let now = now_millis();
        let expires_at = now + lease.ttl_ms as i64;

        let result = retry("sql_lock_renew", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE locks SET expires_at = ?
                 WHERE resource_key = ? AND holder_id = ? AND fencing_token = ? AND expires_at > ?",
            )
            .bind(expires_at)
            .bind(&lease.resource_key)
            .bind(&lease.holder_id)
            .bind(lease.fencing_token as i64)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;

        if result.rows_affected() == 1 {
            Ok(Renewal::Renewed(Lease {
                expires_at,
                ..lease.clone()
            }))
        } else {
            Ok(Renewal::Expired)
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StorageError> {
        retry("sql_lock_release", &RetryConfig::query(), || async {
            sqlx::query(
                "DELETE FROM locks WHERE resource_key = ? AND holder_id = ? AND fencing_token = ?",
            )
            .bind(&lease.resource_key)
            .bind(&lease.holder_id)
            .bind(lease.fencing_token as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
            Ok(())
        })
        .await
    }
}
