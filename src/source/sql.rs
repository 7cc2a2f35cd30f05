// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Keyset-paginated reader over the authoritative SQL table.
//!
//! Expected columns:
//!
//! ```sql
//! item_code, name, quantity, unit_price, category, location, revision
//! [, <deleted column>]   -- optional, truthy when the row is a deletion
//! ```
//!
//! Each page is exactly one parameterized `SELECT`:
//!
//! ```sql
//! SELECT ... FROM <table>
//! WHERE revision > ? OR (revision = ? AND item_code > ?)
//! ORDER BY revision, item_code
//! LIMIT ?
//! ```
//!
//! The reader holds no other statement. SQLite URLs are opened with
//! `mode=ro` so the driver itself refuses writes.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::{SourceCursor, SourceError, SourcePage, SourceReader};
use crate::model::SourceRecord;
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::sql::{install_drivers, text};

pub struct SqlSourceReader {
    pool: AnyPool,
    page_sql: String,
    has_deleted_column: bool,
}

impl SqlSourceReader {
    /// Connect read-only to `connection_string` and read from `table`.
    ///
    /// `deleted_column`, when set, names a column whose truthy value marks
    /// the row as an explicit deletion.
    pub async fn connect(
        connection_string: &str,
        table: &str,
        deleted_column: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        install_drivers();

        if !is_identifier(table) {
            return Err(SourceError::Schema(format!("invalid source table name '{}'", table)));
        }
        if let Some(column) = deleted_column.filter(|c| !is_identifier(c)) {
            return Err(SourceError::Schema(format!("invalid deleted column name '{}'", column)));
        }

        let url = read_only_url(connection_string);
        let pool = retry_if(
            "source_connect",
            &RetryConfig::startup(),
            || async {
                AnyPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(timeout)
                    .idle_timeout(Duration::from_secs(300))
                    .connect(&url)
                    .await
                    .map_err(classify)
            },
            SourceError::is_retryable,
        )
        .await?;

        Ok(Self::from_pool(pool, table, deleted_column))
    }

    /// Wrap an existing pool. The caller is responsible for it being
    /// read-only; this reader only ever issues the page query.
    pub fn from_pool(pool: AnyPool, table: &str, deleted_column: Option<&str>) -> Self {
        Self {
            pool,
            page_sql: page_query(table, deleted_column),
            has_deleted_column: deleted_column.is_some(),
        }
    }

    fn record_from_row(&self, row: &AnyRow) -> Result<SourceRecord, SourceError> {
        let item_code = column_text(row, "item_code")?;
        let name = column_text(row, "name")?;
        let quantity = column_real(row, "quantity")?;
        let unit_price = column_real(row, "unit_price").unwrap_or(0.0);
        let revision = row
            .try_get::<i64, _>("revision")
            .map_err(|e| SourceError::Schema(format!("revision: {}", e)))?;

        let mut record = SourceRecord::new(item_code, name, quantity)
            .with_unit_price(unit_price)
            .with_revision(revision);
        record.category = text(row, "category");
        record.location = text(row, "location");

        if self.has_deleted_column {
            record.deleted = row
                .try_get::<bool, _>("is_deleted")
                .ok()
                .or_else(|| row.try_get::<i64, _>("is_deleted").ok().map(|v| v != 0))
                .unwrap_or(false);
        }

        Ok(record)
    }
}

#[async_trait]
impl SourceReader for SqlSourceReader {
    #[tracing::instrument(skip(self), fields(cursor = ?cursor.map(ToString::to_string)))]
    async fn fetch_since(
        &self,
        cursor: Option<&SourceCursor>,
        limit: usize,
    ) -> Result<SourcePage, SourceError> {
        let limit = limit.max(1);
        let (position, after_code) = cursor
            .map(|c| (c.position, c.item_code.as_str()))
            .unwrap_or((i64::MIN, ""));

        let rows = sqlx::query(&self.page_sql)
            .bind(position)
            .bind(position)
            .bind(after_code)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        let records = rows
            .iter()
            .map(|row| self.record_from_row(row))
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = records.last().map(|last| {
            SourceCursor::new(last.revision.unwrap_or(position), last.item_code.clone())
        });
        debug!(rows = records.len(), "Fetched source page");

        Ok(SourcePage {
            exhausted: records.len() < limit,
            records,
            next_cursor,
        })
    }
}

fn page_query(table: &str, deleted_column: Option<&str>) -> String {
    let deleted = deleted_column
        .map(|column| format!(", {} AS is_deleted", column))
        .unwrap_or_default();
    format!(
        "SELECT item_code, name, quantity, unit_price, category, location, revision{} \
         FROM {} \
         WHERE revision > ? OR (revision = ? AND item_code > ?) \
         ORDER BY revision, item_code \
         LIMIT ?",
        deleted, table
    )
}

/// `[A-Za-z_][A-Za-z0-9_]*`, optionally schema-qualified with one dot.
fn is_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn read_only_url(connection_string: &str) -> String {
    if !connection_string.starts_with("sqlite:") || connection_string.contains("mode=") {
        return connection_string.to_string();
    }
    let separator = if connection_string.contains('?') { '&' } else { '?' };
    format!("{}{}mode=ro", connection_string, separator)
}

fn column_text(row: &AnyRow, column: &str) -> Result<String, SourceError> {
    text(row, column).ok_or_else(|| SourceError::Schema(format!("missing or non-text {}", column)))
}

fn column_real(row: &AnyRow, column: &str) -> Result<f64, SourceError> {
    row.try_get::<f64, _>(column)
        .ok()
        .or_else(|| row.try_get::<i64, _>(column).ok().map(|v| v as f64))
        .ok_or_else(|| SourceError::Schema(format!("missing or non-numeric {}", column)))
}

/// Map a driver error onto the retryable/fatal split.
fn classify(err: sqlx::Error) -> SourceError {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            // MySQL SQLSTATE for unknown table/column/syntax; SQLite reports "no such ..."
            let rejected = matches!(db.code().as_deref(), Some("42S02" | "42S22" | "42000"))
                || message.contains("no such table")
                || message.contains("no such column")
                || message.contains("syntax error");
            if rejected {
                SourceError::Schema(message)
            } else {
                SourceError::Unavailable(message)
            }
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => SourceError::Schema(err.to_string()),
        other => SourceError::Unavailable(other.to_string()),
    }
}
