// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only access to the authoritative inventory source.
//!
//! A [`SourceReader`] pages through the source in a stable order and hands
//! back a [`SourceCursor`] for the position after each page. Readers never
//! mutate the source.

pub mod memory;
pub mod sql;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::SourceRecord;

pub use memory::InMemorySource;
pub use sql::SqlSourceReader;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Connection, pool or timeout failure. Retryable.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The source returned an unexpected shape. Fatal for the run.
    #[error("source schema error: {0}")]
    Schema(String),
}

impl SourceError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Keyset position in the source ordering.
///
/// `position` is the source's ordering key (the revision column for SQL
/// sources, the feed offset for [`InMemorySource`]); `item_code` breaks ties.
/// Stored in the checkpoint as `"<position>:<item_code>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceCursor {
    pub position: i64,
    pub item_code: String,
}

impl SourceCursor {
    pub fn new(position: i64, item_code: impl Into<String>) -> Self {
        Self {
            position,
            item_code: item_code.into(),
        }
    }
}

impl fmt::Display for SourceCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.item_code)
    }
}

impl FromStr for SourceCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (position, item_code) = s
            .split_once(':')
            .ok_or_else(|| format!("cursor '{}' has no ':' separator", s))?;
        let position = position
            .parse::<i64>()
            .map_err(|e| format!("cursor '{}' has a bad position: {}", s, e))?;
        Ok(Self::new(position, item_code))
    }
}

/// One page of source rows.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<SourceRecord>,
    /// Position after the last row of this page; `None` for an empty page
    pub next_cursor: Option<SourceCursor>,
    /// No rows remain after this page
    pub exhausted: bool,
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Up to `limit` rows strictly after `cursor` (from the start when `None`).
    async fn fetch_since(
        &self,
        cursor: Option<&SourceCursor>,
        limit: usize,
    ) -> Result<SourcePage, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_string_round_trip() {
        let cursor = SourceCursor::new(42, "X100");
        assert_eq!(cursor.to_string(), "42:X100");
        assert_eq!("42:X100".parse::<SourceCursor>(), Ok(cursor));
    }

    #[test]
    fn test_cursor_keeps_colons_in_item_code() {
        let cursor: SourceCursor = "7:BIN:A:3".parse().unwrap();
        assert_eq!(cursor.position, 7);
        assert_eq!(cursor.item_code, "BIN:A:3");
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!("no-separator".parse::<SourceCursor>().is_err());
        assert!("abc:X1".parse::<SourceCursor>().is_err());
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(SourceError::Unavailable("timeout".into()).is_retryable());
        assert!(!SourceError::Schema("missing column".into()).is_retryable());
    }
}
