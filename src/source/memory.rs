// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{SourceCursor, SourceError, SourcePage, SourceReader};
use crate::model::SourceRecord;

/// An append-only in-memory change feed.
///
/// Every [`push`](Self::push) appends a row at the next feed offset, so
/// re-reporting an item is a new row, exactly like an incremental source.
/// Cursor positions are 1-based feed offsets.
pub struct InMemorySource {
    feed: RwLock<Vec<SourceRecord>>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            feed: RwLock::new(Vec::new()),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = SourceRecord>) -> Self {
        Self {
            feed: RwLock::new(records.into_iter().collect()),
        }
    }

    pub fn push(&self, record: SourceRecord) {
        self.feed.write().push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = SourceRecord>) {
        self.feed.write().extend(records);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.feed.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feed.read().is_empty()
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceReader for InMemorySource {
    async fn fetch_since(
        &self,
        cursor: Option<&SourceCursor>,
        limit: usize,
    ) -> Result<SourcePage, SourceError> {
        let feed = self.feed.read();
        let start = cursor.map_or(0, |c| c.position.max(0) as usize).min(feed.len());
        let end = start.saturating_add(limit.max(1)).min(feed.len());

        let records: Vec<SourceRecord> = feed[start..end].to_vec();
        let next_cursor = records
            .last()
            .map(|last| SourceCursor::new(end as i64, last.item_code.clone()));

        Ok(SourcePage {
            records,
            next_cursor,
            exhausted: end >= feed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(n: usize) -> InMemorySource {
        InMemorySource::from_records(
            (0..n).map(|i| SourceRecord::new(format!("I{}", i), "item", i as f64)),
        )
    }

    #[tokio::test]
    async fn test_pages_through_feed() {
        let source = feed(5);

        let first = source.fetch_since(None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(!first.exhausted);
        assert_eq!(first.next_cursor, Some(SourceCursor::new(2, "I1")));

        let second = source.fetch_since(first.next_cursor.as_ref(), 2).await.unwrap();
        assert_eq!(second.records[0].item_code, "I2");

        let last = source.fetch_since(second.next_cursor.as_ref(), 2).await.unwrap();
        assert_eq!(last.records.len(), 1);
        assert!(last.exhausted);
    }

    #[tokio::test]
    async fn test_empty_page_at_end() {
        let source = feed(2);
        let page = source
            .fetch_since(Some(&SourceCursor::new(2, "I1")), 10)
            .await
            .unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_cursor.is_none());
        assert!(page.exhausted);
    }

    #[tokio::test]
    async fn test_pushed_rows_appear_after_cursor() {
        let source = feed(1);
        let page = source.fetch_since(None, 10).await.unwrap();
        source.push(SourceRecord::new("I0", "item", 9.0));

        let next = source.fetch_since(page.next_cursor.as_ref(), 10).await.unwrap();
        assert_eq!(next.records.len(), 1);
        assert_eq!(next.records[0].quantity, 9.0);
    }
}
