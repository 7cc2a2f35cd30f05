// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    AuthoritativeItem, CountEntry, CountSession, SyncCheckpoint, VarianceRecord, VarianceStatus,
    WriteOutcome,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid record in '{collection}': {reason}")]
    InvalidRecord {
        collection: &'static str,
        reason: String,
    },
}

/// The read/write operational store.
///
/// Connection lifecycle belongs to whoever constructs the store; components
/// only receive an `Arc<dyn OperationalStore>`.
#[async_trait]
pub trait OperationalStore: Send + Sync {
    // ----- items (written only by the sync engine) -----

    async fn get_item(&self, item_code: &str) -> Result<Option<AuthoritativeItem>, StorageError>;

    /// Insert or overwrite the record keyed by `item_code`.
    async fn upsert_item(&self, item: &AuthoritativeItem) -> Result<(), StorageError>;

    /// Returns whether a record was removed.
    async fn delete_item(&self, item_code: &str) -> Result<bool, StorageError>;

    /// Items whose `last_synced_at` is strictly older than `cutoff`, oldest first.
    async fn items_synced_before(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<AuthoritativeItem>, StorageError>;

    async fn count_items(&self) -> Result<u64, StorageError>;

    // ----- counting sessions -----

    async fn get_session(&self, session_id: &str) -> Result<Option<CountSession>, StorageError>;

    async fn put_session(&self, session: &CountSession) -> Result<(), StorageError>;

    // ----- count entries, keyed by (session_id, item_code) -----

    async fn get_count(
        &self,
        session_id: &str,
        item_code: &str,
    ) -> Result<Option<CountEntry>, StorageError>;

    async fn put_count(&self, entry: &CountEntry) -> Result<(), StorageError>;

    async fn counts_for_session(&self, session_id: &str) -> Result<Vec<CountEntry>, StorageError>;

    // ----- variances, keyed by (item_code, session_id) -----

    async fn get_variance(
        &self,
        item_code: &str,
        session_id: &str,
    ) -> Result<Option<VarianceRecord>, StorageError>;

    /// Insert a new record; `Conflict` if one already exists for the key.
    async fn insert_variance(&self, record: &VarianceRecord) -> Result<WriteOutcome, StorageError>;

    /// Replace the stored record only if its revision is still `expected_revision`.
    async fn update_variance(
        &self,
        record: &VarianceRecord,
        expected_revision: u64,
    ) -> Result<WriteOutcome, StorageError>;

    async fn list_variances(
        &self,
        status: Option<VarianceStatus>,
    ) -> Result<Vec<VarianceRecord>, StorageError>;

    // ----- checkpoint (singleton per installation) -----

    async fn load_checkpoint(
        &self,
        installation_id: &str,
    ) -> Result<Option<SyncCheckpoint>, StorageError>;

    /// Write the checkpoint unless the stored one carries a higher fencing token.
    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint)
        -> Result<WriteOutcome, StorageError>;
}
