// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::traits::{OperationalStore, StorageError};
use crate::model::{
    AuthoritativeItem, CountEntry, CountSession, SyncCheckpoint, VarianceRecord, VarianceStatus,
    WriteOutcome,
};

/// In-process operational store.
///
/// Each collection is its own `DashMap`, so writers to different keys never
/// contend on a store-wide lock.
pub struct InMemoryStore {
    items: DashMap<String, AuthoritativeItem>,
    sessions: DashMap<String, CountSession>,
    counts: DashMap<(String, String), CountEntry>,
    variances: DashMap<(String, String), VarianceRecord>,
    checkpoints: DashMap<String, SyncCheckpoint>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            sessions: DashMap::new(),
            counts: DashMap::new(),
            variances: DashMap::new(),
            checkpoints: DashMap::new(),
        }
    }

    /// Number of item records
    #[must_use]
    pub fn item_len(&self) -> usize {
        self.items.len()
    }

    /// Number of variance records
    #[must_use]
    pub fn variance_len(&self) -> usize {
        self.variances.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationalStore for InMemoryStore {
    async fn get_item(&self, item_code: &str) -> Result<Option<AuthoritativeItem>, StorageError> {
        Ok(self.items.get(item_code).map(|r| r.value().clone()))
    }

    async fn upsert_item(&self, item: &AuthoritativeItem) -> Result<(), StorageError> {
        self.items.insert(item.item_code.clone(), item.clone());
        Ok(())
    }

    async fn delete_item(&self, item_code: &str) -> Result<bool, StorageError> {
        Ok(self.items.remove(item_code).is_some())
    }

    async fn items_synced_before(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<AuthoritativeItem>, StorageError> {
        let mut stale: Vec<AuthoritativeItem> = self
            .items
            .iter()
            .filter(|r| r.value().last_synced_at < cutoff)
            .map(|r| r.value().clone())
            .collect();
        stale.sort_by(|a, b| {
            a.last_synced_at
                .cmp(&b.last_synced_at)
                .then_with(|| a.item_code.cmp(&b.item_code))
        });
        stale.truncate(limit);
        Ok(stale)
    }

    async fn count_items(&self) -> Result<u64, StorageError> {
        Ok(self.items.len() as u64)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<CountSession>, StorageError> {
        Ok(self.sessions.get(session_id).map(|r| r.value().clone()))
    }

    async fn put_session(&self, session: &CountSession) -> Result<(), StorageError> {
        self.sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_count(
        &self,
        session_id: &str,
        item_code: &str,
    ) -> Result<Option<CountEntry>, StorageError> {
        let key = (session_id.to_string(), item_code.to_string());
        Ok(self.counts.get(&key).map(|r| r.value().clone()))
    }

    async fn put_count(&self, entry: &CountEntry) -> Result<(), StorageError> {
        let key = (entry.session_id.clone(), entry.item_code.clone());
        self.counts.insert(key, entry.clone());
        Ok(())
    }

    async fn counts_for_session(&self, session_id: &str) -> Result<Vec<CountEntry>, StorageError> {
        let mut entries: Vec<CountEntry> = self
            .counts
            .iter()
            .filter(|r| r.key().0 == session_id)
            .map(|r| r.value().clone())
            .collect();
        entries.sort_by(|a, b| a.item_code.cmp(&b.item_code));
        Ok(entries)
    }

    async fn get_variance(
        &self,
        item_code: &str,
        session_id: &str,
    ) -> Result<Option<VarianceRecord>, StorageError> {
        let key = (item_code.to_string(), session_id.to_string());
        Ok(self.variances.get(&key).map(|r| r.value().clone()))
    }

    async fn insert_variance(&self, record: &VarianceRecord) -> Result<WriteOutcome, StorageError> {
        let key = (record.item_code.clone(), record.session_id.clone());
        match self.variances.entry(key) {
            Entry::Occupied(_) => Ok(WriteOutcome::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(WriteOutcome::Applied)
            }
        }
    }

    async fn update_variance(
        &self,
        record: &VarianceRecord,
        expected_revision: u64,
    ) -> Result<WriteOutcome, StorageError> {
        let key = (record.item_code.clone(), record.session_id.clone());
        match self.variances.get_mut(&key) {
            Some(mut stored) if stored.revision == expected_revision => {
                *stored = record.clone();
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn list_variances(
        &self,
        status: Option<VarianceStatus>,
    ) -> Result<Vec<VarianceRecord>, StorageError> {
        let mut records: Vec<VarianceRecord> = self
            .variances
            .iter()
            .filter(|r| status.map_or(true, |s| r.value().status == s))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.item_code.cmp(&b.item_code))
        });
        Ok(records)
    }

    async fn load_checkpoint(
        &self,
        installation_id: &str,
    ) -> Result<Option<SyncCheckpoint>, StorageError> {
        Ok(self.checkpoints.get(installation_id).map(|r| r.value().clone()))
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &SyncCheckpoint,
    ) -> Result<WriteOutcome, StorageError> {
        match self.checkpoints.entry(checkpoint.installation_id.clone()) {
            Entry::Occupied(mut stored) => {
                if stored.get().fencing_token > checkpoint.fencing_token {
                    return Ok(WriteOutcome::Conflict);
                }
                stored.insert(checkpoint.clone());
                Ok(WriteOutcome::Applied)
            }
            Entry::Vacant(slot) => {
                slot.insert(checkpoint.clone());
                Ok(WriteOutcome::Applied)
            }
        }
    }
}
