// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::dedup::deduplicate;
use super::wait_for_shutdown;
use crate::context::AppContext;
use crate::lock::{Acquisition, Lease, LockManager, Renewal};
use crate::metrics;
use crate::model::{now_millis, AuthoritativeItem, RunStatus, SourceRecord, SyncCheckpoint, WriteOutcome};
use crate::notify::{EventKind, NotificationEvent, Notifier};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::source::{SourceCursor, SourceError, SourcePage, SourceReader};
use crate::storage::{OperationalStore, StorageError};

/// Roles that receive sync events.
const SYNC_ROLES: &[&str] = &["admin", "supervisor"];

/// Upper bound on items returned by one staleness check.
const STALE_REPORT_LIMIT: usize = 1000;

/// Item codes listed in an `items_stale` payload.
const STALE_PAYLOAD_CODES: usize = 100;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The sync lease expired or was taken over mid-run
    #[error("lost sync lease '{resource_key}'")]
    LeaseLost { resource_key: String },
    #[error("sync run cancelled")]
    Cancelled,
    /// A newer run already wrote the checkpoint
    #[error("checkpoint fenced: token {fencing_token} is stale")]
    Fenced { fencing_token: u64 },
    #[error("stored checkpoint cursor is unreadable: {0}")]
    InvalidCursor(String),
}

impl SyncError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Source(SourceError::Unavailable(_)) => "source_unavailable",
            Self::Source(SourceError::Schema(_)) => "source_schema",
            Self::Storage(_) => "storage",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Cancelled => "cancelled",
            Self::Fenced { .. } => "fenced",
            Self::InvalidCursor(_) => "invalid_cursor",
        }
    }
}

/// Counters for one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub items_upserted: u64,
    /// Checksum unchanged, no write
    pub items_skipped: u64,
    pub duplicates_resolved: u64,
    /// Removed because the source sent an explicit deletion
    pub items_deleted: u64,
    pub batches: u64,
    /// Rows rejected by validation; they were not written
    pub errors: Vec<String>,
}

impl SyncResult {
    fn processed(&self) -> u64 {
        self.items_upserted + self.items_skipped + self.items_deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncResult),
    /// Another process holds the sync lease
    Skipped { holder_id: Option<String> },
}

pub struct SyncEngine {
    store: Arc<dyn OperationalStore>,
    locks: Arc<dyn LockManager>,
    notifier: Notifier,
    source: Arc<dyn SourceReader>,
    holder_id: String,
    installation_id: String,
    batch_size: usize,
    lease_ttl: Duration,
    source_timeout: Duration,
    source_retry: RetryConfig,
    staleness_window: Duration,
}

impl SyncEngine {
    pub fn new(ctx: &AppContext, source: Arc<dyn SourceReader>) -> Self {
        let config = &ctx.config;
        Self {
            store: ctx.store.clone(),
            locks: ctx.locks.clone(),
            notifier: ctx.notifier.clone(),
            source,
            holder_id: ctx.holder_id.clone(),
            installation_id: config.installation_id.clone(),
            batch_size: config.batch_size.max(1),
            lease_ttl: config.sync_lease_ttl(),
            source_timeout: config.source_timeout(),
            source_retry: config.source_retry(),
            staleness_window: config.staleness_window(),
        }
    }

    /// Override the backoff used for retryable source failures.
    #[must_use]
    pub fn with_source_retry(mut self, retry: RetryConfig) -> Self {
        self.source_retry = retry;
        self
    }

    pub fn lease_key(&self) -> String {
        format!("sync:{}", self.installation_id)
    }

    /// Run one import to the end of the source feed.
    pub async fn run_sync(&self) -> Result<SyncOutcome, SyncError> {
        let (_never, shutdown) = watch::channel(false);
        self.run_sync_with_shutdown(shutdown).await
    }

    /// Like [`run_sync`](Self::run_sync), aborting as failed once `shutdown`
    /// turns true. The checkpoint is never advanced by an aborted run.
    #[tracing::instrument(skip(self, shutdown), fields(installation_id = %self.installation_id))]
    pub async fn run_sync_with_shutdown(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SyncOutcome, SyncError> {
        let resource_key = self.lease_key();

        let mut lease = match self
            .locks
            .acquire(&resource_key, &self.holder_id, self.lease_ttl)
            .await?
        {
            Acquisition::Granted(lease) => lease,
            Acquisition::Busy { holder_id, .. } => {
                metrics::record_lease("sync", "busy");
                metrics::record_sync_run("skipped");
                info!(holder = ?holder_id, "Sync already running elsewhere, skipping");
                return Ok(SyncOutcome::Skipped { holder_id });
            }
        };
        metrics::record_lease("sync", "granted");
        info!(fencing_token = lease.fencing_token, "Sync run started");

        let _timer = metrics::SyncTimer::start();
        let outcome = self.execute(&mut lease, &mut shutdown).await;

        if let Err(e) = &outcome {
            if !matches!(e, SyncError::Fenced { .. }) {
                self.mark_failed(&lease).await;
            }
        }
        self.release(&lease).await;

        match outcome {
            Ok(result) => {
                metrics::record_sync_run("success");
                info!(
                    upserted = result.items_upserted,
                    skipped = result.items_skipped,
                    duplicates = result.duplicates_resolved,
                    deleted = result.items_deleted,
                    invalid = result.errors.len(),
                    batches = result.batches,
                    "Sync run completed"
                );
                self.notifier.publish(
                    NotificationEvent::new(EventKind::SyncCompleted, self.summary(&result))
                        .for_roles(SYNC_ROLES),
                );
                Ok(SyncOutcome::Completed(result))
            }
            Err(e) => {
                metrics::record_sync_run("failed");
                error!(error = %e, kind = e.kind(), "Sync run failed");
                self.notifier.publish(
                    NotificationEvent::new(
                        EventKind::SyncFailed,
                        json!({
                            "installation_id": self.installation_id,
                            "error": e.to_string(),
                            "kind": e.kind(),
                        }),
                    )
                    .for_roles(SYNC_ROLES),
                );
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        lease: &mut Lease,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SyncResult, SyncError> {
        let mut checkpoint = self
            .store
            .load_checkpoint(&self.installation_id)
            .await?
            .unwrap_or_else(|| SyncCheckpoint::initial(&self.installation_id));

        let mut cursor = checkpoint
            .last_cursor
            .as_deref()
            .map(str::parse::<SourceCursor>)
            .transpose()
            .map_err(SyncError::InvalidCursor)?;

        checkpoint.run_status = RunStatus::Running;
        checkpoint.fencing_token = lease.fencing_token;
        self.save_checkpoint(&checkpoint).await?;

        let mut result = SyncResult::default();

        loop {
            if *shutdown.borrow() {
                return Err(SyncError::Cancelled);
            }
            self.renew(lease).await?;

            let page = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Err(SyncError::Cancelled),
                page = self.fetch(cursor.as_ref()) => page?,
            };

            let exhausted = page.exhausted || page.records.is_empty();
            if !page.records.is_empty() {
                result.batches += 1;
                metrics::record_batch_size(page.records.len());
                self.apply_batch(page.records, lease, &mut result).await?;
            }
            if let Some(next) = page.next_cursor {
                cursor = Some(next);
            }
            if exhausted {
                break;
            }
        }

        if !lease.is_live(now_millis()) {
            return Err(SyncError::LeaseLost {
                resource_key: lease.resource_key.clone(),
            });
        }

        checkpoint.last_cursor = cursor.map(|c| c.to_string());
        checkpoint.last_run_at = Some(now_millis());
        checkpoint.items_processed = result.processed();
        checkpoint.run_status = RunStatus::Success;
        self.save_checkpoint(&checkpoint).await?;

        Ok(result)
    }

    /// One page from the source, bounded by the source timeout and retried
    /// while the failure is transient.
    async fn fetch(&self, cursor: Option<&SourceCursor>) -> Result<SourcePage, SourceError> {
        retry_if(
            "source_fetch",
            &self.source_retry,
            || async {
                let fetched = tokio::time::timeout(
                    self.source_timeout,
                    self.source.fetch_since(cursor, self.batch_size),
                )
                .await
                .map_err(|_| {
                    SourceError::Unavailable(format!("fetch timed out after {:?}", self.source_timeout))
                })?;
                if let Err(e) = &fetched {
                    metrics::record_source_error(if e.is_retryable() { "unavailable" } else { "schema" });
                }
                fetched
            },
            SourceError::is_retryable,
        )
        .await
    }

    async fn apply_batch(
        &self,
        records: Vec<SourceRecord>,
        lease: &Lease,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let deduplicated = deduplicate(records);
        result.duplicates_resolved += deduplicated.duplicates;

        // A paused holder must not write after its lease ran out
        if !lease.is_live(now_millis()) {
            return Err(SyncError::LeaseLost {
                resource_key: lease.resource_key.clone(),
            });
        }

        let (mut upserted, mut skipped, mut deleted) = (0, 0, 0);
        let synced_at = now_millis();

        for record in deduplicated.records {
            if let Err(reason) = record.validate() {
                warn!(item_code = %record.item_code, reason = %reason, "Invalid source record");
                metrics::record_invalid_record();
                result.errors.push(reason);
                continue;
            }

            if record.deleted {
                if self.store.delete_item(&record.item_code).await? {
                    debug!(item_code = %record.item_code, "Item deleted by source");
                    deleted += 1;
                }
                continue;
            }

            let checksum = record.checksum();
            let current: Option<AuthoritativeItem> = self.store.get_item(&record.item_code).await?;
            if current.is_some_and(|item| item.source_checksum == checksum) {
                skipped += 1;
                continue;
            }

            self.store.upsert_item(&record.to_item(synced_at)).await?;
            debug!(item_code = %record.item_code, quantity = record.quantity, "Item upserted");
            upserted += 1;
        }

        result.items_upserted += upserted;
        result.items_skipped += skipped;
        result.items_deleted += deleted;
        metrics::record_items(upserted, skipped, deleted, deduplicated.duplicates);
        Ok(())
    }

    async fn renew(&self, lease: &mut Lease) -> Result<(), SyncError> {
        match self.locks.renew(lease).await? {
            Renewal::Renewed(renewed) => {
                metrics::record_lease("sync", "renewed");
                *lease = renewed;
                Ok(())
            }
            Renewal::Expired => {
                metrics::record_lease("sync", "expired");
                warn!(resource_key = %lease.resource_key, fencing_token = lease.fencing_token, "Sync lease lost");
                Err(SyncError::LeaseLost {
                    resource_key: lease.resource_key.clone(),
                })
            }
        }
    }

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), SyncError> {
        match self.store.save_checkpoint(checkpoint).await? {
            WriteOutcome::Applied => Ok(()),
            WriteOutcome::Conflict => Err(SyncError::Fenced {
                fencing_token: checkpoint.fencing_token,
            }),
        }
    }

    /// Record the failure without touching the cursor.
    async fn mark_failed(&self, lease: &Lease) {
        let checkpoint = match self.store.load_checkpoint(&self.installation_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => SyncCheckpoint::initial(&self.installation_id),
            Err(e) => {
                warn!(error = %e, "Could not load checkpoint to mark run failed");
                return;
            }
        };

        let failed = SyncCheckpoint {
            run_status: RunStatus::Failed,
            last_run_at: Some(now_millis()),
            fencing_token: lease.fencing_token,
            ..checkpoint
        };
        match self.store.save_checkpoint(&failed).await {
            Ok(WriteOutcome::Applied) => {}
            Ok(WriteOutcome::Conflict) => debug!("Checkpoint already owned by a newer run"),
            Err(e) => warn!(error = %e, "Could not mark checkpoint failed"),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.locks.release(lease).await {
            warn!(resource_key = %lease.resource_key, error = %e, "Failed to release sync lease");
        }
    }

    fn summary(&self, result: &SyncResult) -> serde_json::Value {
        json!({
            "installation_id": self.installation_id,
            "items_upserted": result.items_upserted,
            "items_skipped": result.items_skipped,
            "duplicates_resolved": result.duplicates_resolved,
            "items_deleted": result.items_deleted,
            "batches": result.batches,
            "errors": result.errors.len(),
        })
    }

    /// Items not synced within the staleness window.
    ///
    /// `last_synced_at` moves only when a row is written, and a row whose
    /// checksum is unchanged is skipped without a write. The age is therefore
    /// the time since the source last changed the item, which covers both
    /// items the source stopped sending and items it keeps sending unchanged.
    /// The payload says so in `measured_from` and carries each item's
    /// `last_synced_at` so consumers can tell old items from long-quiet ones.
    ///
    /// Publishes a single `items_stale` event when any are found. Stale
    /// items are reported, never deleted.
    #[tracing::instrument(skip(self))]
    pub async fn stale_items(&self) -> Result<Vec<AuthoritativeItem>, SyncError> {
        let cutoff = now_millis() - self.staleness_window.as_millis() as i64;
        let stale = self
            .store
            .items_synced_before(cutoff, STALE_REPORT_LIMIT)
            .await?;

        metrics::set_stale_items(stale.len());
        if !stale.is_empty() {
            warn!(count = stale.len(), cutoff, "Stale items found");
            let items: Vec<_> = stale
                .iter()
                .take(STALE_PAYLOAD_CODES)
                .map(|item| json!({"item_code": item.item_code, "last_synced_at": item.last_synced_at}))
                .collect();
            self.notifier.publish(
                NotificationEvent::new(
                    EventKind::ItemsStale,
                    json!({
                        "installation_id": self.installation_id,
                        "count": stale.len(),
                        "cutoff": cutoff,
                        "measured_from": "last_change",
                        "items": items,
                    }),
                )
                .for_roles(SYNC_ROLES),
            );
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InventorySyncConfig;
    use crate::notify::ChannelSink;
    use crate::source::InMemorySource;

    fn config() -> InventorySyncConfig {
        InventorySyncConfig {
            installation_id: "site-1".into(),
            instance_id: Some("engine-test".into()),
            batch_size: 2,
            ..Default::default()
        }
    }

    fn engine(ctx: &AppContext, source: Arc<InMemorySource>) -> SyncEngine {
        SyncEngine::new(ctx, source)
            .with_source_retry(RetryConfig::source().with_max_retries(2).with_initial_delay(Duration::from_millis(1)))
    }

    fn completed(outcome: SyncOutcome) -> SyncResult {
        match outcome {
            SyncOutcome::Completed(result) => result,
            SyncOutcome::Skipped { .. } => panic!("expected a completed run"),
        }
    }

    #[tokio::test]
    async fn test_imports_all_pages() {
        let ctx = AppContext::in_memory(config());
        let source = Arc::new(InMemorySource::from_records(
            (0..5).map(|i| SourceRecord::new(format!("I{}", i), "item", i as f64)),
        ));

        let result = completed(engine(&ctx, source).run_sync().await.unwrap());

        assert_eq!(result.items_upserted, 5);
        assert_eq!(result.batches, 3);
        assert_eq!(ctx.store.count_items().await.unwrap(), 5);

        let checkpoint = ctx.store.load_checkpoint("site-1").await.unwrap().unwrap();
        assert_eq!(checkpoint.run_status, RunStatus::Success);
        assert_eq!(checkpoint.last_cursor.as_deref(), Some("5:I4"));
        assert_eq!(checkpoint.items_processed, 5);
    }

    #[tokio::test]
    async fn test_busy_lease_skips() {
        let ctx = AppContext::in_memory(config());
        let source = Arc::new(InMemorySource::new());
        let engine = engine(&ctx, source);

        let _held = ctx
            .locks
            .acquire(&engine.lease_key(), "other-node", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = engine.run_sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Skipped {
                holder_id: Some("other-node".into())
            }
        );
        assert!(ctx.store.load_checkpoint("site-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_deletion_removes_item() {
        let ctx = AppContext::in_memory(config());
        let source = Arc::new(InMemorySource::from_records([
            SourceRecord::new("A", "a", 1.0),
            SourceRecord::new("B", "b", 2.0),
        ]));
        let engine = engine(&ctx, source.clone());
        engine.run_sync().await.unwrap();

        source.push(SourceRecord::new("A", "a", 1.0).deleted());
        let result = completed(engine.run_sync().await.unwrap());

        assert_eq!(result.items_deleted, 1);
        assert!(ctx.store.get_item("A").await.unwrap().is_none());
        assert!(ctx.store.get_item("B").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_records_are_reported_not_written() {
        let ctx = AppContext::in_memory(config());
        let source = Arc::new(InMemorySource::from_records([
            SourceRecord::new("", "blank", 1.0),
            SourceRecord::new("NEG", "negative", -3.0),
            SourceRecord::new("OK", "fine", 3.0),
        ]));

        let result = completed(engine(&ctx, source).run_sync().await.unwrap());

        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.items_upserted, 1);
        assert_eq!(ctx.store.count_items().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_checkpoint() {
        let ctx = AppContext::in_memory(config());
        let source = Arc::new(InMemorySource::from_records([SourceRecord::new("A", "a", 1.0)]));
        let engine = engine(&ctx, source);

        let (tx, rx) = watch::channel(true);
        let err = engine.run_sync_with_shutdown(rx).await.unwrap_err();
        drop(tx);

        assert!(matches!(err, SyncError::Cancelled));
        let checkpoint = ctx.store.load_checkpoint("site-1").await.unwrap().unwrap();
        assert_eq!(checkpoint.run_status, RunStatus::Failed);
        assert_eq!(checkpoint.last_cursor, None);
        assert_eq!(ctx.store.count_items().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publishes_one_event_per_run() {
        let ctx = AppContext::in_memory(config());
        let (sink, mut rx) = ChannelSink::new(16);
        ctx.notifier.subscribe("admins", &["admin"], sink);
        let source = Arc::new(InMemorySource::from_records(
            (0..7).map(|i| SourceRecord::new(format!("I{}", i), "item", 1.0)),
        ));

        engine(&ctx, source).run_sync().await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::SyncCompleted);
        assert_eq!(event.payload["items_upserted"], 7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_corrupt_cursor_fails_run() {
        let ctx = AppContext::in_memory(config());
        let mut checkpoint = SyncCheckpoint::initial("site-1");
        checkpoint.last_cursor = Some("garbage".into());
        ctx.store.save_checkpoint(&checkpoint).await.unwrap();

        let err = engine(&ctx, Arc::new(InMemorySource::new())).run_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn test_stale_items_reports_old_rows() {
        let ctx = AppContext::in_memory(InventorySyncConfig {
            sync_interval_ms: 1_000,
            staleness_cycles: 2,
            ..config()
        });
        let old = SourceRecord::new("OLD", "old", 1.0).to_item(now_millis() - 10_000);
        let fresh = SourceRecord::new("NEW", "new", 1.0).to_item(now_millis());
        ctx.store.upsert_item(&old).await.unwrap();
        ctx.store.upsert_item(&fresh).await.unwrap();

        let (sink, mut rx) = ChannelSink::new(4);
        ctx.notifier.subscribe_all("audit", sink);

        let stale = engine(&ctx, Arc::new(InMemorySource::new())).stale_items().await.unwrap();

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].item_code, "OLD");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ItemsStale);
        assert_eq!(event.payload["count"], 1);
        assert_eq!(event.payload["measured_from"], "last_change");
        assert_eq!(event.payload["items"][0]["item_code"], "OLD");
        assert_eq!(event.payload["items"][0]["last_synced_at"], old.last_synced_at);
    }

    #[tokio::test]
    async fn test_unchanged_rereport_keeps_its_age() {
        let ctx = AppContext::in_memory(InventorySyncConfig {
            sync_interval_ms: 1_000,
            staleness_cycles: 2,
            ..config()
        });
        let record = SourceRecord::new("QUIET", "quiet", 3.0);
        let old = record.to_item(now_millis() - 10_000);
        ctx.store.upsert_item(&old).await.unwrap();

        // Re-sent with the same content: skipped, nothing written
        let engine = engine(&ctx, Arc::new(InMemorySource::from_records([record])));
        let result = completed(engine.run_sync().await.unwrap());
        assert_eq!(result.items_skipped, 1);

        let stale = engine.stale_items().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].last_synced_at, old.last_synced_at);
    }
}
