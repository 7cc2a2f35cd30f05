// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::engine::{SyncEngine, SyncOutcome};
use super::wait_for_shutdown;

/// Requests an immediate run from a [`SyncScheduler`].
#[derive(Clone)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    /// Triggers while a run is in progress coalesce into one follow-up run.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Runs [`SyncEngine::run_sync_with_shutdown`] on an interval and on demand.
///
/// A failed run is logged and the loop carries on; the next tick retries
/// from the unchanged checkpoint. After every completed run the staleness
/// check runs too.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    notify: Arc<Notify>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger {
            notify: self.notify.clone(),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(self.run(shutdown))
    }

    /// Loop until shutdown. Returns the number of runs attempted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut runs = 0;

        info!(interval = ?self.interval, "Sync scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {
                    info!("Sync triggered on demand");
                }
            }

            runs += 1;
            match self.engine.run_sync_with_shutdown(shutdown.clone()).await {
                Ok(SyncOutcome::Completed(_)) => {
                    if let Err(e) = self.engine.stale_items().await {
                        error!(error = %e, "Staleness check failed");
                    }
                }
                Ok(SyncOutcome::Skipped { .. }) => {}
                // Already logged and published by the engine
                Err(_) => {}
            }
        }

        info!(runs, "Sync scheduler stopped");
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InventorySyncConfig;
    use crate::context::AppContext;
    use crate::model::SourceRecord;
    use crate::source::InMemorySource;

    fn setup() -> (AppContext, Arc<InMemorySource>, Arc<SyncEngine>) {
        let ctx = AppContext::in_memory(InventorySyncConfig {
            instance_id: Some("scheduler-test".into()),
            ..Default::default()
        });
        let source = Arc::new(InMemorySource::from_records([SourceRecord::new("A", "a", 1.0)]));
        let engine = Arc::new(SyncEngine::new(&ctx, source.clone()));
        (ctx, source, engine)
    }

    #[tokio::test]
    async fn test_first_tick_runs_immediately_and_shutdown_stops() {
        let (ctx, _source, engine) = setup();
        let (tx, rx) = watch::channel(false);

        let handle = SyncScheduler::new(engine, Duration::from_secs(3600)).spawn(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.store.count_items().await.unwrap(), 1);

        tx.send(true).unwrap();
        let runs = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops on shutdown")
            .unwrap();
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_trigger_runs_again() {
        let (ctx, source, engine) = setup();
        let (tx, rx) = watch::channel(false);

        let scheduler = SyncScheduler::new(engine, Duration::from_secs(3600));
        let trigger = scheduler.trigger();
        let handle = scheduler.spawn(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        source.push(SourceRecord::new("B", "b", 2.0));
        trigger.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.store.count_items().await.unwrap(), 2);

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 2);
    }
}
