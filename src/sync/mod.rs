// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental import from the authoritative source.
//!
//! # Run lifecycle
//!
//! ```text
//! acquire sync:<installation> ──busy──► Skipped
//!        │
//!        ▼
//! checkpoint ← running (cursor unchanged)
//!        │
//!        ▼
//! ┌─► renew lease ─► fetch page ─► dedup ─► upsert / skip / delete ─┐
//! └───────────────────────── more pages ◄──────────────────────────┘
//!        │ exhausted
//!        ▼
//! checkpoint ← success + advanced cursor   (any error: failed, cursor unchanged)
//!        │
//!        ▼
//! release lease, one sync_completed / sync_failed event
//! ```
//!
//! Absence from the feed never deletes an item; only an explicit deletion
//! row does. Items nobody has touched for a while are reported by
//! [`SyncEngine::stale_items`].

pub mod dedup;
pub mod engine;
pub mod scheduler;

use tokio::sync::watch;

pub use dedup::{deduplicate, Deduplicated};
pub use engine::{SyncEngine, SyncError, SyncOutcome, SyncResult};
pub use scheduler::{SyncScheduler, SyncTrigger};

/// Resolve once shutdown is signalled. A dropped sender never signals.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
