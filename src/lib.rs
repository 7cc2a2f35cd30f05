// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Inventory Sync
//!
//! Keeps an operational inventory store in step with a read-only
//! authoritative source while users record physical stock counts against
//! the same items.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────┐        ┌─────────────────────────────┐
//! │   Authoritative SQL   │        │       Counting users        │
//! │   (read-only source)  │        │  submit_count / review      │
//! └───────────┬───────────┘        └──────────────┬──────────────┘
//!             │ keyset SELECT                     │
//!             ▼                                   ▼
//! ┌───────────────────────┐        ┌─────────────────────────────┐
//! │      SyncEngine       │        │      VarianceDetector       │
//! │ lease sync:<install>  │        │ lease variance:<item>:<ses> │
//! │ dedup → upsert/skip   │        │ severity + state machine    │
//! └───────────┬───────────┘        └──────────────┬──────────────┘
//!             │                                   │
//!             ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ OperationalStore: items, count_entries, variances, checkpoint   │
//! │ LockManager: leases with fencing tokens (memory / SQL / Redis)  │
//! └─────────────────────────────────────────────────────────────────┘
//!             │                                   │
//!             └──────────────► Notifier ◄─────────┘
//!                       (role-scoped, best-effort)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use inventory_sync::{
//!     AppContext, InMemorySource, InventorySyncConfig, Severity, SourceRecord, SyncEngine,
//!     SyncOutcome, VarianceDetector,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = AppContext::in_memory(InventorySyncConfig::default());
//!
//! let source = Arc::new(InMemorySource::from_records([
//!     SourceRecord::new("X100", "Hex bolt M8", 50.0).with_checksum("c1"),
//! ]));
//! let engine = SyncEngine::new(&ctx, source);
//! assert!(matches!(engine.run_sync().await?, SyncOutcome::Completed(_)));
//!
//! let detector = VarianceDetector::new(&ctx);
//! detector.open_session("S1").await?;
//! let counted = detector.submit_count("S1", "X100", 45.0, "alice").await?;
//!
//! let variance = counted.variance.expect("short count opens a variance");
//! assert_eq!(variance.delta, -5.0);
//! assert_eq!(variance.severity, Severity::Minor);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`sync`]: [`SyncEngine`] and [`SyncScheduler`]
//! - [`variance`]: [`VarianceDetector`], severity and review state machine
//! - [`lock`]: leases with fencing tokens
//! - [`source`]: read-only authoritative source readers
//! - [`storage`]: operational store backends (memory, SQL)
//! - [`notify`]: role-scoped event fan-out
//! - [`resilience`]: retry with backoff
//!
//! ## Configuration
//!
//! See [`InventorySyncConfig`] for all configuration options.

pub mod config;
pub mod context;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod resilience;
pub mod source;
pub mod storage;
pub mod sync;
pub mod variance;

pub use config::{ConfigError, InventorySyncConfig, LockBackend, LogFormat, VarianceThresholds};
pub use context::{AppContext, ContextError};
pub use lock::{Acquisition, InMemoryLockManager, Lease, LockManager, Renewal};
pub use model::{
    AuthoritativeItem, CountEntry, CountSession, CountStatus, RunStatus, SessionStatus, Severity,
    SourceRecord, SyncCheckpoint, VarianceRecord, VarianceStatus, WriteOutcome,
};
pub use notify::{EventKind, EventSink, NotificationEvent, Notifier};
pub use resilience::retry::RetryConfig;
pub use source::{InMemorySource, SourceCursor, SourceError, SourceReader};
pub use storage::{InMemoryStore, OperationalStore, StorageError};
pub use sync::{SyncEngine, SyncError, SyncOutcome, SyncResult, SyncScheduler};
pub use variance::{CountSubmission, DetectorError, VarianceDetector};
