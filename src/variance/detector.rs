// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::severity::{classify, QUANTITY_EPSILON};
use crate::config::VarianceThresholds;
use crate::context::AppContext;
use crate::lock::{Acquisition, Lease, LockManager};
use crate::metrics;
use crate::model::{
    now_millis, CountEntry, CountSession, CountStatus, SessionStatus, Severity, VarianceRecord,
    VarianceStatus, WriteOutcome,
};
use crate::notify::{EventKind, NotificationEvent, Notifier};
use crate::storage::{OperationalStore, StorageError};

/// Roles that receive variance events.
const VARIANCE_ROLES: &[&str] = &["supervisor", "admin"];

/// Base pause between variance lease attempts; grows linearly.
const LEASE_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF_STEPS: u32 = 8;

/// How long to keep trying for a busy variance lease.
#[derive(Debug, Clone, Copy)]
enum LeaseWait {
    /// Reviewers get a few quick tries, then re-read and decide again
    Attempts(usize),
    /// Counts wait out a holder, up to one lease TTL
    Until(Instant),
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid variance transition {from} -> {to}")]
    InvalidTransition {
        from: VarianceStatus,
        to: VarianceStatus,
    },
    #[error("resolving or rejecting a variance requires resolved_by")]
    MissingResolver,
    /// Another writer holds the record or changed it since it was read.
    /// Re-read and retry.
    #[error("variance {item_code}/{session_id} was modified concurrently")]
    ConcurrentModification {
        item_code: String,
        session_id: String,
    },
    #[error("no variance for {item_code}/{session_id}")]
    NotFound {
        item_code: String,
        session_id: String,
    },
    #[error("session '{0}' is closed")]
    SessionClosed(String),
    #[error("unknown session '{0}'")]
    UnknownSession(String),
    #[error("invalid counted quantity {0}")]
    InvalidQuantity(f64),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DetectorError {
    fn concurrent(item_code: &str, session_id: &str) -> Self {
        metrics::record_concurrent_modification();
        Self::ConcurrentModification {
            item_code: item_code.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// What a count submission produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CountSubmission {
    /// The stored entry: `verified`, `flagged`, or `pending` when the
    /// variance could not be written yet
    pub entry: CountEntry,
    /// The variance created or refined, if any
    pub variance: Option<VarianceRecord>,
}

pub struct VarianceDetector {
    store: Arc<dyn OperationalStore>,
    locks: Arc<dyn LockManager>,
    notifier: Notifier,
    holder_id: String,
    thresholds: VarianceThresholds,
    lease_ttl: Duration,
    lease_attempts: usize,
}

impl VarianceDetector {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            store: ctx.store.clone(),
            locks: ctx.locks.clone(),
            notifier: ctx.notifier.clone(),
            holder_id: ctx.holder_id.clone(),
            thresholds: ctx.config.thresholds,
            lease_ttl: ctx.config.variance_lease_ttl(),
            lease_attempts: ctx.config.variance_lease_attempts.max(1),
        }
    }

    // ----- sessions -----

    /// Open a session, or return it if it is already open.
    pub async fn open_session(&self, session_id: &str) -> Result<CountSession, DetectorError> {
        match self.store.get_session(session_id).await? {
            Some(session) if session.status == SessionStatus::Open => Ok(session),
            Some(_) => Err(DetectorError::SessionClosed(session_id.to_string())),
            None => {
                let session = CountSession {
                    session_id: session_id.to_string(),
                    status: SessionStatus::Open,
                    opened_at: now_millis(),
                    closed_at: None,
                };
                self.store.put_session(&session).await?;
                info!(session_id, "Count session opened");
                Ok(session)
            }
        }
    }

    /// Close a session; its counts become immutable. Closing twice is a no-op.
    pub async fn close_session(&self, session_id: &str) -> Result<CountSession, DetectorError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| DetectorError::UnknownSession(session_id.to_string()))?;

        if session.status == SessionStatus::Closed {
            return Ok(session);
        }

        session.status = SessionStatus::Closed;
        session.closed_at = Some(now_millis());
        self.store.put_session(&session).await?;
        info!(session_id, "Count session closed");
        Ok(session)
    }

    async fn require_open(&self, session_id: &str) -> Result<CountSession, DetectorError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| DetectorError::UnknownSession(session_id.to_string()))?;
        if session.status == SessionStatus::Closed {
            return Err(DetectorError::SessionClosed(session_id.to_string()));
        }
        Ok(session)
    }

    // ----- counting -----

    /// Record a count and evaluate it.
    ///
    /// For a valid open session this always succeeds from the counter's
    /// point of view; a discrepancy shows up as `variance`, not as an error.
    /// If the variance stays locked by another writer for a whole lease TTL,
    /// or its write fails, the entry is stored `pending` and picked up by
    /// [`reevaluate_pending`](Self::reevaluate_pending).
    #[tracing::instrument(skip(self))]
    pub async fn submit_count(
        &self,
        session_id: &str,
        item_code: &str,
        counted_quantity: f64,
        counted_by: &str,
    ) -> Result<CountSubmission, DetectorError> {
        let mut entry = CountEntry::new(session_id, item_code, counted_quantity, counted_by);

        match self.evaluate(&entry).await {
            Ok(variance) => {
                entry.status = if variance.is_some() {
                    CountStatus::Flagged
                } else {
                    CountStatus::Verified
                };
                Ok(CountSubmission { entry, variance })
            }
            // Only a bad request rejects a count; anything that went wrong
            // writing the variance is retried later from the pending entry
            Err(e @ (DetectorError::ConcurrentModification { .. } | DetectorError::Storage(_))) => {
                entry.status = CountStatus::Pending;
                self.store.put_count(&entry).await?;
                metrics::record_count_deferred();
                warn!(item_code, session_id, error = %e, "Count stored for re-evaluation");
                Ok(CountSubmission { entry, variance: None })
            }
            Err(e) => Err(e),
        }
    }

    /// Compare a count with the authoritative quantity.
    ///
    /// An exact match marks the entry `verified` and returns `None`; an
    /// existing open variance for the pair is refined to a zero delta.
    /// Otherwise the entry is `flagged` and the variance for
    /// `(item_code, session_id)` is created or refined. An item missing from
    /// the authoritative data yields a critical variance.
    ///
    /// The entry and the variance are written together under the
    /// `variance:<item>:<session>` lease. When that lease cannot be had
    /// within one lease TTL nothing is written and the call fails with
    /// [`DetectorError::ConcurrentModification`].
    #[tracing::instrument(skip(self, entry), fields(item_code = %entry.item_code, session_id = %entry.session_id))]
    pub async fn evaluate(&self, entry: &CountEntry) -> Result<Option<VarianceRecord>, DetectorError> {
        if !entry.counted_quantity.is_finite() || entry.counted_quantity < 0.0 {
            return Err(DetectorError::InvalidQuantity(entry.counted_quantity));
        }
        self.require_open(&entry.session_id).await?;

        let deadline = Instant::now() + self.lease_ttl;
        let lease = self
            .acquire_lease(&entry.item_code, &entry.session_id, LeaseWait::Until(deadline))
            .await?;
        let result = self.apply_entry(&lease, entry).await;
        self.release_lease(&lease).await;
        result
    }

    /// Evaluate again every `pending` entry of an open session.
    ///
    /// Entries whose variance is still locked stay `pending`. Returns how many
    /// were settled.
    #[tracing::instrument(skip(self))]
    pub async fn reevaluate_pending(&self, session_id: &str) -> Result<usize, DetectorError> {
        self.require_open(session_id).await?;

        let mut settled = 0;
        for entry in self.store.counts_for_session(session_id).await? {
            if entry.status != CountStatus::Pending {
                continue;
            }
            match self.evaluate(&entry).await {
                Ok(_) => settled += 1,
                Err(DetectorError::ConcurrentModification { .. }) => {
                    debug!(item_code = %entry.item_code, session_id, "Still busy, left pending");
                }
                Err(e) => return Err(e),
            }
        }

        if settled > 0 {
            info!(session_id, settled, "Pending counts re-evaluated");
        }
        Ok(settled)
    }

    /// Runs under the variance lease: re-checks the session, then writes the
    /// variance and the entry.
    async fn apply_entry(
        &self,
        lease: &Lease,
        entry: &CountEntry,
    ) -> Result<Option<VarianceRecord>, DetectorError> {
        // The session may have closed while we waited for the lease
        self.require_open(&entry.session_id).await?;

        let authoritative = self
            .store
            .get_item(&entry.item_code)
            .await?
            .map(|item| item.quantity);
        if authoritative.is_none() {
            warn!(item_code = %entry.item_code, "Count for item unknown to the authoritative source");
        }

        let delta = entry.counted_quantity - authoritative.unwrap_or(0.0);
        let severity = classify(authoritative, entry.counted_quantity, &self.thresholds);
        let matches = severity == Severity::None;

        let record = self
            .apply_count(lease, entry, authoritative, delta, severity)
            .await?;

        let mut stored = entry.clone();
        stored.status = if matches { CountStatus::Verified } else { CountStatus::Flagged };
        self.ensure_live(lease)?;
        self.store.put_count(&stored).await?;
        metrics::record_count_submitted(matches);

        Ok(if matches { None } else { record })
    }

    async fn apply_count(
        &self,
        lease: &Lease,
        entry: &CountEntry,
        authoritative: Option<f64>,
        delta: f64,
        severity: Severity,
    ) -> Result<Option<VarianceRecord>, DetectorError> {
        let item_code = entry.item_code.as_str();
        let session_id = entry.session_id.as_str();
        let now = now_millis();
        let existing = self.store.get_variance(item_code, session_id).await?;

        let Some(current) = existing else {
            if severity == Severity::None {
                debug!(item_code, session_id, "Count verified");
                return Ok(None);
            }

            let record = VarianceRecord {
                item_code: item_code.to_string(),
                session_id: session_id.to_string(),
                authoritative_quantity: authoritative,
                counted_quantity: entry.counted_quantity,
                delta,
                severity,
                status: VarianceStatus::Open,
                created_at: now,
                updated_at: now,
                resolved_at: None,
                resolved_by: None,
                revision: 1,
            };

            self.ensure_live(lease)?;
            if self.store.insert_variance(&record).await? == WriteOutcome::Conflict {
                return Err(DetectorError::concurrent(item_code, session_id));
            }

            info!(item_code, session_id, delta, severity = %severity, "Variance opened");
            metrics::record_variance(severity.as_str());
            self.publish(EventKind::VarianceOpened, &record);
            return Ok(Some(record));
        };

        if current.status.is_terminal() {
            warn!(
                item_code,
                session_id,
                status = %current.status,
                "Recount against a closed variance left untouched"
            );
            return Ok(Some(current));
        }

        let refined = VarianceRecord {
            authoritative_quantity: authoritative,
            counted_quantity: entry.counted_quantity,
            delta: if severity == Severity::None { 0.0 } else { delta },
            severity,
            updated_at: now,
            revision: current.revision + 1,
            ..current.clone()
        };

        self.ensure_live(lease)?;
        if self.store.update_variance(&refined, current.revision).await? == WriteOutcome::Conflict {
            return Err(DetectorError::concurrent(item_code, session_id));
        }

        info!(item_code, session_id, delta = refined.delta, severity = %severity, "Variance refined by recount");
        metrics::record_variance(severity.as_str());
        self.publish(EventKind::VarianceUpdated, &refined);
        Ok(Some(refined))
    }

    // ----- review workflow -----

    pub async fn begin_review(
        &self,
        item_code: &str,
        session_id: &str,
        reviewer: &str,
        expected_revision: u64,
    ) -> Result<VarianceRecord, DetectorError> {
        self.transition(item_code, session_id, VarianceStatus::UnderReview, Some(reviewer), expected_revision)
            .await
    }

    pub async fn resolve(
        &self,
        item_code: &str,
        session_id: &str,
        resolved_by: &str,
        expected_revision: u64,
    ) -> Result<VarianceRecord, DetectorError> {
        self.transition(item_code, session_id, VarianceStatus::Resolved, Some(resolved_by), expected_revision)
            .await
    }

    pub async fn reject(
        &self,
        item_code: &str,
        session_id: &str,
        resolved_by: &str,
        expected_revision: u64,
    ) -> Result<VarianceRecord, DetectorError> {
        self.transition(item_code, session_id, VarianceStatus::Rejected, Some(resolved_by), expected_revision)
            .await
    }

    pub async fn reopen(
        &self,
        item_code: &str,
        session_id: &str,
        reviewer: &str,
        expected_revision: u64,
    ) -> Result<VarianceRecord, DetectorError> {
        self.transition(item_code, session_id, VarianceStatus::Open, Some(reviewer), expected_revision)
            .await
    }

    /// Move a variance to `to`.
    ///
    /// `expected_revision` is the revision the caller last read; if the
    /// record moved on since, or another writer holds its lease, this fails
    /// with [`DetectorError::ConcurrentModification`].
    #[tracing::instrument(skip(self))]
    pub async fn transition(
        &self,
        item_code: &str,
        session_id: &str,
        to: VarianceStatus,
        actor: Option<&str>,
        expected_revision: u64,
    ) -> Result<VarianceRecord, DetectorError> {
        let actor = actor.map(str::trim).filter(|a| !a.is_empty());
        if to.is_terminal() && actor.is_none() {
            return Err(DetectorError::MissingResolver);
        }

        let lease = self
            .acquire_lease(item_code, session_id, LeaseWait::Attempts(self.lease_attempts))
            .await?;
        let result = self
            .apply_transition(&lease, item_code, session_id, to, actor, expected_revision)
            .await;
        self.release_lease(&lease).await;
        result
    }

    async fn apply_transition(
        &self,
        lease: &Lease,
        item_code: &str,
        session_id: &str,
        to: VarianceStatus,
        actor: Option<&str>,
        expected_revision: u64,
    ) -> Result<VarianceRecord, DetectorError> {
        let current = self
            .store
            .get_variance(item_code, session_id)
            .await?
            .ok_or_else(|| DetectorError::NotFound {
                item_code: item_code.to_string(),
                session_id: session_id.to_string(),
            })?;

        if current.revision != expected_revision {
            debug!(item_code, session_id, expected_revision, actual = current.revision, "Stale revision");
            return Err(DetectorError::concurrent(item_code, session_id));
        }
        if !current.status.can_transition_to(to) {
            warn!(item_code, session_id, from = %current.status, to = %to, "Invalid variance transition");
            return Err(DetectorError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        let now = now_millis();
        let (resolved_at, resolved_by) = if to.is_terminal() {
            (Some(now), actor.map(String::from))
        } else {
            (None, None)
        };
        let next = VarianceRecord {
            status: to,
            updated_at: now,
            resolved_at,
            resolved_by,
            revision: current.revision + 1,
            ..current.clone()
        };

        self.ensure_live(lease)?;
        if self.store.update_variance(&next, current.revision).await? == WriteOutcome::Conflict {
            return Err(DetectorError::concurrent(item_code, session_id));
        }

        info!(item_code, session_id, from = %current.status, to = %to, actor = actor.unwrap_or(""), "Variance transitioned");
        metrics::record_variance_transition(to.as_str());

        let kind = match to {
            VarianceStatus::UnderReview => EventKind::VarianceUnderReview,
            VarianceStatus::Resolved | VarianceStatus::Rejected => EventKind::VarianceResolved,
            VarianceStatus::Open => EventKind::VarianceReopened,
        };
        self.publish(kind, &next);
        Ok(next)
    }

    // ----- queries -----

    pub async fn variance(
        &self,
        item_code: &str,
        session_id: &str,
    ) -> Result<Option<VarianceRecord>, DetectorError> {
        Ok(self.store.get_variance(item_code, session_id).await?)
    }

    pub async fn variances(
        &self,
        status: Option<VarianceStatus>,
    ) -> Result<Vec<VarianceRecord>, DetectorError> {
        Ok(self.store.list_variances(status).await?)
    }

    // ----- leasing -----

    /// Take the per-variance lease, backing off between tries until `wait`
    /// runs out.
    async fn acquire_lease(
        &self,
        item_code: &str,
        session_id: &str,
        wait: LeaseWait,
    ) -> Result<Lease, DetectorError> {
        let key = VarianceRecord::lease_key(item_code, session_id);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.locks.acquire(&key, &self.holder_id, self.lease_ttl).await? {
                Acquisition::Granted(lease) => {
                    metrics::record_lease("variance", "granted");
                    return Ok(lease);
                }
                Acquisition::Busy { holder_id, .. } => {
                    metrics::record_lease("variance", "busy");
                    debug!(resource_key = %key, attempt, holder = ?holder_id, "Variance lease busy");
                }
            }

            let pause = LEASE_BACKOFF * attempt.min(MAX_BACKOFF_STEPS);
            let again = match wait {
                LeaseWait::Attempts(max) => (attempt as usize) < max,
                LeaseWait::Until(deadline) => Instant::now() + pause <= deadline,
            };
            if !again {
                break;
            }
            tokio::time::sleep(pause).await;
        }

        warn!(resource_key = %key, attempts = attempt, "Gave up waiting for variance lease");
        Err(DetectorError::concurrent(item_code, session_id))
    }

    /// Refuse to write once our lease may have been taken over.
    fn ensure_live(&self, lease: &Lease) -> Result<(), DetectorError> {
        if lease.is_live(now_millis()) {
            return Ok(());
        }
        warn!(resource_key = %lease.resource_key, fencing_token = lease.fencing_token, "Variance lease expired before write");
        let (item_code, session_id) = split_lease_key(&lease.resource_key);
        Err(DetectorError::concurrent(item_code, session_id))
    }

    async fn release_lease(&self, lease: &Lease) {
        // An unreleased lease just runs out its TTL
        if let Err(e) = self.locks.release(lease).await {
            warn!(resource_key = %lease.resource_key, error = %e, "Failed to release variance lease");
        }
    }

    fn publish(&self, kind: EventKind, record: &VarianceRecord) {
        let payload = json!({
            "item_code": record.item_code,
            "session_id": record.session_id,
            "status": record.status.as_str(),
            "severity": record.severity.as_str(),
            "delta": record.delta,
            "authoritative_quantity": record.authoritative_quantity,
            "counted_quantity": record.counted_quantity,
            "revision": record.revision,
            "resolved_by": record.resolved_by,
        });
        self.notifier
            .publish(NotificationEvent::new(kind, payload).for_roles(VARIANCE_ROLES));
    }
}

/// `variance:<item>:<session>` back to its parts. Item codes may contain ':'
/// so the session is taken from the right.
fn split_lease_key(key: &str) -> (&str, &str) {
    let rest = key.strip_prefix("variance:").unwrap_or(key);
    rest.rsplit_once(':').unwrap_or((rest, ""))
}
