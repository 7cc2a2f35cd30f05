// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::traits::StorageError;

/// A time-bounded exclusive claim on a resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_key: String,
    pub holder_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
    /// TTL applied on acquisition and on every renewal
    pub ttl_ms: u64,
    /// Strictly increasing per resource key across all holders
    pub fencing_token: u64,
}

impl Lease {
    /// Whether the lease is still within its TTL at `now` (epoch millis).
    ///
    /// A holder must check this (or renew) before a destructive write: an
    /// expired lease may already have been granted to someone else.
    #[must_use]
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Outcome of [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Granted(Lease),
    /// Someone holds a live lease. Not an error: retry, back off, or skip.
    Busy {
        holder_id: Option<String>,
        expires_at: Option<i64>,
    },
}

impl Acquisition {
    /// The granted lease, if any.
    #[must_use]
    pub fn lease(self) -> Option<Lease> {
        match self {
            Self::Granted(lease) => Some(lease),
            Self::Busy { .. } => None,
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Outcome of [`LockManager::renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed(Lease),
    /// The caller no longer holds the lease (timed out, released, or taken over)
    Expired,
}

/// Cross-process mutual exclusion on logical resource keys.
///
/// Acquisition never blocks. Every live lease is exclusive: a second
/// `acquire` on the same key is `Busy` even for the same holder id.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Acquisition, StorageError>;

    /// Extend `expires_at` by the lease TTL if the caller still holds it
    /// (holder id and fencing token both match, not yet expired).
    async fn renew(&self, lease: &Lease) -> Result<Renewal, StorageError>;

    /// Drop the lease if still held by the caller. Releasing a lease that has
    /// already expired or been taken over is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), StorageError>;
}
