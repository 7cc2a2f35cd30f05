// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-process lock manager.
//!
//! Gives the same guarantees as the shared backends within one process;
//! useful for tests and single-instance deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::traits::{Acquisition, Lease, LockManager, Renewal};
use crate::model::now_millis;
use crate::storage::traits::StorageError;

/// Fencing tokens come from one counter shared by every key, so a token is
/// still strictly greater than any earlier token for the same key after its
/// entry has been dropped. Released and expired leases are removed, keeping
/// the table as small as the set of live leases.
#[derive(Default)]
struct LeaseTable {
    leases: HashMap<String, Lease>,
    last_token: u64,
}

pub struct InMemoryLockManager {
    table: Mutex<LeaseTable>,
}

impl InMemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LeaseTable::default()),
        }
    }

    /// Currently live leases.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let now = now_millis();
        self.table
            .lock()
            .leases
            .values()
            .filter(|lease| lease.is_live(now))
            .count()
    }

    /// Keys with an entry in the table, live or not yet swept.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.table.lock().leases.len()
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Acquisition, StorageError> {
        let now = now_millis();
        let mut table = self.table.lock();

        if let Some(current) = table.leases.get(resource_key).filter(|l| l.is_live(now)) {
            return Ok(Acquisition::Busy {
                holder_id: Some(current.holder_id.clone()),
                expires_at: Some(current.expires_at),
            });
        }

        // Sweep leases whose holders never released them
        table.leases.retain(|_, lease| lease.is_live(now));

        table.last_token += 1;
        let ttl_ms = ttl.as_millis() as u64;
        let lease = Lease {
            resource_key: resource_key.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl_ms as i64,
            ttl_ms,
            fencing_token: table.last_token,
        };
        table.leases.insert(resource_key.to_string(), lease.clone());

        debug!(resource_key, holder_id, fencing_token = lease.fencing_token, "Lease granted");
        Ok(Acquisition::Granted(lease))
    }

    async fn renew(&self, lease: &Lease) -> Result<Renewal, StorageError> {
        let now = now_millis();
        let mut table = self.table.lock();

        let Some(current) = table.leases.get_mut(&lease.resource_key) else {
            return Ok(Renewal::Expired);
        };

        if current.holder_id != lease.holder_id
            || current.fencing_token != lease.fencing_token
            || !current.is_live(now)
        {
            return Ok(Renewal::Expired);
        }

        current.expires_at = now + current.ttl_ms as i64;
        Ok(Renewal::Renewed(current.clone()))
    }

    async fn release(&self, lease: &Lease) -> Result<(), StorageError> {
        let mut table = self.table.lock();
        let held_by_caller = table.leases.get(&lease.resource_key).is_some_and(|current| {
            current.holder_id == lease.holder_id && current.fencing_token == lease.fencing_token
        });
        if held_by_caller {
            table.leases.remove(&lease.resource_key);
            debug!(resource_key = %lease.resource_key, "Lease released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_grants_then_busy() {
        let locks = InMemoryLockManager::new();

        let first = locks.acquire("sync:site-1", "node-a", TTL).await.unwrap();
        let lease = first.lease().expect("first acquire should be granted");
        assert_eq!(lease.holder_id, "node-a");
        assert_eq!(lease.fencing_token, 1);

        let second = locks.acquire("sync:site-1", "node-b", TTL).await.unwrap();
        assert_eq!(
            second,
            Acquisition::Busy {
                holder_id: Some("node-a".to_string()),
                expires_at: Some(lease.expires_at),
            }
        );
    }

    #[tokio::test]
    async fn test_same_holder_is_also_busy() {
        let locks = InMemoryLockManager::new();
        locks.acquire("k", "node-a", TTL).await.unwrap();
        assert!(locks.acquire("k", "node-a", TTL).await.unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire_with_higher_token() {
        let locks = InMemoryLockManager::new();
        let lease = locks.acquire("k", "node-a", TTL).await.unwrap().lease().unwrap();
        locks.release(&lease).await.unwrap();

        let next = locks.acquire("k", "node-b", TTL).await.unwrap().lease().unwrap();
        assert!(next.fencing_token > lease.fencing_token);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = InMemoryLockManager::new();
        let stale = locks
            .acquire("k", "node-a", Duration::from_millis(20))
            .await
            .unwrap()
            .lease()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!stale.is_live(now_millis()));

        let fresh = locks.acquire("k", "node-b", TTL).await.unwrap().lease().unwrap();
        assert!(fresh.fencing_token > stale.fencing_token);

        // The old holder learns it lost the lease
        assert_eq!(locks.renew(&stale).await.unwrap(), Renewal::Expired);
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let locks = InMemoryLockManager::new();
        let lease = locks.acquire("k", "node-a", TTL).await.unwrap().lease().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        match locks.renew(&lease).await.unwrap() {
            Renewal::Renewed(renewed) => {
                assert!(renewed.expires_at > lease.expires_at);
                assert_eq!(renewed.fencing_token, lease.fencing_token);
            }
            Renewal::Expired => panic!("renewal should succeed"),
        }
    }

    #[tokio::test]
    async fn test_release_by_stale_holder_is_noop() {
        let locks = InMemoryLockManager::new();
        let stale = locks
            .acquire("k", "node-a", Duration::from_millis(10))
            .await
            .unwrap()
            .lease()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        let current = locks.acquire("k", "node-b", TTL).await.unwrap().lease().unwrap();

        locks.release(&stale).await.unwrap();

        assert_eq!(locks.live_count(), 1);
        assert!(matches!(locks.renew(&current).await.unwrap(), Renewal::Renewed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_exactly_one() {
        let locks = Arc::new(InMemoryLockManager::new());
        let mut handles = vec![];

        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .acquire("variance:X100:S1", &format!("reviewer-{}", i), TTL)
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if !handle.await.unwrap().is_busy() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_released_keys_leave_the_table() {
        let locks = InMemoryLockManager::new();
        let mut last_token = 0;

        for session in 0..50 {
            let key = format!("variance:X100:S{}", session);
            let lease = locks.acquire(&key, "node-a", TTL).await.unwrap().lease().unwrap();
            assert!(lease.fencing_token > last_token);
            last_token = lease.fencing_token;
            locks.release(&lease).await.unwrap();
        }
        assert_eq!(locks.tracked_keys(), 0);

        // A key seen before still gets a larger token than last time
        let again = locks.acquire("variance:X100:S0", "node-b", TTL).await.unwrap().lease().unwrap();
        assert!(again.fencing_token > last_token);
    }

    #[tokio::test]
    async fn test_expired_leases_are_swept() {
        let locks = InMemoryLockManager::new();
        locks.acquire("a", "x", Duration::from_millis(10)).await.unwrap();
        locks.acquire("b", "x", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        locks.acquire("c", "x", TTL).await.unwrap();
        assert_eq!(locks.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let locks = InMemoryLockManager::new();
        assert!(!locks.acquire("a", "x", TTL).await.unwrap().is_busy());
        assert!(!locks.acquire("b", "x", TTL).await.unwrap().is_busy());
        assert_eq!(locks.live_count(), 2);
    }
}
