// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed lock manager.
//!
//! Each lease is a hash with a native TTL; a separate counter key issues
//! fencing tokens and never expires:
//!
//! ```text
//! {prefix}lock:{resource_key}        HASH  holder, token, acquired_at   (PEXPIRE ttl)
//! {prefix}lock_fence:{resource_key}  INT   last issued token
//! ```
//!
//! Acquire, renew and release are single Lua scripts, so the check and the
//! write happen atomically on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use super::traits::{Acquisition, Lease, LockManager, Renewal};
use crate::model::now_millis;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

/// Returns `{1, token, ""}` when granted, `{0, pttl, holder}` when busy.
const ACQUIRE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    local holder = redis.call('HGET', KEYS[1], 'holder') or ''
    return {0, redis.call('PTTL', KEYS[1]), holder}
end
local token = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'holder', ARGV[1], 'token', token, 'acquired_at', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {1, token, ''}
"#;

const RENEW_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'holder') == ARGV[1]
    and redis.call('HGET', KEYS[1], 'token') == ARGV[2] then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
    return 1
end
return 0
"#;

const RELEASE_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'holder') == ARGV[1]
    and redis.call('HGET', KEYS[1], 'token') == ARGV[2] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisLockManager {
    connection: ConnectionManager,
    prefix: String,
    acquire_script: Script,
    renew_script: Script,
    release_script: Script,
}

impl RedisLockManager {
    pub async fn new(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self::from_connection(connection, prefix))
    }

    /// Reuse an existing connection manager.
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            acquire_script: Script::new(ACQUIRE_LUA),
            renew_script: Script::new(RENEW_LUA),
            release_script: Script::new(RELEASE_LUA),
        }
    }

    #[inline]
    fn lease_key(&self, resource_key: &str) -> String {
        format!("{}lock:{}", self.prefix, resource_key)
    }

    #[inline]
    fn fence_key(&self, resource_key: &str) -> String {
        format!("{}lock_fence:{}", self.prefix, resource_key)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    #[tracing::instrument(skip(self))]
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Acquisition, StorageError> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let now = now_millis();
        let lease_key = self.lease_key(resource_key);
        let fence_key = self.fence_key(resource_key);

        let (granted, value, holder): (i64, i64, String) =
            retry("redis_lock_acquire", &RetryConfig::query(), || {
                let mut conn = self.connection.clone();
                let mut invocation = self.acquire_script.prepare_invoke();
                invocation
                    .key(&lease_key)
                    .key(&fence_key)
                    .arg(holder_id)
                    .arg(ttl_ms)
                    .arg(now);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        if granted == 1 {
            debug!(resource_key, holder_id, fencing_token = value, "Lease granted");
            return Ok(Acquisition::Granted(Lease {
                resource_key: resource_key.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: now,
                expires_at: now + ttl_ms as i64,
                ttl_ms,
                fencing_token: value as u64,
            }));
        }

        // PTTL is -1 for a key without expiry and -2 if it vanished meanwhile
        Ok(Acquisition::Busy {
            holder_id: (!holder.is_empty()).then_some(holder),
            expires_at: (value >= 0).then(|| now + value),
        })
    }

    async fn renew(&self, lease: &Lease) -> Result<Renewal, StorageError> {
        let now = now_millis();
        let lease_key = self.lease_key(&lease.resource_key);
        let token = lease.fencing_token.to_string();

        let renewed: i64 = retry("redis_lock_renew", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let mut invocation = self.renew_script.prepare_invoke();
            invocation
                .key(&lease_key)
                .arg(&lease.holder_id)
                .arg(&token)
                .arg(lease.ttl_ms);
            async move { invocation.invoke_async(&mut conn).await }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        if renewed == 1 {
            Ok(Renewal::Renewed(Lease {
                expires_at: now + lease.ttl_ms as i64,
                ..lease.clone()
            }))
        } else {
            Ok(Renewal::Expired)
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StorageError> {
        let lease_key = self.lease_key(&lease.resource_key);
        let token = lease.fencing_token.to_string();

        let _removed: i64 = retry("redis_lock_release", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let mut invocation = self.release_script.prepare_invoke();
            invocation
                .key(&lease_key)
                .arg(&lease.holder_id)
                .arg(&token);
            async move { invocation.invoke_async(&mut conn).await }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(())
    }
}
