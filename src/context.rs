// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composition root.
//!
//! Everything the engine and detector share (store, locks, notifier) is
//! built once here and passed in explicitly; there is no global handle.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, InventorySyncConfig, LockBackend};
use crate::lock::{InMemoryLockManager, LockManager, RedisLockManager, SqlLockManager};
use crate::notify::{Notifier, RedisStreamSink};
use crate::resilience::retry::{retry, RetryConfig};
use crate::source::{SourceError, SourceReader, SqlSourceReader};
use crate::storage::{InMemoryStore, OperationalStore, SqlStore, StorageError};

/// Entries kept in the notification stream.
const NOTIFICATION_STREAM_MAXLEN: usize = 10_000;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("'{0}' is not configured")]
    NotConfigured(&'static str),
}

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<InventorySyncConfig>,
    pub store: Arc<dyn OperationalStore>,
    pub locks: Arc<dyn LockManager>,
    pub notifier: Notifier,
    /// Lease holder id for this process
    pub holder_id: String,
}

impl AppContext {
    pub fn new(
        config: InventorySyncConfig,
        store: Arc<dyn OperationalStore>,
        locks: Arc<dyn LockManager>,
        notifier: Notifier,
    ) -> Self {
        let holder_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("instance-{}", uuid::Uuid::new_v4()));
        Self {
            config: Arc::new(config),
            store,
            locks,
            notifier,
            holder_id,
        }
    }

    /// In-memory store and locks; for tests and single-process demos.
    pub fn in_memory(config: InventorySyncConfig) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryLockManager::new()),
            Notifier::new(),
        )
    }

    /// Build backends from configuration.
    ///
    /// The store is SQL when `store_url` is set, in-memory otherwise. With a
    /// `redis_url`, every event is also mirrored into the Redis stream.
    pub async fn connect(config: InventorySyncConfig) -> Result<Self, ContextError> {
        config.validate()?;

        let sql_store = match &config.store_url {
            Some(url) => Some(SqlStore::new(url).await?),
            None => None,
        };

        let redis = match &config.redis_url {
            Some(url) => Some(redis_connection(url).await?),
            None => None,
        };

        let locks: Arc<dyn LockManager> = match config.lock_backend {
            LockBackend::Memory => Arc::new(InMemoryLockManager::new()),
            LockBackend::Sql => {
                let store = sql_store.as_ref().ok_or(ContextError::NotConfigured("store_url"))?;
                Arc::new(SqlLockManager::from_pool(store.pool(), store.is_sqlite()).await?)
            }
            LockBackend::Redis => {
                let connection = redis.clone().ok_or(ContextError::NotConfigured("redis_url"))?;
                Arc::new(RedisLockManager::from_connection(connection, Some(&config.redis_prefix)))
            }
        };

        let store: Arc<dyn OperationalStore> = match sql_store {
            Some(store) => Arc::new(store),
            None => Arc::new(InMemoryStore::new()),
        };

        let notifier = Notifier::new();
        if let Some(connection) = redis {
            let (sink, _writer) = RedisStreamSink::spawn(
                connection,
                &config.redis_prefix,
                config.notification_buffer,
                NOTIFICATION_STREAM_MAXLEN,
            );
            info!(stream = sink.stream_key(), "Mirroring notifications to Redis");
            notifier.subscribe_all("redis-stream", sink);
        }

        info!(
            installation_id = %config.installation_id,
            lock_backend = ?config.lock_backend,
            "Context ready"
        );
        Ok(Self::new(config, store, locks, notifier))
    }

    /// Open the configured authoritative source.
    pub async fn source_reader(&self) -> Result<Arc<dyn SourceReader>, ContextError> {
        let url = self
            .config
            .source_url
            .as_deref()
            .ok_or(ContextError::NotConfigured("source_url"))?;
        let reader = SqlSourceReader::connect(
            url,
            &self.config.source_table,
            self.config.source_deleted_column.as_deref(),
            self.config.source_timeout(),
        )
        .await?;
        Ok(Arc::new(reader))
    }
}

async fn redis_connection(url: &str) -> Result<ConnectionManager, StorageError> {
    let client = redis::Client::open(url).map_err(|e| StorageError::Backend(e.to_string()))?;
    retry("redis_connect", &RetryConfig::startup(), || async {
        ConnectionManager::new(client.clone()).await
    })
    .await
    .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_becomes_holder() {
        let ctx = AppContext::in_memory(InventorySyncConfig {
            instance_id: Some("node-a".into()),
            ..Default::default()
        });
        assert_eq!(ctx.holder_id, "node-a");
    }

    #[test]
    fn test_random_holder_when_unset() {
        let a = AppContext::in_memory(InventorySyncConfig::default());
        let b = AppContext::in_memory(InventorySyncConfig::default());
        assert!(a.holder_id.starts_with("instance-"));
        assert_ne!(a.holder_id, b.holder_id);
    }

    #[tokio::test]
    async fn test_connect_defaults_to_memory() {
        let ctx = AppContext::connect(InventorySyncConfig::default()).await.unwrap();
        assert_eq!(ctx.store.count_items().await.unwrap(), 0);
        assert_eq!(ctx.notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_source_reader_requires_url() {
        let ctx = AppContext::in_memory(InventorySyncConfig::default());
        assert!(matches!(
            ctx.source_reader().await,
            Err(ContextError::NotConfigured("source_url"))
        ));
    }
}
