// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror events into a capped Redis stream for out-of-process consumers.
//!
//! ```text
//! XADD {prefix}notifications MAXLEN ~ {maxlen} * type <t> payload <json> target_roles <csv> timestamp <ms>
//! ```
//!
//! Delivery only enqueues; a background task does the `XADD`, so a slow or
//! unreachable Redis never stalls the publisher. Failed writes are logged and
//! the event is lost.

use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sink::{DeliveryError, EventSink};
use super::NotificationEvent;

pub struct RedisStreamSink {
    tx: mpsc::Sender<NotificationEvent>,
    stream_key: String,
}

impl RedisStreamSink {
    /// Spawn the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(
        connection: ConnectionManager,
        prefix: &str,
        buffer: usize,
        maxlen: usize,
    ) -> (Self, JoinHandle<()>) {
        let stream_key = format!("{}notifications", prefix);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(write_loop(connection, stream_key.clone(), maxlen, rx));
        (Self { tx, stream_key }, handle)
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

impl EventSink for RedisStreamSink {
    fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Runs until every sender is dropped.
async fn write_loop(
    mut connection: ConnectionManager,
    stream_key: String,
    maxlen: usize,
    mut rx: mpsc::Receiver<NotificationEvent>,
) {
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event.payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Unserializable notification payload");
                continue;
            }
        };

        let result: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(maxlen)
            .arg("*")
            .arg("type")
            .arg(event.kind.as_str())
            .arg("payload")
            .arg(payload)
            .arg("target_roles")
            .arg(event.target_roles.join(","))
            .arg("timestamp")
            .arg(event.timestamp)
            .query_async(&mut connection)
            .await;

        match result {
            Ok(id) => debug!(stream = %stream_key, id = %id, "Notification appended"),
            Err(e) => warn!(stream = %stream_key, error = %e, "Failed to append notification"),
        }
    }
    debug!(stream = %stream_key, "Notification writer stopped");
}
