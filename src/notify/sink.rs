// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;
use tokio::sync::mpsc;

use super::NotificationEvent;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue full")]
    Full,
    #[error("subscriber gone")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A delivery endpoint. `deliver` runs on the publisher's task, so it must
/// hand the event off without blocking or awaiting.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}

/// Bounded in-process queue; a full or closed channel drops the event.
pub struct ChannelSink {
    tx: mpsc::Sender<NotificationEvent>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventKind;

    #[test]
    fn test_full_channel_drops() {
        let (sink, _rx) = ChannelSink::new(1);
        let event = NotificationEvent::new(EventKind::SyncCompleted, serde_json::json!({}));

        assert_eq!(sink.deliver(&event), Ok(()));
        assert_eq!(sink.deliver(&event), Err(DeliveryError::Full));
    }

    #[test]
    fn test_closed_channel_reports_closed() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        let event = NotificationEvent::new(EventKind::SyncCompleted, serde_json::json!({}));
        assert_eq!(sink.deliver(&event), Err(DeliveryError::Closed));
    }
}
