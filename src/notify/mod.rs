// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Best-effort, role-scoped fan-out of sync and variance events.
//!
//! [`Notifier::publish`] never blocks and never fails: each subscriber's
//! [`EventSink`] is tried independently, and a sink that errors (or panics)
//! only loses its own copy of the event.
//!
//! # Example
//!
//! ```
//! use inventory_sync::notify::{ChannelSink, EventKind, NotificationEvent, Notifier};
//! use serde_json::json;
//!
//! let notifier = Notifier::new();
//! let (sink, mut rx) = ChannelSink::new(16);
//! notifier.subscribe("supervisors", &["supervisor"], sink);
//!
//! notifier.publish(
//!     NotificationEvent::new(EventKind::VarianceOpened, json!({"item_code": "X100"}))
//!         .for_roles(&["supervisor"]),
//! );
//! assert_eq!(rx.try_recv().unwrap().kind, EventKind::VarianceOpened);
//! ```

pub mod redis;
pub mod sink;

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::model::now_millis;

pub use self::redis::RedisStreamSink;
pub use sink::{ChannelSink, DeliveryError, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SyncCompleted,
    SyncFailed,
    ItemsStale,
    VarianceOpened,
    VarianceUpdated,
    VarianceUnderReview,
    /// Terminal review outcome; the payload's `status` says resolved or rejected
    VarianceResolved,
    VarianceReopened,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncCompleted => "sync_completed",
            Self::SyncFailed => "sync_failed",
            Self::ItemsStale => "items_stale",
            Self::VarianceOpened => "variance_opened",
            Self::VarianceUpdated => "variance_updated",
            Self::VarianceUnderReview => "variance_under_review",
            Self::VarianceResolved => "variance_resolved",
            Self::VarianceReopened => "variance_reopened",
        }
    }
}

/// Wire shape: `{type, payload, target_roles, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    /// Empty means every subscriber
    #[serde(default)]
    pub target_roles: Vec<String>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl NotificationEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            target_roles: Vec::new(),
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn for_roles(mut self, roles: &[&str]) -> Self {
        self.target_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

struct Subscriber {
    id: u64,
    name: String,
    /// `None` receives every event regardless of targeting
    roles: Option<HashSet<String>>,
    sink: Arc<dyn EventSink>,
}

impl Subscriber {
    fn wants(&self, event: &NotificationEvent) -> bool {
        match &self.roles {
            None => true,
            Some(_) if event.target_roles.is_empty() => true,
            Some(roles) => event.target_roles.iter().any(|r| roles.contains(r)),
        }
    }
}

#[derive(Default)]
struct Registry {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl Registry {
    fn add(&mut self, name: &str, roles: Option<HashSet<String>>, sink: Arc<dyn EventSink>) {
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id: self.next_id,
            name: name.to_string(),
            roles,
            sink,
        });
    }
}

/// Cheap to clone; clones share the subscriber list.
///
/// A subscriber whose sink reports [`DeliveryError::Closed`] is dropped on
/// the spot, so departed clients do not accumulate.
#[derive(Clone, Default)]
pub struct Notifier {
    registry: Arc<RwLock<Registry>>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive untargeted events plus events targeted at any of `roles`.
    pub fn subscribe(&self, name: &str, roles: &[&str], sink: impl EventSink + 'static) {
        let roles = roles.iter().map(|r| r.to_string()).collect();
        self.registry.write().add(name, Some(roles), Arc::new(sink));
    }

    /// Receive every event (audit logs, stream mirrors).
    pub fn subscribe_all(&self, name: &str, sink: impl EventSink + 'static) {
        self.registry.write().add(name, None, Arc::new(sink));
    }

    /// Remove every subscriber registered under `name`. Returns how many.
    pub fn unsubscribe(&self, name: &str) -> usize {
        let mut registry = self.registry.write();
        let before = registry.subscribers.len();
        registry.subscribers.retain(|s| s.name != name);
        let removed = before - registry.subscribers.len();
        if removed > 0 {
            debug!(subscriber = name, removed, "Unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().subscribers.len()
    }

    /// Deliver to every interested subscriber. Returns how many accepted it.
    pub fn publish(&self, event: NotificationEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let registry = self.registry.read();
            for subscriber in registry.subscribers.iter().filter(|s| s.wants(&event)) {
                let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.sink.deliver(&event)));
                match outcome {
                    Ok(Ok(())) => {
                        delivered += 1;
                        metrics::record_notification(event.kind.as_str(), true);
                    }
                    Ok(Err(DeliveryError::Closed)) => {
                        closed.push(subscriber.id);
                        metrics::record_notification(event.kind.as_str(), false);
                    }
                    Ok(Err(e)) => {
                        warn!(subscriber = %subscriber.name, event = event.kind.as_str(), error = %e, "Notification dropped");
                        metrics::record_notification(event.kind.as_str(), false);
                    }
                    Err(_) => {
                        warn!(subscriber = %subscriber.name, event = event.kind.as_str(), "Notification sink panicked");
                        metrics::record_notification(event.kind.as_str(), false);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.registry.write().subscribers.retain(|s| !closed.contains(&s.id));
            info!(removed = closed.len(), "Dropped subscribers with closed sinks");
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn deliver(&self, _event: &NotificationEvent) -> Result<(), DeliveryError> {
            Err(DeliveryError::Failed("socket closed".into()))
        }
    }

    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn deliver(&self, _event: &NotificationEvent) -> Result<(), DeliveryError> {
            panic!("sink bug")
        }
    }

    fn event(kind: EventKind) -> NotificationEvent {
        NotificationEvent::new(kind, json!({}))
    }

    #[test]
    fn test_serializes_wire_shape() {
        let value = serde_json::to_value(
            NotificationEvent::new(EventKind::SyncCompleted, json!({"items_upserted": 3}))
                .for_roles(&["admin"]),
        )
        .unwrap();

        assert_eq!(value["type"], "sync_completed");
        assert_eq!(value["payload"]["items_upserted"], 3);
        assert_eq!(value["target_roles"], json!(["admin"]));
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_role_filtering() {
        let notifier = Notifier::new();
        let (counter_sink, mut counters) = ChannelSink::new(8);
        let (supervisor_sink, mut supervisors) = ChannelSink::new(8);
        notifier.subscribe("counters", &["counter"], counter_sink);
        notifier.subscribe("supervisors", &["supervisor", "admin"], supervisor_sink);

        notifier.publish(event(EventKind::VarianceOpened).for_roles(&["supervisor"]));
        notifier.publish(event(EventKind::SyncCompleted));

        assert_eq!(supervisors.try_recv().unwrap().kind, EventKind::VarianceOpened);
        assert_eq!(supervisors.try_recv().unwrap().kind, EventKind::SyncCompleted);
        // Untargeted events reach everyone; targeted ones only matching roles
        assert_eq!(counters.try_recv().unwrap().kind, EventKind::SyncCompleted);
        assert!(counters.try_recv().is_err());
    }

    #[test]
    fn test_failing_sink_does_not_affect_others() {
        let notifier = Notifier::new();
        notifier.subscribe_all("broken", FailingSink);
        notifier.subscribe_all("panics", PanickingSink);
        let (sink, mut rx) = ChannelSink::new(8);
        notifier.subscribe_all("healthy", sink);

        let delivered = notifier.publish(event(EventKind::SyncFailed));

        assert_eq!(delivered, 1);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::SyncFailed);
    }

    #[test]
    fn test_publish_without_subscribers() {
        assert_eq!(Notifier::new().publish(event(EventKind::ItemsStale)), 0);
    }

    #[test]
    fn test_closed_sinks_are_pruned() {
        let notifier = Notifier::new();
        for i in 0..100 {
            let (sink, rx) = ChannelSink::new(4);
            notifier.subscribe(&format!("client-{}", i), &["counter"], sink);
            drop(rx);
        }
        let (sink, mut rx) = ChannelSink::new(4);
        notifier.subscribe("still-here", &["counter"], sink);
        assert_eq!(notifier.subscriber_count(), 101);

        assert_eq!(notifier.publish(event(EventKind::SyncCompleted)), 1);

        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::SyncCompleted);
        assert_eq!(notifier.publish(event(EventKind::SyncCompleted)), 1);
    }

    #[test]
    fn test_full_sink_is_kept() {
        let notifier = Notifier::new();
        let (sink, _rx) = ChannelSink::new(1);
        notifier.subscribe_all("slow", sink);

        assert_eq!(notifier.publish(event(EventKind::SyncCompleted)), 1);
        assert_eq!(notifier.publish(event(EventKind::SyncCompleted)), 0);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_by_name() {
        let notifier = Notifier::new();
        let (a, _rx_a) = ChannelSink::new(4);
        let (b, mut rx_b) = ChannelSink::new(4);
        notifier.subscribe("dashboard", &["supervisor"], a);
        notifier.subscribe_all("audit", b);

        assert_eq!(notifier.unsubscribe("dashboard"), 1);
        assert_eq!(notifier.unsubscribe("dashboard"), 0);
        assert_eq!(notifier.subscriber_count(), 1);

        assert_eq!(notifier.publish(event(EventKind::VarianceOpened).for_roles(&["supervisor"])), 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_clones_share_subscribers() {
        let notifier = Notifier::new();
        let clone = notifier.clone();
        let (sink, _rx) = ChannelSink::new(1);
        clone.subscribe_all("late", sink);
        assert_eq!(notifier.subscriber_count(), 1);
    }
}
