//! Typed event bus shared by discovery, sessions and health reporting.
//!
//! Publishing never blocks: a slow subscriber loses its oldest events
//! (`RecvError::Lagged`), and events sent while nobody listens are counted.

use crate::discovery::{BrokerDescriptor, ScanPhase, StopReason};
use crate::error::ErrorKind;
use crate::health::KernelHealth;
use crate::session::MessageSummary;
use crate::tree::TreeUpdate;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KernelEvent {
    BrokerDiscovered {
        broker: BrokerDescriptor,
    },
    BrokerUpdated {
        broker: BrokerDescriptor,
    },
    DiscoveryStarted {
        range: String,
        ports: Vec<u16>,
    },
    DiscoveryStopped {
        reason: StopReason,
    },
    DiscoveryError {
        kind: ErrorKind,
        reason: String,
    },
    ScanProgress {
        phase: ScanPhase,
        completed: usize,
        total: usize,
    },
    SessionConnecting {
        session_id: String,
        host: String,
        port: u16,
    },
    SessionConnected {
        session_id: String,
        session_present: bool,
    },
    SessionReconnecting {
        session_id: String,
        reason: String,
        attempt: u64,
    },
    SessionDisconnected {
        session_id: String,
        reason: Option<String>,
    },
    SessionError {
        session_id: String,
        kind: ErrorKind,
        reason: String,
    },
    SubscriptionGranted {
        session_id: String,
        filter: String,
        qos: u8,
    },
    SubscriptionFailed {
        session_id: String,
        filter: String,
        reason: String,
    },
    Unsubscribed {
        session_id: String,
        filter: String,
    },
    PublishCompleted {
        session_id: String,
        topic: String,
        bytes: usize,
    },
    MessageReceived {
        session_id: String,
        message: MessageSummary,
    },
    TopicTreeUpdated {
        session_id: String,
        update: TreeUpdate,
    },
    HealthReport {
        health: KernelHealth,
    },
}

impl KernelEvent {
    /// Session the event belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            KernelEvent::SessionConnecting { session_id, .. }
            | KernelEvent::SessionConnected { session_id, .. }
            | KernelEvent::SessionReconnecting { session_id, .. }
            | KernelEvent::SessionDisconnected { session_id, .. }
            | KernelEvent::SessionError { session_id, .. }
            | KernelEvent::SubscriptionGranted { session_id, .. }
            | KernelEvent::SubscriptionFailed { session_id, .. }
            | KernelEvent::Unsubscribed { session_id, .. }
            | KernelEvent::PublishCompleted { session_id, .. }
            | KernelEvent::MessageReceived { session_id, .. }
            | KernelEvent::TopicTreeUpdated { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<KernelEvent>,
    unheard: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            unheard: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: KernelEvent) {
        if self.sender.send(event).is_err() {
            self.unheard.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.sender.subscribe()
    }

    /// Events published while no subscriber was attached.
    pub fn unheard_count(&self) -> u64 {
        self.unheard.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsubscribed(filter: &str) -> KernelEvent {
        KernelEvent::Unsubscribed {
            session_id: "s1".into(),
            filter: filter.into(),
        }
    }

    #[test]
    fn test_publish_without_subscriber_is_counted() {
        let bus = EventBus::new(8);
        bus.publish(unsubscribed("a"));
        bus.publish(unsubscribed("b"));
        assert_eq!(bus.unheard_count(), 2);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(unsubscribed("a"));
        bus.publish(unsubscribed("b"));
        for expected in ["a", "b"] {
            match rx.recv().await.unwrap() {
                KernelEvent::Unsubscribed { filter, .. } => assert_eq!(filter, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(bus.unheard_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(unsubscribed(&n.to_string()));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn test_events_are_tagged() {
        let json = serde_json::to_value(KernelEvent::DiscoveryStopped {
            reason: StopReason::Completed,
        })
        .unwrap();
        assert_eq!(json["type"], "discovery-stopped");
        assert_eq!(json["reason"], "completed");
        assert_eq!(unsubscribed("x").session_id(), Some("s1"));
    }
}
