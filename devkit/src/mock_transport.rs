/*!
In-memory MQTT transport for session tests without a broker.

`MockConnector` hands each new session a `MockTransport`. Tests drive the
broker side through it (connack, inbound publishes, drops) and inspect
what the session sent back.
*/

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::QoS;
use sparkscope_kernel::session::{Connector, InboundPublish, SessionSettings, Transport, TransportEvent, TransportLink};
use sparkscope_kernel::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPublish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

pub struct MockTransport {
    session_id: String,
    settings: SessionSettings,
    events: mpsc::Sender<TransportEvent>,
    auto_ack: bool,
    published: Mutex<Vec<RecordedPublish>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    unsubscriptions: Mutex<Vec<String>>,
    disconnected: AtomicBool,
}

impl MockTransport {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Broker accepted the connection.
    pub async fn connect(&self, session_present: bool) -> Result<()> {
        self.emit(TransportEvent::Connected { session_present }).await
    }

    pub async fn fail_connect(&self, reason: &str) -> Result<()> {
        self.emit(TransportEvent::ConnectFailed { reason: reason.into() }).await
    }

    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.emit(TransportEvent::Message(InboundPublish {
            topic: topic.into(),
            payload: Bytes::from(payload.into()),
            qos: QoS::AtMostOnce,
            retain: false,
        }))
        .await
    }

    pub async fn drop_connection(&self, reason: &str, will_retry: bool) -> Result<()> {
        self.emit(TransportEvent::Dropped {
            reason: reason.into(),
            will_retry,
        })
        .await
    }

    /// Answers a pending subscribe by hand when auto-ack is off.
    pub async fn ack_subscribe(&self, filter: &str, granted: std::result::Result<QoS, String>) -> Result<()> {
        self.emit(TransportEvent::SubscribeAck {
            filter: filter.into(),
            granted,
        })
        .await
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<RecordedPublish> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("session {} no longer listening", self.session_id))
    }

    // Called from inside the session worker, so never wait on the channel.
    fn emit_now(&self, event: TransportEvent) {
        if self.events.try_send(event).is_err() {
            log::warn!("[MOCK] {} dropped a transport event", self.session_id);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Closed);
        }
        self.subscriptions.lock().push((filter.to_string(), qos));
        log::info!("[MOCK] {} subscribed to {}", self.session_id, filter);
        if self.auto_ack {
            self.emit_now(TransportEvent::SubscribeAck {
                filter: filter.into(),
                granted: Ok(qos),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Closed);
        }
        self.unsubscriptions.lock().push(filter.to_string());
        if self.auto_ack {
            self.emit_now(TransportEvent::UnsubscribeAck { filter: filter.into() });
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Closed);
        }
        log::info!("[MOCK] {} published {} bytes to {}", self.session_id, payload.len(), topic);
        self.published.lock().push(RecordedPublish {
            topic: topic.into(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.emit_now(TransportEvent::Closed);
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorInner {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    refuse: AtomicBool,
    manual_acks: AtomicBool,
}

/// Hands out one `MockTransport` per opened session.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe requests stay pending until `ack_subscribe`.
    pub fn with_manual_acks(self) -> Self {
        self.inner.manual_acks.store(true, Ordering::SeqCst);
        self
    }

    /// Makes `open` fail like an unreachable broker.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.inner.transports.lock().len()
    }

    pub fn transport(&self, session_id: &str) -> Option<Arc<MockTransport>> {
        self.inner
            .transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.session_id == session_id)
            .cloned()
    }

    /// Polls until the session's worker has opened its transport.
    pub async fn wait_for_transport(&self, session_id: &str) -> Result<Arc<MockTransport>> {
        for _ in 0..200 {
            if let Some(transport) = self.transport(session_id) {
                return Ok(transport);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("no transport opened for session {session_id}")
    }
}

impl Connector for MockConnector {
    fn open(&self, session_id: &str, settings: &SessionSettings) -> Result<TransportLink, TransportError> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!(
                "{}:{} refused the connection",
                settings.host, settings.port
            )));
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(MockTransport {
            session_id: session_id.into(),
            settings: settings.clone(),
            events: tx,
            auto_ack: !self.inner.manual_acks.load(Ordering::SeqCst),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });
        self.inner.transports.lock().push(transport.clone());
        Ok(TransportLink {
            transport,
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkscope_kernel::{EventBus, SessionConfig, SessionManager, SessionState};

    #[tokio::test]
    async fn test_refused_connection_closes_session() {
        let connector = MockConnector::new();
        connector.refuse_connections(true);
        let manager = SessionManager::new(EventBus::default(), Arc::new(connector.clone()));
        let id = manager.connect(SessionConfig::new("broker", 1883)).unwrap();

        for _ in 0..100 {
            if manager.state(&id).unwrap() == SessionState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.state(&id).unwrap(), SessionState::Closed);
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_ack_grants_requested_qos() {
        let connector = MockConnector::new();
        let manager = SessionManager::new(EventBus::default(), Arc::new(connector.clone()));
        let id = manager.connect(SessionConfig::new("broker", 1883)).unwrap();
        let transport = connector.wait_for_transport(&id).await.unwrap();
        transport.connect(false).await.unwrap();

        for _ in 0..100 {
            let snapshot = manager.snapshot(&id).unwrap();
            if snapshot.subscriptions.iter().any(|s| s.granted.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = manager.snapshot(&id).unwrap();
        assert_eq!(snapshot.subscriptions[0].filter, "#");
        assert_eq!(snapshot.subscriptions[0].granted, Some(QoS::AtMostOnce));
        assert_eq!(transport.subscriptions(), vec!["#"]);
    }
}
