/**
 * SESSION - Multi-broker session manager
 *
 * ROLE: owns one MQTT session per broker connection. Tracks subscriptions and
 * counters, buffers inbound messages per topic and feeds Sparkplug payloads
 * into the shared metric tree.
 *
 * HOW: `connect` validates, registers the session and returns its id at once.
 * A worker task per session opens the transport through the injected Connector
 * and applies TransportEvents in receipt order. Commands (subscribe, publish...)
 * go straight to the transport and race the session's CancellationToken.
 * A requested disconnect keeps the worker draining until the transport reports
 * Closed (bounded by DISCONNECT_GRACE), so DISCONNECT reaches the broker.
 *
 * STATE: Idle -> Connecting -> Connected -> {Reconnecting <-> Connected, Closing} -> Closed
 *
 * LOCKS: session table (RwLock), one Mutex per session, one for the tree.
 * None is held across an .await.
 */

mod classify;
mod model;
mod rumqtt;
mod transport;

pub use classify::{classify, MessageKind, SchemaOutcome};
pub use model::{
    default_client_id, qos_from_level, qos_level, Credentials, Message, MessageSummary, SessionConfig,
    SessionMetrics, SessionSettings, SessionSnapshot, SessionState, Subscription, TopicStats,
    DEFAULT_BUFFER_CAPACITY,
};
pub use rumqtt::{RumqttConnector, RumqttTransport};
pub use transport::{Connector, InboundPublish, Transport, TransportEvent, TransportLink};

use crate::buffer::TopicBuffers;
use crate::error::{ErrorKind, SessionError};
use crate::events::{EventBus, KernelEvent};
use crate::sparkplug::{self, Payload};
use crate::state::{new_state, Shared};
use crate::topic::TopicParser;
use crate::tree::{MetricTree, TreeSummary, DEFAULT_HISTORY_CAPACITY};
use parking_lot::{Mutex, RwLock};
use rumqttc::QoS;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SessionId = String;

/// Filter subscribed automatically on the first connection.
pub const AUTO_SUBSCRIBE_FILTER: &str = "#";

/// How long a requested disconnect waits for the transport to flush DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum PublishPayload {
    Binary(Vec<u8>),
    Text(String),
    Structured(serde_json::Value),
    Sparkplug(Payload),
}

impl PublishPayload {
    fn into_bytes(self) -> Result<Vec<u8>, SessionError> {
        match self {
            PublishPayload::Binary(bytes) => Ok(bytes),
            PublishPayload::Text(text) => Ok(text.into_bytes()),
            PublishPayload::Structured(value) => serde_json::to_vec(&value)
                .map_err(|e| SessionError::Validation(format!("payload is not serializable: {e}"))),
            PublishPayload::Sparkplug(payload) => Ok(sparkplug::encode(&payload)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

#[derive(Debug, Clone)]
struct TopicCounter {
    count: u64,
    bytes: u64,
    last_kind: MessageKind,
    last_activity: OffsetDateTime,
}

struct SessionRecord {
    state: SessionState,
    subscriptions: BTreeMap<String, Subscription>,
    buffers: TopicBuffers<Arc<Message>>,
    topics: HashMap<String, TopicCounter>,
    metrics: SessionMetrics,
    created_at: OffsetDateTime,
    connected_at: Option<OffsetDateTime>,
    last_activity: Option<OffsetDateTime>,
    last_error: Option<String>,
    /// Set on the first move to Closed; retention expires the tombstone from here.
    closed_at: Option<OffsetDateTime>,
    ever_connected: bool,
    disconnect_emitted: bool,
}

struct SessionHandle {
    id: SessionId,
    config: SessionConfig,
    settings: SessionSettings,
    /// Aborts in-flight commands once the session starts closing.
    token: CancellationToken,
    /// Stops the worker; cancelled only when the session is Closed.
    worker: CancellationToken,
    /// Signalled when the transport confirms a requested close.
    flushed: Notify,
    record: Mutex<SessionRecord>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl SessionHandle {
    fn snapshot(&self) -> SessionSnapshot {
        let record = self.record.lock();
        SessionSnapshot {
            id: self.id.clone(),
            name: self.settings.name.clone(),
            host: self.settings.host.clone(),
            port: self.settings.port,
            client_id: self.settings.client_id.clone(),
            use_tls: self.settings.use_tls,
            state: record.state,
            config: self.config.clone(),
            subscriptions: record.subscriptions.values().cloned().collect(),
            metrics: record.metrics.clone(),
            topic_count: record.buffers.topic_count(),
            buffered_messages: record.buffers.total_len(),
            created_at: record.created_at,
            connected_at: record.connected_at,
            last_activity: record.last_activity,
            last_error: record.last_error.clone(),
        }
    }
}

struct ManagerInner {
    bus: EventBus,
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    tree: Shared<MetricTree>,
    parser: TopicParser,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(bus: EventBus, connector: Arc<dyn Connector>) -> Self {
        Self::with_tree(bus, connector, TopicParser::default(), DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_tree(
        bus: EventBus,
        connector: Arc<dyn Connector>,
        parser: TopicParser,
        history_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                connector,
                sessions: RwLock::new(HashMap::new()),
                tree: new_state(MetricTree::new(history_capacity)),
                parser,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Registers the session and starts connecting in the background.
    pub fn connect(&self, config: SessionConfig) -> Result<SessionId, SessionError> {
        let settings = config.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            config: config.redacted(),
            token: CancellationToken::new(),
            worker: CancellationToken::new(),
            flushed: Notify::new(),
            record: Mutex::new(SessionRecord {
                state: SessionState::Connecting,
                subscriptions: BTreeMap::new(),
                buffers: TopicBuffers::new(settings.buffer_capacity, settings.max_topics),
                topics: HashMap::new(),
                metrics: SessionMetrics::default(),
                created_at: OffsetDateTime::now_utc(),
                connected_at: None,
                last_activity: None,
                last_error: None,
                closed_at: None,
                ever_connected: false,
                disconnect_emitted: false,
            }),
            transport: Mutex::new(None),
            settings,
        });
        self.inner.sessions.write().insert(id.clone(), handle.clone());

        info!(session = %id, host = %handle.settings.host, port = handle.settings.port, "session connecting");
        self.inner.bus.publish(KernelEvent::SessionConnecting {
            session_id: id.clone(),
            host: handle.settings.host.clone(),
            port: handle.settings.port,
        });

        let manager = self.clone();
        tokio::spawn(async move { manager.drive(handle).await });
        Ok(id)
    }

    /// Idempotent: closing or closed sessions return Ok without new events.
    pub async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        {
            let mut record = handle.record.lock();
            if record.state.is_terminal() {
                return Ok(());
            }
            record.state = SessionState::Closing;
        }
        handle.token.cancel();

        let transport = handle.transport.lock().clone();
        if let Some(transport) = transport {
            match transport.disconnect().await {
                // the worker keeps draining events until the transport reports Closed
                Ok(()) => {
                    if tokio::time::timeout(DISCONNECT_GRACE, handle.flushed.notified()).await.is_err() {
                        debug!(session = %id, "transport did not confirm close in time");
                    }
                }
                Err(e) => debug!(session = %id, error = %e, "transport disconnect failed"),
            }
        }
        self.close(&handle, None);
        Ok(())
    }

    /// Disconnects if needed, then drops the session tombstone.
    pub async fn forget(&self, id: &str) -> Result<(), SessionError> {
        self.disconnect(id).await?;
        self.inner.sessions.write().remove(id);
        Ok(())
    }

    pub async fn subscribe(&self, id: &str, filter: &str, qos: QoS) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let transport = self.connected_transport(&handle)?;
        if filter.is_empty() {
            return Err(SessionError::Validation("topic filter is empty".into()));
        }

        // recorded first so an early ack finds its entry
        let previous = {
            let mut record = handle.record.lock();
            let previous = record.subscriptions.insert(
                filter.to_string(),
                Subscription {
                    filter: filter.to_string(),
                    requested: qos,
                    granted: None,
                },
            );
            record.metrics.subscriptions = record.subscriptions.len() as u64;
            previous
        };

        let result = tokio::select! {
            _ = handle.token.cancelled() => Err(SessionError::Cancelled(id.to_string())),
            result = transport.subscribe(filter, qos) => result.map_err(SessionError::from),
        };
        if let Err(e) = result {
            {
                let mut record = handle.record.lock();
                match previous {
                    Some(previous) => record.subscriptions.insert(filter.to_string(), previous),
                    None => record.subscriptions.remove(filter),
                };
                record.metrics.subscriptions = record.subscriptions.len() as u64;
            }
            self.report_error(&handle, &e);
            return Err(e);
        }
        debug!(session = %id, filter, "subscribe requested");
        Ok(())
    }

    pub async fn unsubscribe(&self, id: &str, filter: &str) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let transport = self.connected_transport(&handle)?;

        let removed = {
            let mut record = handle.record.lock();
            let removed = record.subscriptions.remove(filter);
            record.metrics.subscriptions = record.subscriptions.len() as u64;
            removed
        };

        let result = tokio::select! {
            _ = handle.token.cancelled() => Err(SessionError::Cancelled(id.to_string())),
            result = transport.unsubscribe(filter) => result.map_err(SessionError::from),
        };
        if let Err(e) = result {
            if let Some(removed) = removed {
                let mut record = handle.record.lock();
                record.subscriptions.insert(filter.to_string(), removed);
                record.metrics.subscriptions = record.subscriptions.len() as u64;
            }
            self.report_error(&handle, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Single attempt; failures are counted and reported, never retried.
    pub async fn publish(
        &self,
        id: &str,
        topic: &str,
        payload: PublishPayload,
        options: PublishOptions,
    ) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let transport = self.connected_transport(&handle)?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(SessionError::Validation(format!("invalid publish topic '{topic}'")));
        }
        let bytes = payload.into_bytes()?;
        let size = bytes.len();

        let result = tokio::select! {
            _ = handle.token.cancelled() => Err(SessionError::Cancelled(id.to_string())),
            result = transport.publish(topic, options.qos, options.retain, bytes) => {
                result.map_err(SessionError::from)
            }
        };
        match result {
            Ok(()) => {
                {
                    let mut record = handle.record.lock();
                    record.metrics.messages_sent += 1;
                    record.metrics.bytes_sent += size as u64;
                    record.last_activity = Some(OffsetDateTime::now_utc());
                }
                self.inner.bus.publish(KernelEvent::PublishCompleted {
                    session_id: id.to_string(),
                    topic: topic.to_string(),
                    bytes: size,
                });
                Ok(())
            }
            Err(e) => {
                warn!(session = %id, topic, error = %e, "publish failed");
                self.report_error(&handle, &e);
                Err(e)
            }
        }
    }

    pub fn state(&self, id: &str) -> Result<SessionState, SessionError> {
        Ok(self.handle(id)?.record.lock().state)
    }

    pub fn snapshot(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        Ok(self.handle(id)?.snapshot())
    }

    /// All sessions, tombstones included, oldest first.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<_> = self.inner.sessions.read().values().cloned().collect();
        let mut snapshots: Vec<_> = handles.iter().map(|h| h.snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Newest `limit` buffered messages on `topic`, oldest first.
    pub fn messages(&self, id: &str, topic: &str, limit: usize) -> Result<Vec<Arc<Message>>, SessionError> {
        let handle = self.handle(id)?;
        let record = handle.record.lock();
        Ok(record
            .buffers
            .get(topic)
            .map(|buffer| buffer.latest(limit))
            .unwrap_or_default())
    }

    pub fn topics(&self, id: &str) -> Result<Vec<TopicStats>, SessionError> {
        let handle = self.handle(id)?;
        let record = handle.record.lock();
        let mut stats: Vec<_> = record
            .topics
            .iter()
            .map(|(topic, counter)| TopicStats {
                topic: topic.clone(),
                message_count: counter.count,
                bytes: counter.bytes,
                buffered: record.buffers.get(topic).map_or(0, |b| b.len()),
                last_kind: counter.last_kind,
                last_activity: counter.last_activity,
            })
            .collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(stats)
    }

    /// Live session on this endpoint, if any.
    pub fn find_active(&self, host: &str, port: u16) -> Option<SessionId> {
        self.inner
            .sessions
            .read()
            .values()
            .find(|h| {
                h.settings.host == host
                    && h.settings.port == port
                    && !h.record.lock().state.is_terminal()
            })
            .map(|h| h.id.clone())
    }

    pub fn count_by_state(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for handle in self.inner.sessions.read().values() {
            let state = handle.record.lock().state;
            *counts.entry(state.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Drops buffered messages older than `max_age` in every session, along
    /// with the stats of topics quiet for that long. Sessions closed for
    /// longer than `max_age` are forgotten.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let handles: Vec<_> = self.inner.sessions.read().values().cloned().collect();
        let mut expired = Vec::new();
        let mut removed = 0;
        for handle in &handles {
            let mut guard = handle.record.lock();
            let record = &mut *guard;
            if record.closed_at.is_some_and(|closed| closed < cutoff) {
                expired.push(handle.id.clone());
                continue;
            }
            removed += record.buffers.prune(|m| m.received_at >= cutoff);
            record.topics.retain(|_, counter| counter.last_activity >= cutoff);
        }
        if !expired.is_empty() {
            let mut sessions = self.inner.sessions.write();
            for id in &expired {
                sessions.remove(id);
            }
            info!(sessions = expired.len(), "expired closed sessions");
        }
        if removed > 0 {
            info!(removed, "pruned old buffered messages");
        }
        removed
    }

    pub fn spawn_retention_task(&self, every: Duration, max_age: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.prune_older_than(max_age);
            }
        })
    }

    pub fn tree_snapshot(&self) -> MetricTree {
        self.inner.tree.lock().snapshot()
    }

    pub fn tree_summary(&self) -> TreeSummary {
        self.inner.tree.lock().summary()
    }

    fn handle(&self, id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.inner
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn connected_transport(&self, handle: &SessionHandle) -> Result<Arc<dyn Transport>, SessionError> {
        let state = handle.record.lock().state;
        let not_connected = || SessionError::NotConnected {
            id: handle.id.clone(),
            state,
        };
        if state != SessionState::Connected {
            return Err(not_connected());
        }
        handle.transport.lock().clone().ok_or_else(not_connected)
    }

    fn report_error(&self, handle: &SessionHandle, error: &SessionError) {
        {
            let mut record = handle.record.lock();
            record.metrics.errors += 1;
            record.last_error = Some(error.to_string());
        }
        self.inner.bus.publish(KernelEvent::SessionError {
            session_id: handle.id.clone(),
            kind: error.kind(),
            reason: error.to_string(),
        });
    }

    /// Moves to Closed and emits SessionDisconnected at most once.
    fn close(&self, handle: &SessionHandle, reason: Option<String>) {
        {
            let mut record = handle.record.lock();
            record.state = SessionState::Closed;
            record.closed_at.get_or_insert_with(OffsetDateTime::now_utc);
            if reason.is_some() {
                record.last_error = reason.clone();
            }
            if record.disconnect_emitted {
                return;
            }
            record.disconnect_emitted = true;
        }
        handle.token.cancel();
        handle.worker.cancel();
        info!(session = %handle.id, reason = reason.as_deref().unwrap_or("requested"), "session closed");
        self.inner.bus.publish(KernelEvent::SessionDisconnected {
            session_id: handle.id.clone(),
            reason,
        });
    }

    async fn drive(self, handle: Arc<SessionHandle>) {
        let link = match self.inner.connector.open(&handle.id, &handle.settings) {
            Ok(link) => link,
            Err(e) => {
                let error = SessionError::from(e);
                self.report_error(&handle, &error);
                self.close(&handle, Some(error.to_string()));
                return;
            }
        };
        *handle.transport.lock() = Some(link.transport);
        let mut events = link.events;

        loop {
            let event = tokio::select! {
                _ = handle.worker.cancelled() => break,
                event = events.recv() => event,
            };
            if handle.record.lock().state == SessionState::Closing {
                match event {
                    Some(TransportEvent::Closed) | None => {
                        handle.flushed.notify_one();
                        break;
                    }
                    Some(_) => continue,
                }
            }
            match event {
                Some(event) => self.apply(&handle, event).await,
                None => {
                    if !handle.record.lock().state.is_terminal() {
                        self.close(&handle, Some("transport closed".into()));
                    }
                    break;
                }
            }
            if handle.record.lock().state == SessionState::Closed {
                break;
            }
        }
        debug!(session = %handle.id, "session worker finished");
    }

    async fn apply(&self, handle: &Arc<SessionHandle>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { session_present } => self.on_connected(handle, session_present).await,
            TransportEvent::ConnectFailed { reason } => {
                if handle.record.lock().state.is_terminal() {
                    return;
                }
                self.inner.bus.publish(KernelEvent::SessionError {
                    session_id: handle.id.clone(),
                    kind: ErrorKind::Transport,
                    reason: reason.clone(),
                });
                handle.record.lock().metrics.errors += 1;
                self.close(handle, Some(reason));
            }
            TransportEvent::Message(publish) => self.route(handle, publish),
            TransportEvent::SubscribeAck { filter, granted } => self.on_subscribe_ack(handle, filter, granted),
            TransportEvent::UnsubscribeAck { filter } => {
                self.inner.bus.publish(KernelEvent::Unsubscribed {
                    session_id: handle.id.clone(),
                    filter,
                });
            }
            TransportEvent::Dropped { reason, will_retry } => self.on_dropped(handle, reason, will_retry),
            TransportEvent::Closed => {
                if !handle.record.lock().state.is_terminal() {
                    self.close(handle, Some("closed by transport".into()));
                }
            }
        }
    }

    async fn on_connected(&self, handle: &Arc<SessionHandle>, session_present: bool) {
        let (first, previous) = {
            let mut record = handle.record.lock();
            if record.state.is_terminal() {
                return;
            }
            let first = !record.ever_connected;
            record.ever_connected = true;
            record.state = SessionState::Connected;
            record.connected_at = Some(OffsetDateTime::now_utc());
            let previous: Vec<_> = record
                .subscriptions
                .values()
                .map(|s| (s.filter.clone(), s.requested))
                .collect();
            (first, previous)
        };
        info!(session = %handle.id, session_present, "session connected");
        self.inner.bus.publish(KernelEvent::SessionConnected {
            session_id: handle.id.clone(),
            session_present,
        });

        if first {
            if handle.settings.auto_subscribe {
                if let Err(e) = self.subscribe(&handle.id, AUTO_SUBSCRIBE_FILTER, QoS::AtMostOnce).await {
                    warn!(session = %handle.id, error = %e, "auto-subscribe failed");
                }
            }
        } else if !session_present {
            let transport = handle.transport.lock().clone();
            if let Some(transport) = transport {
                for (filter, qos) in previous {
                    if let Err(e) = transport.subscribe(&filter, qos).await {
                        warn!(session = %handle.id, filter, error = %e, "resubscribe failed");
                    }
                }
            }
        }
    }

    fn on_subscribe_ack(&self, handle: &SessionHandle, filter: String, granted: Result<QoS, String>) {
        match granted {
            Ok(qos) => {
                if let Some(subscription) = handle.record.lock().subscriptions.get_mut(&filter) {
                    subscription.granted = Some(qos);
                }
                self.inner.bus.publish(KernelEvent::SubscriptionGranted {
                    session_id: handle.id.clone(),
                    filter,
                    qos: qos_level(qos),
                });
            }
            Err(reason) => {
                {
                    let mut record = handle.record.lock();
                    record.subscriptions.remove(&filter);
                    record.metrics.subscriptions = record.subscriptions.len() as u64;
                    record.metrics.errors += 1;
                }
                warn!(session = %handle.id, filter, %reason, "subscription refused");
                self.inner.bus.publish(KernelEvent::SubscriptionFailed {
                    session_id: handle.id.clone(),
                    filter,
                    reason,
                });
            }
        }
    }

    fn on_dropped(&self, handle: &SessionHandle, reason: String, will_retry: bool) {
        if !will_retry {
            if handle.record.lock().state.is_terminal() {
                return;
            }
            self.inner.bus.publish(KernelEvent::SessionError {
                session_id: handle.id.clone(),
                kind: ErrorKind::Transport,
                reason: reason.clone(),
            });
            handle.record.lock().metrics.errors += 1;
            self.close(handle, Some(reason));
            return;
        }

        let attempt = {
            let mut record = handle.record.lock();
            if record.state.is_terminal() {
                return;
            }
            record.state = SessionState::Reconnecting;
            record.metrics.reconnects += 1;
            record.last_error = Some(reason.clone());
            record.metrics.reconnects
        };
        info!(session = %handle.id, attempt, %reason, "session reconnecting");
        self.inner.bus.publish(KernelEvent::SessionReconnecting {
            session_id: handle.id.clone(),
            reason,
            attempt,
        });
    }

    fn route(&self, handle: &SessionHandle, publish: InboundPublish) {
        let now = OffsetDateTime::now_utc();
        let addressed = self.inner.parser.parse(&publish.topic);
        let decoded = addressed.as_ref().map(|_| sparkplug::decode(&publish.payload));
        let schema = match &decoded {
            None => SchemaOutcome::NotAddressed,
            Some(Ok(_)) => SchemaOutcome::Decoded,
            Some(Err(_)) => SchemaOutcome::Failed,
        };
        let kind = classify(&publish.topic, &publish.payload, schema);
        let (sparkplug, decode_error) = match decoded {
            Some(Ok(payload)) => (Some(payload), None),
            Some(Err(e)) => {
                debug!(session = %handle.id, topic = %publish.topic, error = %e, "payload did not decode");
                (None, Some(e.to_string()))
            }
            None => (None, None),
        };

        let message = Arc::new(Message {
            size: publish.payload.len(),
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            received_at: now,
            kind,
            sparkplug,
            decode_error,
        });

        {
            let mut guard = handle.record.lock();
            let record = &mut *guard;
            let pushed = record.buffers.push(&message.topic, message.clone());
            if pushed.evicted.is_some() {
                record.metrics.evicted += 1;
            }
            if let Some(dropped) = pushed.dropped_topic {
                record.topics.remove(&dropped);
                record.metrics.dropped_topics += 1;
                debug!(session = %handle.id, topic = %dropped, "topic limit reached, dropped least recent topic");
            }
            record.metrics.messages_received += 1;
            record.metrics.bytes_received += message.size as u64;
            if message.decode_error.is_some() {
                record.metrics.decode_errors += 1;
            }
            record.last_activity = Some(now);
            let counter = record
                .topics
                .entry(message.topic.clone())
                .or_insert_with(|| TopicCounter {
                    count: 0,
                    bytes: 0,
                    last_kind: kind,
                    last_activity: now,
                });
            counter.count += 1;
            counter.bytes += message.size as u64;
            counter.last_kind = kind;
            counter.last_activity = now;
        }

        let update = match (&addressed, &message.sparkplug) {
            (Some(topic), Some(payload)) => Some(self.inner.tree.lock().apply(topic, payload, now)),
            _ => None,
        };

        self.inner.bus.publish(KernelEvent::MessageReceived {
            session_id: handle.id.clone(),
            message: message.summary(),
        });
        if let Some(update) = update {
            self.inner.bus.publish(KernelEvent::TopicTreeUpdated {
                session_id: handle.id.clone(),
                update,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::sparkplug::{DataType, Metric, MetricValue};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::{broadcast, mpsc};

    #[derive(Default)]
    struct RecordingTransport {
        subscriptions: Mutex<Vec<String>>,
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail_publish: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), TransportError> {
            self.subscriptions.lock().push(filter.to_string());
            Ok(())
        }
        async fn unsubscribe(&self, _filter: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn publish(&self, topic: &str, _qos: QoS, _retain: bool, payload: Vec<u8>) -> Result<(), TransportError> {
            if *self.fail_publish.lock() {
                return Err(TransportError::Request("broker gone".into()));
            }
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        transport: Arc<RecordingTransport>,
        links: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    }

    impl Connector for ScriptedConnector {
        fn open(&self, _session_id: &str, _settings: &SessionSettings) -> Result<TransportLink, TransportError> {
            let (tx, rx) = mpsc::channel(64);
            self.links.lock().push(tx);
            Ok(TransportLink {
                transport: self.transport.clone(),
                events: rx,
            })
        }
    }

    struct Fixture {
        manager: SessionManager,
        connector: Arc<ScriptedConnector>,
        rx: broadcast::Receiver<KernelEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = EventBus::new(256);
            let rx = bus.subscribe();
            let connector = Arc::new(ScriptedConnector::default());
            let manager = SessionManager::with_tree(bus, connector.clone(), TopicParser::new(["spBv1.0", "ns"]), 10);
            Self { manager, connector, rx }
        }

        async fn link(&self) -> mpsc::Sender<TransportEvent> {
            for _ in 0..100 {
                if let Some(tx) = self.connector.links.lock().last().cloned() {
                    return tx;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("connector never opened");
        }

        async fn wait_for<F: FnMut(&KernelEvent) -> bool>(&mut self, mut pred: F) -> KernelEvent {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let event = self.rx.recv().await.unwrap();
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("event not received")
        }

        async fn connected_session(&mut self, config: SessionConfig) -> (SessionId, mpsc::Sender<TransportEvent>) {
            let id = self.manager.connect(config).unwrap();
            let link = self.link().await;
            link.send(TransportEvent::Connected { session_present: false }).await.unwrap();
            self.wait_for(|e| matches!(e, KernelEvent::SessionConnected { .. })).await;
            (id, link)
        }
    }

    fn inbound(topic: &str, payload: Vec<u8>) -> TransportEvent {
        TransportEvent::Message(InboundPublish {
            topic: topic.into(),
            payload: Bytes::from(payload),
            qos: QoS::AtMostOnce,
            retain: false,
        })
    }

    #[tokio::test]
    async fn test_connect_validates_synchronously() {
        let fixture = Fixture::new();
        let err = fixture.manager.connect(SessionConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(fixture.manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_commands_require_connected_state() {
        let fixture = Fixture::new();
        let id = fixture.manager.connect(SessionConfig::new("broker", 1883)).unwrap();
        let err = fixture.manager.subscribe(&id, "a/b", QoS::AtMostOnce).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected { state: SessionState::Connecting, .. }));
        assert!(matches!(
            fixture.manager.publish("missing", "a", PublishPayload::Text("x".into()), PublishOptions::default()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_first_connect_auto_subscribes() {
        let mut fixture = Fixture::new();
        let (id, link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;
        link.send(TransportEvent::SubscribeAck {
            filter: "#".into(),
            granted: Ok(QoS::AtMostOnce),
        })
        .await
        .unwrap();
        fixture.wait_for(|e| matches!(e, KernelEvent::SubscriptionGranted { .. })).await;

        assert_eq!(fixture.connector.transport.subscriptions.lock().clone(), vec!["#".to_string()]);
        let snapshot = fixture.manager.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert_eq!(snapshot.subscriptions[0].granted, Some(QoS::AtMostOnce));
        assert_eq!(snapshot.metrics.subscriptions, 1);
    }

    #[tokio::test]
    async fn test_inbound_routing_buffers_and_builds_tree() {
        let mut fixture = Fixture::new();
        let config = SessionConfig {
            buffer_capacity: 3,
            auto_subscribe: false,
            ..SessionConfig::new("broker", 1883)
        };
        let (id, link) = fixture.connected_session(config).await;

        for n in 0..5 {
            link.send(inbound("plant/sensor/temp", format!("{n}").into_bytes())).await.unwrap();
        }
        let payload = Payload {
            metrics: vec![Metric::new("Temp", DataType::Double, MetricValue::Double(21.5))],
            ..Payload::default()
        };
        link.send(inbound("ns/G1/DDATA/Edge1/Dev1", sparkplug::encode(&payload))).await.unwrap();
        link.send(inbound("spBv1.0/G1/NDATA/Edge1", vec![0xff, 0xff])).await.unwrap();
        fixture.wait_for(|e| matches!(e, KernelEvent::TopicTreeUpdated { .. })).await;
        fixture
            .wait_for(|e| matches!(e, KernelEvent::MessageReceived { message, .. } if message.topic.starts_with("spBv1.0")))
            .await;

        let kept: Vec<_> = fixture
            .manager
            .messages(&id, "plant/sensor/temp", 10)
            .unwrap()
            .iter()
            .map(|m| m.payload_text().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kept, vec!["2", "3", "4"]);

        let metrics = fixture.manager.snapshot(&id).unwrap().metrics;
        assert_eq!(metrics.messages_received, 7);
        assert_eq!(metrics.evicted, 2);
        assert_eq!(metrics.decode_errors, 1);

        let bad = fixture.manager.messages(&id, "spBv1.0/G1/NDATA/Edge1", 1).unwrap();
        assert_eq!(bad[0].kind, MessageKind::Undecodable);
        assert!(bad[0].decode_error.is_some());

        let tree = fixture.manager.tree_snapshot();
        assert_eq!(tree.device("G1", "Edge1", "Dev1").unwrap().message_count, 1);
        assert_eq!(fixture.manager.tree_summary().devices, 1);

        let topics = fixture.manager.topics(&id).unwrap();
        let sensor = topics.iter().find(|t| t.topic == "plant/sensor/temp").unwrap();
        assert_eq!((sensor.message_count, sensor.buffered), (5, 3));
        assert_eq!(sensor.last_kind, MessageKind::Json);
    }

    #[tokio::test]
    async fn test_publish_success_and_failure() {
        let mut fixture = Fixture::new();
        let (id, _link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;

        fixture
            .manager
            .publish(&id, "cmd/a", PublishPayload::Structured(serde_json::json!({"on": true})), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            fixture.connector.transport.published.lock()[0],
            ("cmd/a".to_string(), br#"{"on":true}"#.to_vec())
        );

        *fixture.connector.transport.fail_publish.lock() = true;
        let err = fixture
            .manager
            .publish(&id, "cmd/a", PublishPayload::Text("x".into()), PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        fixture
            .wait_for(|e| matches!(e, KernelEvent::SessionError { kind: ErrorKind::Transport, .. }))
            .await;

        let metrics = fixture.manager.snapshot(&id).unwrap().metrics;
        assert_eq!(metrics.messages_sent, 1);
        assert_eq!(metrics.errors, 1);
        assert_eq!(fixture.connector.transport.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut fixture = Fixture::new();
        let (id, _link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;

        fixture.manager.disconnect(&id).await.unwrap();
        fixture.manager.disconnect(&id).await.unwrap();
        assert_eq!(fixture.manager.state(&id).unwrap(), SessionState::Closed);

        fixture.wait_for(|e| matches!(e, KernelEvent::SessionDisconnected { .. })).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = fixture.rx.try_recv() {
            assert!(!matches!(event, KernelEvent::SessionDisconnected { .. }), "duplicate disconnect event");
        }

        fixture.manager.forget(&id).await.unwrap();
        assert!(matches!(fixture.manager.state(&id), Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_drains_until_transport_closes() {
        let mut fixture = Fixture::new();
        let (id, link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;

        let manager = fixture.manager.clone();
        let closing_id = id.clone();
        let disconnect = tokio::spawn(async move { manager.disconnect(&closing_id).await });
        for _ in 0..100 {
            if fixture.manager.state(&id).unwrap() == SessionState::Closing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fixture.manager.state(&id).unwrap(), SessionState::Closing);

        // the worker still listens, so the transport can flush DISCONNECT
        link.send(inbound("late/topic", b"late".to_vec())).await.unwrap();
        link.send(TransportEvent::Closed).await.unwrap();
        tokio::time::timeout(Duration::from_millis(500), disconnect)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(fixture.manager.state(&id).unwrap(), SessionState::Closed);
        assert!(fixture.manager.messages(&id, "late/topic", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_and_reconnect_resubscribes() {
        let mut fixture = Fixture::new();
        let (id, link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;
        fixture.manager.subscribe(&id, "plant/#", QoS::AtLeastOnce).await.unwrap();

        link.send(TransportEvent::Dropped {
            reason: "io error".into(),
            will_retry: true,
        })
        .await
        .unwrap();
        fixture.wait_for(|e| matches!(e, KernelEvent::SessionReconnecting { .. })).await;
        assert_eq!(fixture.manager.state(&id).unwrap(), SessionState::Reconnecting);

        link.send(TransportEvent::Connected { session_present: false }).await.unwrap();
        fixture.wait_for(|e| matches!(e, KernelEvent::SessionConnected { .. })).await;

        let subscribed = fixture.connector.transport.subscriptions.lock().clone();
        assert_eq!(subscribed.iter().filter(|f| f.as_str() == "plant/#").count(), 2);
        assert_eq!(fixture.manager.snapshot(&id).unwrap().metrics.reconnects, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_session() {
        let mut fixture = Fixture::new();
        let id = fixture.manager.connect(SessionConfig::new("broker", 1883)).unwrap();
        let link = fixture.link().await;
        link.send(TransportEvent::ConnectFailed {
            reason: "connection refused".into(),
        })
        .await
        .unwrap();
        fixture.wait_for(|e| matches!(e, KernelEvent::SessionDisconnected { .. })).await;
        let snapshot = fixture.manager.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, SessionState::Closed);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));
        assert!(fixture.manager.find_active("broker", 1883).is_none());
    }

    #[tokio::test]
    async fn test_prune_drops_old_messages() {
        let mut fixture = Fixture::new();
        let (id, link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;
        link.send(inbound("a/b", b"1".to_vec())).await.unwrap();
        fixture.wait_for(|e| matches!(e, KernelEvent::MessageReceived { .. })).await;

        assert_eq!(fixture.manager.prune_older_than(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fixture.manager.prune_older_than(Duration::from_millis(1)), 1);
        assert!(fixture.manager.messages(&id, "a/b", 10).unwrap().is_empty());
        assert!(fixture.manager.topics(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topic_limit_drops_quietest_topic() {
        let mut fixture = Fixture::new();
        let config = SessionConfig {
            max_topics: 2,
            auto_subscribe: false,
            ..SessionConfig::new("broker", 1883)
        };
        let (id, link) = fixture.connected_session(config).await;

        for topic in ["line/1", "line/2", "line/1", "line/3"] {
            link.send(inbound(topic, b"x".to_vec())).await.unwrap();
        }
        fixture
            .wait_for(|e| matches!(e, KernelEvent::MessageReceived { message, .. } if message.topic == "line/3"))
            .await;

        let snapshot = fixture.manager.snapshot(&id).unwrap();
        assert_eq!(snapshot.topic_count, 2);
        assert_eq!(snapshot.metrics.dropped_topics, 1);
        assert!(fixture.manager.messages(&id, "line/2", 10).unwrap().is_empty());
        let topics: Vec<_> = fixture.manager.topics(&id).unwrap().into_iter().map(|t| t.topic).collect();
        assert_eq!(topics, vec!["line/1", "line/3"]);
    }

    #[tokio::test]
    async fn test_retention_expires_closed_sessions() {
        let mut fixture = Fixture::new();
        let (closed, _link) = fixture.connected_session(SessionConfig::new("broker", 1883)).await;
        let (live, _live_link) = fixture.connected_session(SessionConfig::new("other", 1883)).await;
        fixture.manager.disconnect(&closed).await.unwrap();

        fixture.manager.prune_older_than(Duration::from_secs(3600));
        assert_eq!(fixture.manager.state(&closed).unwrap(), SessionState::Closed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        fixture.manager.prune_older_than(Duration::from_millis(1));
        assert!(matches!(fixture.manager.state(&closed), Err(SessionError::NotFound(_))));
        assert_eq!(fixture.manager.state(&live).unwrap(), SessionState::Connected);
    }
}
