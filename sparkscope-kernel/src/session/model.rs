//! Session configuration, lifecycle state and the records kept per session.

use super::classify::MessageKind;
use crate::error::SessionError;
use crate::sparkplug::{Payload, PayloadSummary};
use bytes::Bytes;
use rumqttc::QoS;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;
pub const DEFAULT_MAX_TOPICS: usize = 10_000;
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub name: Option<String>,
    pub host: String,
    /// Wider than u16 so out-of-range values reach validation.
    pub port: Option<u32>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// `None` picks TLS for port 8883.
    pub use_tls: Option<bool>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub clean_session: bool,
    pub reconnect: bool,
    pub reconnect_period_ms: u64,
    pub buffer_capacity: usize,
    /// Topics buffered at once; the least recently updated one makes room.
    pub max_topics: usize,
    pub auto_subscribe: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: String::new(),
            port: None,
            client_id: None,
            username: None,
            password: None,
            use_tls: None,
            keep_alive_secs: 60,
            connect_timeout_ms: 30_000,
            clean_session: true,
            reconnect: true,
            reconnect_period_ms: 5000,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_topics: DEFAULT_MAX_TOPICS,
            auto_subscribe: true,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(u32::from(port)),
            ..Self::default()
        }
    }

    /// Same config with the password removed.
    pub fn redacted(&self) -> Self {
        Self {
            password: None,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<SessionSettings, SessionError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(SessionError::Validation("host is empty".into()));
        }
        let port = match self.port {
            None => return Err(SessionError::Validation("port is missing".into())),
            Some(port) => u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| SessionError::Validation(format!("port {port} is outside 1..=65535")))?,
        };
        if self.buffer_capacity == 0 {
            return Err(SessionError::Validation("buffer capacity must be positive".into()));
        }
        if self.max_topics == 0 {
            return Err(SessionError::Validation("topic limit must be positive".into()));
        }

        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(default_client_id);
        let credentials = self.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        });

        Ok(SessionSettings {
            name: self.name.clone(),
            host: host.to_string(),
            port,
            client_id,
            credentials,
            use_tls: self.use_tls.unwrap_or(port == 8883),
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(5)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            clean_session: self.clean_session,
            reconnect: self.reconnect,
            reconnect_period: Duration::from_millis(self.reconnect_period_ms),
            buffer_capacity: self.buffer_capacity,
            max_topics: self.max_topics,
            auto_subscribe: self.auto_subscribe,
        })
    }
}

/// `MQTTExplore_<unix-ms>_<8 hex>`
pub fn default_client_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("MQTTExplore_{millis}_{}", &suffix[..8])
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Validated connection parameters handed to a `Connector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub use_tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub clean_session: bool,
    pub reconnect: bool,
    pub reconnect_period: Duration,
    pub buffer_capacity: usize,
    pub max_topics: usize,
    pub auto_subscribe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub subscriptions: u64,
    pub errors: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
    /// Messages dropped from full topic buffers.
    pub evicted: u64,
    /// Whole topics dropped by the topic limit.
    pub dropped_topics: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub filter: String,
    #[serde(serialize_with = "serialize_qos")]
    pub requested: QoS,
    /// Set once the broker acknowledges.
    #[serde(serialize_with = "serialize_opt_qos")]
    pub granted: Option<QoS>,
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

fn serialize_qos<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(qos_level(*qos))
}

fn serialize_opt_qos<S: Serializer>(qos: &Option<QoS>, serializer: S) -> Result<S::Ok, S::Error> {
    match qos {
        Some(qos) => serializer.serialize_some(&qos_level(*qos)),
        None => serializer.serialize_none(),
    }
}

/// An inbound publish as buffered by a session. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub topic: String,
    #[serde(skip)]
    pub payload: Bytes,
    #[serde(serialize_with = "serialize_qos")]
    pub qos: QoS,
    pub retain: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub size: usize,
    pub kind: MessageKind,
    pub sparkplug: Option<Payload>,
    pub decode_error: Option<String>,
}

impl Message {
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn summary(&self) -> MessageSummary {
        let preview = match (&self.sparkplug, self.payload_text()) {
            (Some(_), _) | (None, None) => format!("<{} bytes>", self.size),
            (None, Some(text)) => text.chars().take(PREVIEW_CHARS).collect(),
        };
        MessageSummary {
            topic: self.topic.clone(),
            qos: qos_level(self.qos),
            retain: self.retain,
            size: self.size,
            kind: self.kind,
            received_at: self.received_at,
            preview,
            sparkplug: self.sparkplug.as_ref().map(PayloadSummary::of),
            decode_error: self.decode_error.clone(),
        }
    }
}

/// Event-sized view of a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSummary {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub size: usize,
    pub kind: MessageKind,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub preview: String,
    pub sparkplug: Option<PayloadSummary>,
    pub decode_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub message_count: u64,
    pub bytes: u64,
    pub buffered: usize,
    pub last_kind: MessageKind,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub use_tls: bool,
    pub state: SessionState,
    pub config: SessionConfig,
    pub subscriptions: Vec<Subscription>,
    pub metrics: SessionMetrics,
    pub topic_count: usize,
    pub buffered_messages: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub connected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activity: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}
