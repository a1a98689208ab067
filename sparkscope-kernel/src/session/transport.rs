//! Seam between the session manager and an MQTT client implementation.
//!
//! A [`Connector`] opens one [`TransportLink`] per session: a command handle plus
//! the ordered stream of [`TransportEvent`]s the session worker consumes.
//! Reconnect backoff belongs to the transport; the manager only reacts to
//! `Dropped { will_retry }`.

use super::model::SessionSettings;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { session_present: bool },
    /// The first connection attempt failed or timed out.
    ConnectFailed { reason: String },
    Message(InboundPublish),
    SubscribeAck { filter: String, granted: Result<QoS, String> },
    UnsubscribeAck { filter: String },
    Dropped { reason: String, will_retry: bool },
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

pub struct TransportLink {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub trait Connector: Send + Sync {
    /// Starts connecting in the background; progress arrives as events.
    fn open(&self, session_id: &str, settings: &SessionSettings) -> Result<TransportLink, TransportError>;
}
