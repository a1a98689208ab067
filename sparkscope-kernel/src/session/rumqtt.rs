/**
 * RUMQTT - rumqttc-backed Connector
 *
 * ROLE: one AsyncClient + EventLoop per session, translated into TransportEvents.
 *
 * HOW: a driver task polls the event loop. The first CONNACK is awaited under
 * connect_timeout; afterwards any loop error is reported as Dropped and, when
 * reconnect is on, the driver sleeps reconnect_period and polls again (which
 * makes rumqttc reconnect). Subscribe/unsubscribe acks are matched back to
 * their filters through the packet ids seen on the outgoing side. Once a
 * disconnect is requested the driver never stops before DISCONNECT is on the
 * wire, bounded by FLUSH_TIMEOUT.
 */

use super::model::SessionSettings;
use super::transport::{Connector, InboundPublish, Transport, TransportEvent, TransportLink};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport as MqttTransport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    fn open(&self, session_id: &str, settings: &SessionSettings) -> Result<TransportLink, TransportError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(settings.clean_session);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(credentials) = &settings.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }
        if settings.use_tls {
            options.set_transport(MqttTransport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let pending = Arc::new(Mutex::new(PendingAcks::default()));
        let closing = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            session_id: session_id.to_string(),
            events: tx,
            pending: pending.clone(),
            closing: closing.clone(),
            connect_timeout: settings.connect_timeout,
            reconnect: settings.reconnect,
            reconnect_period: settings.reconnect_period,
        };
        let handle = tokio::spawn(driver.run(eventloop));
        info!(session = session_id, host = %settings.host, port = settings.port, tls = settings.use_tls, "MQTT transport opened");

        Ok(TransportLink {
            transport: Arc::new(RumqttTransport {
                client,
                pending,
                closing,
                driver: handle.abort_handle(),
            }),
            events: rx,
        })
    }
}

/// Filters waiting for their packet id, then for their ack.
#[derive(Debug, Default)]
struct PendingAcks {
    subscribe_queue: VecDeque<String>,
    unsubscribe_queue: VecDeque<String>,
    subscribes: HashMap<u16, String>,
    unsubscribes: HashMap<u16, String>,
}

impl PendingAcks {
    /// Drops filters whose packet went out on a dead connection. Queued
    /// filters stay: rumqttc replays their requests after reconnecting and
    /// they get fresh packet ids then.
    fn forget_in_flight(&mut self) {
        self.subscribes.clear();
        self.unsubscribes.clear();
    }
}

pub struct RumqttTransport {
    client: AsyncClient,
    pending: Arc<Mutex<PendingAcks>>,
    closing: Arc<AtomicBool>,
    driver: AbortHandle,
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        // queue order must match request order
        let mut pending = self.pending.lock();
        pending.subscribe_queue.push_back(filter.to_string());
        if let Err(e) = self.client.try_subscribe(filter, qos) {
            pending.subscribe_queue.pop_back();
            return Err(TransportError::Request(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut pending = self.pending.lock();
        pending.unsubscribe_queue.push_back(filter.to_string());
        if let Err(e) = self.client.try_unsubscribe(filter) {
            pending.unsubscribe_queue.pop_back();
            return Err(TransportError::Request(e.to_string()));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

struct Driver {
    session_id: String,
    events: mpsc::Sender<TransportEvent>,
    pending: Arc<Mutex<PendingAcks>>,
    closing: Arc<AtomicBool>,
    connect_timeout: Duration,
    reconnect: bool,
    reconnect_period: Duration,
}

impl Driver {
    async fn run(self, mut eventloop: EventLoop) {
        let first = tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await;
        let connected = match first {
            Ok(Ok(session_present)) => TransportEvent::Connected { session_present },
            Ok(Err(e)) => {
                warn!(session = %self.session_id, error = %e, "initial connect failed");
                self.emit(TransportEvent::ConnectFailed { reason: e.to_string() }).await;
                return;
            }
            Err(_) => {
                let reason = TransportError::Timeout(self.connect_timeout).to_string();
                warn!(session = %self.session_id, %reason, "initial connect timed out");
                self.emit(TransportEvent::ConnectFailed { reason }).await;
                return;
            }
        };
        if !self.emit(connected).await {
            self.flush_disconnect(&mut eventloop).await;
            return;
        }

        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    if self.closing.load(Ordering::SeqCst) {
                        self.emit(TransportEvent::Closed).await;
                        return;
                    }
                    self.pending.lock().forget_in_flight();
                    warn!(session = %self.session_id, error = %e, retry = self.reconnect, "MQTT connection dropped");
                    let dropped = TransportEvent::Dropped {
                        reason: e.to_string(),
                        will_retry: self.reconnect,
                    };
                    if !self.emit(dropped).await || !self.reconnect {
                        return;
                    }
                    tokio::time::sleep(self.reconnect_period).await;
                    continue;
                }
            };

            let translated = match event {
                Event::Incoming(Packet::ConnAck(ack)) => Some(TransportEvent::Connected {
                    session_present: ack.session_present,
                }),
                Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message(InboundPublish {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                })),
                Event::Incoming(Packet::SubAck(ack)) => {
                    let filter = self.pending.lock().subscribes.remove(&ack.pkid);
                    filter.map(|filter| {
                        let granted = match ack.return_codes.first() {
                            Some(SubscribeReasonCode::Success(qos)) => Ok(*qos),
                            _ => Err("subscription rejected by broker".to_string()),
                        };
                        TransportEvent::SubscribeAck { filter, granted }
                    })
                }
                Event::Incoming(Packet::UnsubAck(ack)) => {
                    let filter = self.pending.lock().unsubscribes.remove(&ack.pkid);
                    filter.map(|filter| TransportEvent::UnsubscribeAck { filter })
                }
                Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                    let mut pending = self.pending.lock();
                    if let Some(filter) = pending.subscribe_queue.pop_front() {
                        pending.subscribes.insert(pkid, filter);
                    }
                    None
                }
                Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                    let mut pending = self.pending.lock();
                    if let Some(filter) = pending.unsubscribe_queue.pop_front() {
                        pending.unsubscribes.insert(pkid, filter);
                    }
                    None
                }
                Event::Outgoing(Outgoing::Disconnect) => {
                    debug!(session = %self.session_id, "DISCONNECT sent");
                    self.emit(TransportEvent::Closed).await;
                    return;
                }
                _ => None,
            };

            if let Some(event) = translated {
                if !self.emit(event).await {
                    self.flush_disconnect(&mut eventloop).await;
                    return;
                }
            }
        }
    }

    /// Keeps the event loop turning until a requested DISCONNECT is flushed.
    async fn flush_disconnect(&self, eventloop: &mut EventLoop) {
        if !self.closing.load(Ordering::SeqCst) {
            return;
        }
        let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;
        if !matches!(flushed, Ok(true)) {
            debug!(session = %self.session_id, "DISCONNECT not flushed before the driver stopped");
        }
    }

    /// False once the session side has gone away.
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            return Ok(ack.session_present);
        }
    }
}
