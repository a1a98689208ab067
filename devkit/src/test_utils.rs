/*!
Test harness for kernel scenarios.

Bundles an event bus, a session manager on a `MockConnector` and a bus
receiver, with helpers that wait for specific kernel events. `FakeBroker`
answers the MQTT handshake on a local port for discovery and probe tests.
*/

use crate::mock_transport::{MockConnector, MockTransport};
use anyhow::Result;
use sparkscope_kernel::{EventBus, KernelEvent, SessionConfig, SessionManager, TopicParser};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const DEFAULT_WAIT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub bus: EventBus,
    pub manager: SessionManager,
    pub connector: MockConnector,
    events: broadcast::Receiver<KernelEvent>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_connector(MockConnector::new())
    }

    pub fn with_connector(connector: MockConnector) -> Self {
        env_logger::try_init().ok();

        let bus = EventBus::new(1024);
        let events = bus.subscribe();
        let manager = SessionManager::with_tree(
            bus.clone(),
            Arc::new(connector.clone()),
            TopicParser::new(["spBv1.0", "ns"]),
            100,
        );
        Self {
            bus,
            manager,
            connector,
            events,
        }
    }

    /// Receives events until `pred` matches, skipping the rest.
    pub async fn wait_for_event<F>(&mut self, mut pred: F) -> Result<KernelEvent>
    where
        F: FnMut(&KernelEvent) -> bool,
    {
        let events = &mut self.events;
        let found = timeout(DEFAULT_WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return Ok(event),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => log::warn!("harness lagged by {missed} events"),
                    Err(RecvError::Closed) => anyhow::bail!("event bus closed"),
                }
            }
        })
        .await;
        match found {
            Ok(result) => result,
            Err(_) => anyhow::bail!("timed out waiting for kernel event"),
        }
    }

    /// Opens a session and completes its handshake.
    pub async fn connected_session(&mut self, config: SessionConfig) -> Result<(String, Arc<MockTransport>)> {
        let id = self.manager.connect(config)?;
        let transport = self.connector.wait_for_transport(&id).await?;
        transport.connect(false).await?;
        let expected = id.clone();
        self.wait_for_event(|e| matches!(e, KernelEvent::SessionConnected { session_id, .. } if *session_id == expected))
            .await?;
        Ok((id, transport))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Local TCP listener that answers every CONNECT with a fixed CONNACK code.
pub struct FakeBroker {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(ack_code: u8) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut frame = [0u8; 128];
                    if socket.read(&mut frame).await.is_ok() {
                        socket.write_all(&[0x20, 0x02, 0x00, ack_code]).await.ok();
                        // Drain the DISCONNECT so the client sees a clean close.
                        socket.read(&mut frame).await.ok();
                    }
                });
            }
        });
        Ok(Self { port, accepted, task })
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
