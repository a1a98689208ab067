/**
 * SPARKSCOPE KERNEL - entry point
 *
 * ROLE: loads config, starts broker discovery, auto-connects sessions to the
 * brokers it finds and reports health until ctrl-c.
 *
 * HOW: every component talks through one EventBus; this binary only wires
 * them and mirrors the bus into the debug log.
 */

use anyhow::Context;
use sparkscope_kernel::bridge::spawn_discovery_bridge;
use sparkscope_kernel::config::load_config;
use sparkscope_kernel::health::HealthTracker;
use sparkscope_kernel::session::RumqttConnector;
use sparkscope_kernel::{DiscoveryEngine, EventBus, KernelEvent, SessionManager, TopicParser};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sparkscope_kernel=info")),
        )
        .init();

    let config = load_config().await;
    let bus = EventBus::new(config.event_capacity);
    let events_log = spawn_event_log(&bus);

    let engine = DiscoveryEngine::new(bus.clone());
    let manager = SessionManager::with_tree(
        bus.clone(),
        Arc::new(RumqttConnector),
        TopicParser::new(config.sparkplug.namespaces.iter().cloned()),
        config.sparkplug.history_capacity,
    );

    let bridge = spawn_discovery_bridge(&bus, manager.clone(), config.sessions.clone(), config.bridge.clone());
    let retention = manager.spawn_retention_task(
        Duration::from_secs(config.retention.interval_secs.max(1)),
        Duration::from_secs(config.retention.max_age_secs),
    );
    let health = HealthTracker::new(engine.clone(), manager.clone(), bus.clone())
        .spawn_health_reporter(Duration::from_secs(config.health.interval_secs.max(1)));

    engine
        .start(config.discovery.clone())
        .context("failed to start broker discovery")?;
    info!("sparkscope kernel running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");

    engine.stop();
    for session in manager.sessions() {
        if let Err(e) = manager.disconnect(&session.id).await {
            warn!(session = %session.id, error = %e, "disconnect failed");
        }
    }
    for task in [bridge, retention, health, events_log] {
        task.abort();
    }
    Ok(())
}

fn spawn_event_log(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(KernelEvent::MessageReceived { .. }) => {}
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(target: "sparkscope_kernel::events", "{json}"),
                    Err(e) => warn!(error = %e, "event not serializable"),
                },
                Err(RecvError::Lagged(missed)) => debug!(missed, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
