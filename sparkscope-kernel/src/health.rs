/**
 * HEALTH - Kernel health snapshot and periodic reporter
 *
 * ROLE: one view over discovery progress, session states and the metric tree,
 * plus process uptime and resident memory.
 *
 * HOW: the reporter ticks on an interval, logs a one-line summary and publishes
 * the full snapshot as a HealthReport event.
 */

use crate::discovery::{DiscoveryEngine, DiscoveryStatus};
use crate::events::{EventBus, KernelEvent};
use crate::session::SessionManager;
use crate::tree::TreeSummary;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub discovery: DiscoveryStatus,
    /// Session count per state name.
    pub sessions: BTreeMap<String, usize>,
    pub tree: TreeSummary,
    pub unheard_events: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    discovery: DiscoveryEngine,
    sessions: SessionManager,
    bus: EventBus,
}

impl HealthTracker {
    pub fn new(discovery: DiscoveryEngine, sessions: SessionManager, bus: EventBus) -> Self {
        Self {
            start_time: Instant::now(),
            discovery,
            sessions,
            bus,
        }
    }

    pub fn get_health(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            discovery: self.discovery.status(),
            sessions: self.sessions.count_by_state(),
            tree: self.sessions.tree_summary(),
            unheard_events: self.bus.unheard_count(),
        }
    }

    pub fn spawn_health_reporter(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = tracker.get_health();
                info!(
                    uptime = health.uptime_seconds,
                    memory_mb = health.memory_usage_mb,
                    brokers = health.discovery.brokers_found,
                    sessions = ?health.sessions,
                    devices = health.tree.devices,
                    "kernel health"
                );
                tracker.bus.publish(KernelEvent::HealthReport { health });
            }
        })
    }
}

/// Resident set size from /proc; 0 where unavailable.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Connector, SessionSettings, TransportLink};
    use crate::error::TransportError;
    use std::sync::Arc;

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn open(&self, _id: &str, _settings: &SessionSettings) -> Result<TransportLink, TransportError> {
            Err(TransportError::Connect("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_reporter_publishes_snapshot() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let tracker = HealthTracker::new(
            DiscoveryEngine::new(bus.clone()),
            SessionManager::new(bus.clone(), Arc::new(RefusingConnector)),
            bus.clone(),
        );
        let reporter = tracker.spawn_health_reporter(Duration::from_millis(20));

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            KernelEvent::HealthReport { health } => {
                assert_eq!(health.tree.groups, 0);
                assert!(health.sessions.is_empty());
                assert_eq!(health.discovery.brokers_found, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        reporter.abort();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_usage_is_read() {
        assert!(get_memory_usage_mb() > 0.0);
    }
}
