/**
 * DISCOVERY - Broker discovery engine
 *
 * ROLE: finds MQTT brokers through passive announcements, a bounded port sweep
 * and the handshake probe, and keeps them in one deduplicated registry.
 *
 * HOW: `start` spawns one run owning a CancellationToken. The passive listener
 * and the sweep loop share that run and finish independently; `stop` cancels
 * them. Per-address failures only ever move counters.
 *
 * STATE: Idle -> Scanning -> Idle
 */

mod announce;
mod range;
mod registry;
mod services;

pub use announce::{AnnouncementSource, ChannelAnnouncements, ServiceAnnouncement, MQTT_SERVICE_TYPES};
pub use range::{fallback_range, local_subnet, AddressRange};
pub use registry::{BrokerDescriptor, BrokerObservation, BrokerRegistry, DiscoveryMethod, Observed};
pub use services::{identify_service, is_mqtt_port, is_secure_port};

use crate::error::DiscoveryError;
use crate::events::{EventBus, KernelEvent};
use crate::probe::{HandshakeProbe, ProbeAttempt};
use crate::state::{new_state, Shared};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_PORTS: [u16; 7] = [1883, 8883, 1884, 8884, 1888, 8888, 9001];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    /// CIDR block or single host. `None` scans the local /24.
    pub network_range: Option<String>,
    pub ports: Vec<u16>,
    pub probe_timeout_ms: u64,
    pub enable_sweep: bool,
    pub enable_passive: bool,
    /// Pause between sweeps; `None` or 0 sweeps once.
    pub rerun_interval_secs: Option<u64>,
    pub max_concurrent_probes: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            network_range: None,
            ports: DEFAULT_PORTS.to_vec(),
            probe_timeout_ms: 5000,
            enable_sweep: true,
            enable_passive: true,
            rerun_interval_secs: Some(1800),
            max_concurrent_probes: 64,
        }
    }
}

impl DiscoveryOptions {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn rerun_interval(&self) -> Option<Duration> {
        self.rerun_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), DiscoveryError> {
        if self.ports.is_empty() {
            return Err(DiscoveryError::Validation("port list is empty".into()));
        }
        if self.ports.contains(&0) {
            return Err(DiscoveryError::Validation("port 0 is not scannable".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(DiscoveryError::Validation("probe timeout must be positive".into()));
        }
        if self.max_concurrent_probes == 0 {
            return Err(DiscoveryError::Validation("max_concurrent_probes must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Requested,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanPhase {
    PortScanning,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStatus {
    pub state: DiscoveryState,
    pub range: Option<String>,
    pub ports: Vec<u16>,
    pub brokers_found: usize,
    pub sweeps_completed: u64,
    pub targets_probed: u64,
    pub connect_failures: u64,
    pub timeouts: u64,
    pub open_non_broker: u64,
    /// Open non-broker ports by identified service.
    pub open_services: BTreeMap<String, u64>,
    pub announcements_seen: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sweep_started: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sweep_finished: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
struct ScanStats {
    range: Option<String>,
    ports: Vec<u16>,
    sweeps_completed: u64,
    targets_probed: u64,
    connect_failures: u64,
    timeouts: u64,
    open_non_broker: u64,
    open_services: BTreeMap<String, u64>,
    announcements_seen: u64,
    last_sweep_started: Option<OffsetDateTime>,
    last_sweep_finished: Option<OffsetDateTime>,
}

struct ActiveRun {
    token: CancellationToken,
    generation: u64,
}

struct EngineInner {
    bus: EventBus,
    registry: RwLock<BrokerRegistry>,
    stats: Shared<ScanStats>,
    run: Mutex<Option<ActiveRun>>,
    generation: AtomicU64,
    announcements: Option<Arc<dyn AnnouncementSource>>,
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

impl DiscoveryEngine {
    pub fn new(bus: EventBus) -> Self {
        Self::build(bus, None)
    }

    pub fn with_announcements(bus: EventBus, source: Arc<dyn AnnouncementSource>) -> Self {
        Self::build(bus, Some(source))
    }

    fn build(bus: EventBus, announcements: Option<Arc<dyn AnnouncementSource>>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                bus,
                registry: RwLock::new(BrokerRegistry::default()),
                stats: new_state(ScanStats::default()),
                run: Mutex::new(None),
                generation: AtomicU64::new(0),
                announcements,
            }),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        if self.inner.run.lock().is_some() {
            DiscoveryState::Scanning
        } else {
            DiscoveryState::Idle
        }
    }

    /// Begins a run in the background. Must be called from a tokio runtime.
    pub fn start(&self, options: DiscoveryOptions) -> Result<(), DiscoveryError> {
        let mut run = self.inner.run.lock();
        if run.is_some() {
            return Err(DiscoveryError::AlreadyScanning);
        }
        options.validate()?;
        let range = match options.network_range.as_deref() {
            Some(raw) => AddressRange::parse(raw)?,
            None => self.detect_range(),
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        *run = Some(ActiveRun {
            token: token.clone(),
            generation,
        });
        drop(run);

        {
            let mut stats = self.inner.stats.lock();
            stats.range = Some(range.to_string());
            stats.ports = options.ports.clone();
        }

        info!(range = %range, ports = ?options.ports, "discovery started");
        self.inner.bus.publish(KernelEvent::DiscoveryStarted {
            range: range.to_string(),
            ports: options.ports.clone(),
        });

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(range, options, token, generation).await;
        });
        Ok(())
    }

    /// Cancels the current run. Returns false when already idle.
    pub fn stop(&self) -> bool {
        let Some(run) = self.inner.run.lock().take() else {
            return false;
        };
        run.token.cancel();
        info!("discovery stopped");
        self.inner.bus.publish(KernelEvent::DiscoveryStopped {
            reason: StopReason::Requested,
        });
        true
    }

    pub fn status(&self) -> DiscoveryStatus {
        let brokers_found = self.inner.registry.read().len();
        let state = self.state();
        let stats = self.inner.stats.lock();
        DiscoveryStatus {
            state,
            range: stats.range.clone(),
            ports: stats.ports.clone(),
            brokers_found,
            sweeps_completed: stats.sweeps_completed,
            targets_probed: stats.targets_probed,
            connect_failures: stats.connect_failures,
            timeouts: stats.timeouts,
            open_non_broker: stats.open_non_broker,
            open_services: stats.open_services.clone(),
            announcements_seen: stats.announcements_seen,
            last_sweep_started: stats.last_sweep_started,
            last_sweep_finished: stats.last_sweep_finished,
        }
    }

    pub fn brokers(&self) -> Vec<BrokerDescriptor> {
        self.inner.registry.read().list()
    }

    pub fn broker(&self, host: &str, port: u16) -> Option<BrokerDescriptor> {
        self.inner.registry.read().get(host, port).cloned()
    }

    pub fn remove(&self, host: &str, port: u16) -> Option<BrokerDescriptor> {
        self.inner.registry.write().remove(host, port)
    }

    /// Merges an observation and announces the outcome on the bus.
    pub fn record(&self, observation: BrokerObservation) -> BrokerDescriptor {
        let observed = self
            .inner
            .registry
            .write()
            .observe(observation, OffsetDateTime::now_utc());
        match observed {
            Observed::New(broker) => {
                info!(host = %broker.host, port = broker.port, method = %broker.method, "broker discovered");
                self.inner.bus.publish(KernelEvent::BrokerDiscovered {
                    broker: broker.clone(),
                });
                broker
            }
            Observed::Updated(broker) => {
                debug!(host = %broker.host, port = broker.port, seen = broker.seen_count, "broker seen again");
                self.inner.bus.publish(KernelEvent::BrokerUpdated {
                    broker: broker.clone(),
                });
                broker
            }
        }
    }

    fn detect_range(&self) -> AddressRange {
        match local_subnet() {
            Ok(Some(range)) => range,
            Ok(None) => {
                warn!("no usable IPv4 interface, falling back to {}", fallback_range());
                fallback_range()
            }
            Err(e) => {
                warn!(error = %e, "interface enumeration failed, falling back to {}", fallback_range());
                self.inner.bus.publish(KernelEvent::DiscoveryError {
                    kind: e.kind(),
                    reason: e.to_string(),
                });
                fallback_range()
            }
        }
    }

    async fn run(&self, range: AddressRange, options: DiscoveryOptions, token: CancellationToken, generation: u64) {
        let passive = options
            .enable_passive
            .then(|| self.inner.announcements.clone())
            .flatten();

        let listen = async {
            if let Some(source) = passive {
                self.listen(source, &options.ports, token.child_token()).await;
            }
        };
        let sweep = async {
            if options.enable_sweep {
                self.sweep_loop(&range, &options, token.child_token()).await;
            }
        };
        tokio::join!(listen, sweep);

        self.finish(generation);
    }

    /// Natural end of a run; a run already stopped or replaced stays silent.
    fn finish(&self, generation: u64) {
        let mut run = self.inner.run.lock();
        if run.as_ref().map(|r| r.generation) != Some(generation) {
            return;
        }
        *run = None;
        drop(run);
        info!("discovery completed");
        self.inner.bus.publish(KernelEvent::DiscoveryStopped {
            reason: StopReason::Completed,
        });
    }

    async fn listen(&self, source: Arc<dyn AnnouncementSource>, ports: &[u16], token: CancellationToken) {
        let mut announcements = source.announcements();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = announcements.next() => next,
            };
            match next {
                Some(announcement) => {
                    self.inner.stats.lock().announcements_seen += 1;
                    if announcement.matches(ports) {
                        self.record(BrokerObservation::from_announcement(&announcement));
                    } else {
                        debug!(service = %announcement.service_type, port = announcement.port, "announcement ignored");
                    }
                }
                None => {
                    debug!("announcement source ended");
                    break;
                }
            }
        }
    }

    async fn sweep_loop(&self, range: &AddressRange, options: &DiscoveryOptions, token: CancellationToken) {
        loop {
            if !self.sweep(range, options, &token).await {
                break;
            }
            let Some(interval) = options.rerun_interval() else {
                break;
            };
            debug!(?interval, "next sweep scheduled");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One pass over range x ports. Returns false if cancelled midway.
    async fn sweep(&self, range: &AddressRange, options: &DiscoveryOptions, token: &CancellationToken) -> bool {
        let targets: Vec<(String, u16)> = range
            .hosts()
            .into_iter()
            .flat_map(|host| options.ports.iter().map(move |port| (host.clone(), *port)))
            .collect();
        let total = targets.len();
        self.inner.stats.lock().last_sweep_started = Some(OffsetDateTime::now_utc());
        info!(range = %range, targets = total, "sweep started");

        let probe = HandshakeProbe::new(options.probe_timeout());
        let probe = &probe;
        let mut outcomes = Box::pin(
            futures::stream::iter(targets)
                .map(|(host, port)| async move {
                    let attempt = probe.attempt(&host, port).await;
                    (host, port, attempt)
                })
                .buffer_unordered(options.max_concurrent_probes),
        );

        let mut completed = 0;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return false,
                next = outcomes.next() => next,
            };
            let Some((host, port, attempt)) = next else {
                break;
            };
            completed += 1;
            self.absorb(host, port, attempt);
            self.inner.bus.publish(KernelEvent::ScanProgress {
                phase: ScanPhase::PortScanning,
                completed,
                total,
            });
        }

        {
            let mut stats = self.inner.stats.lock();
            stats.sweeps_completed += 1;
            stats.last_sweep_finished = Some(OffsetDateTime::now_utc());
        }
        info!(targets = total, brokers = self.inner.registry.read().len(), "sweep finished");
        self.inner.bus.publish(KernelEvent::ScanProgress {
            phase: ScanPhase::Completed,
            completed,
            total,
        });
        true
    }

    fn absorb(&self, host: String, port: u16, attempt: ProbeAttempt) {
        let observation = {
            let mut stats = self.inner.stats.lock();
            stats.targets_probed += 1;
            match attempt {
                ProbeAttempt::Refused => {
                    stats.connect_failures += 1;
                    None
                }
                ProbeAttempt::TimedOut => {
                    stats.timeouts += 1;
                    None
                }
                ProbeAttempt::Completed(result) if result.protocol_detected => {
                    Some(BrokerObservation::from_probe(&result))
                }
                // TLS listeners never answer a plaintext CONNECT
                ProbeAttempt::Completed(_) if is_mqtt_port(port) => {
                    Some(BrokerObservation::new(host, port, DiscoveryMethod::PortSweep))
                }
                ProbeAttempt::Completed(_) => {
                    stats.open_non_broker += 1;
                    let service = identify_service(port).unwrap_or("unknown");
                    *stats.open_services.entry(service.to_string()).or_insert(0) += 1;
                    None
                }
            }
        };
        if let Some(observation) = observation {
            self.record(observation);
        }
    }
}
