/**
 * REGISTRY - Deduplicated broker descriptors
 *
 * ROLE: one descriptor per (host, port), whatever mix of passive announcements,
 * port sweeps and handshake probes observed it.
 *
 * HOW: a repeat observation merges into the existing entry (flag union, method
 * union, last_seen and seen_count bumped). Entries only leave through remove().
 */

use super::announce::ServiceAnnouncement;
use super::services::{identify_service, is_secure_port};
use crate::probe::{AuthRequirement, ProbeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMethod {
    PassiveAnnounce,
    PortSweep,
    HandshakeProbe,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscoveryMethod::PassiveAnnounce => "passive-announce",
            DiscoveryMethod::PortSweep => "port-sweep",
            DiscoveryMethod::HandshakeProbe => "handshake-probe",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerDescriptor {
    pub host: String,
    pub port: u16,
    /// Method of the first observation.
    pub method: DiscoveryMethod,
    pub methods: BTreeSet<DiscoveryMethod>,
    pub requires_auth: bool,
    pub secure_transport: bool,
    pub anonymous_access: bool,
    pub last_ack_code: Option<u8>,
    pub service_name: Option<String>,
    pub announced_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub seen_count: u64,
}

impl BrokerDescriptor {
    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn merge(&mut self, obs: BrokerObservation, at: OffsetDateTime) {
        self.methods.insert(obs.method);
        self.requires_auth |= obs.requires_auth;
        self.secure_transport |= obs.secure_transport;
        self.anonymous_access |= obs.anonymous_access;
        if obs.ack_code.is_some() {
            self.last_ack_code = obs.ack_code;
        }
        if self.service_name.is_none() {
            self.service_name = obs.service_name;
        }
        if obs.announced_name.is_some() {
            self.announced_name = obs.announced_name;
        }
        self.last_seen = at;
        self.seen_count += 1;
    }
}

/// One sighting of a broker, before it is merged into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerObservation {
    pub host: String,
    pub port: u16,
    pub method: DiscoveryMethod,
    pub requires_auth: bool,
    pub secure_transport: bool,
    pub anonymous_access: bool,
    pub ack_code: Option<u8>,
    pub service_name: Option<String>,
    pub announced_name: Option<String>,
}

impl BrokerObservation {
    pub fn new(host: impl Into<String>, port: u16, method: DiscoveryMethod) -> Self {
        Self {
            host: host.into(),
            port,
            method,
            requires_auth: false,
            secure_transport: is_secure_port(port),
            anonymous_access: false,
            ack_code: None,
            service_name: identify_service(port).map(str::to_string),
            announced_name: None,
        }
    }

    pub fn from_probe(result: &ProbeResult) -> Self {
        Self {
            requires_auth: result.auth_required == AuthRequirement::Yes,
            anonymous_access: result.auth_required == AuthRequirement::No,
            ack_code: result.ack_code,
            ..Self::new(result.host.clone(), result.port, DiscoveryMethod::HandshakeProbe)
        }
    }

    pub fn from_announcement(announcement: &ServiceAnnouncement) -> Self {
        Self {
            secure_transport: announcement.is_secure(),
            announced_name: Some(announcement.instance_name.clone()),
            ..Self::new(
                announcement.host.clone(),
                announcement.port,
                DiscoveryMethod::PassiveAnnounce,
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    New(BrokerDescriptor),
    Updated(BrokerDescriptor),
}

#[derive(Debug, Default)]
pub struct BrokerRegistry {
    brokers: HashMap<(String, u16), BrokerDescriptor>,
}

impl BrokerRegistry {
    pub fn observe(&mut self, obs: BrokerObservation, at: OffsetDateTime) -> Observed {
        let key = (obs.host.clone(), obs.port);
        if let Some(existing) = self.brokers.get_mut(&key) {
            existing.merge(obs, at);
            return Observed::Updated(existing.clone());
        }

        let descriptor = BrokerDescriptor {
            host: obs.host,
            port: obs.port,
            method: obs.method,
            methods: BTreeSet::from([obs.method]),
            requires_auth: obs.requires_auth,
            secure_transport: obs.secure_transport,
            anonymous_access: obs.anonymous_access,
            last_ack_code: obs.ack_code,
            service_name: obs.service_name,
            announced_name: obs.announced_name,
            first_seen: at,
            last_seen: at,
            seen_count: 1,
        };
        self.brokers.insert(key, descriptor.clone());
        Observed::New(descriptor)
    }

    pub fn get(&self, host: &str, port: u16) -> Option<&BrokerDescriptor> {
        self.brokers.get(&(host.to_string(), port))
    }

    pub fn remove(&mut self, host: &str, port: u16) -> Option<BrokerDescriptor> {
        self.brokers.remove(&(host.to_string(), port))
    }

    /// Sorted by host then port.
    pub fn list(&self) -> Vec<BrokerDescriptor> {
        let mut brokers: Vec<_> = self.brokers.values().cloned().collect();
        brokers.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        brokers
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
