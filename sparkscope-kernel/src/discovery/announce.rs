//! Passive discovery input: service announcements (mDNS-style browse results).
//!
//! The kernel does not browse the network itself. A collaborator implementing
//! [`AnnouncementSource`] feeds announcements in; [`ChannelAnnouncements`] is
//! the in-process implementation used by the binary and by tests.

use super::services::is_secure_port;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::warn;

pub const MQTT_SERVICE_TYPES: [&str; 3] = ["_mqtt._tcp", "_secure-mqtt._tcp", "_mqtts._tcp"];
const SECURE_SERVICE_TYPES: [&str; 2] = ["_secure-mqtt._tcp", "_mqtts._tcp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    /// e.g. `_mqtt._tcp` or `_mqtt._tcp.local.`
    pub service_type: String,
    pub instance_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub txt: BTreeMap<String, String>,
}

impl ServiceAnnouncement {
    fn bare_type(&self) -> &str {
        self.service_type
            .trim_end_matches('.')
            .trim_end_matches(".local")
    }

    pub fn matches(&self, ports: &[u16]) -> bool {
        MQTT_SERVICE_TYPES.contains(&self.bare_type()) || ports.contains(&self.port)
    }

    pub fn is_secure(&self) -> bool {
        SECURE_SERVICE_TYPES.contains(&self.bare_type()) || self.tls || is_secure_port(self.port)
    }
}

pub trait AnnouncementSource: Send + Sync {
    /// A fresh stream for each discovery run.
    fn announcements(&self) -> BoxStream<'static, ServiceAnnouncement>;
}

#[derive(Clone)]
pub struct ChannelAnnouncements {
    sender: broadcast::Sender<ServiceAnnouncement>,
}

impl ChannelAnnouncements {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many listeners received it.
    pub fn announce(&self, announcement: ServiceAnnouncement) -> usize {
        self.sender.send(announcement).unwrap_or(0)
    }
}

impl AnnouncementSource for ChannelAnnouncements {
    fn announcements(&self) -> BoxStream<'static, ServiceAnnouncement> {
        let rx = self.sender.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(announcement) => return Some((announcement, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "announcement listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(service_type: &str, port: u16) -> ServiceAnnouncement {
        ServiceAnnouncement {
            service_type: service_type.into(),
            instance_name: "plant broker".into(),
            host: "10.0.0.5".into(),
            port,
            tls: false,
            txt: BTreeMap::new(),
        }
    }

    #[test]
    fn test_matching_rules() {
        let ports = [1883, 8883];
        assert!(announcement("_mqtt._tcp.local.", 4000).matches(&ports));
        assert!(announcement("_http._tcp", 1883).matches(&ports));
        assert!(!announcement("_http._tcp", 80).matches(&ports));
    }

    #[test]
    fn test_secure_detection() {
        assert!(announcement("_mqtts._tcp", 4000).is_secure());
        assert!(announcement("_mqtt._tcp", 8883).is_secure());
        assert!(!announcement("_mqtt._tcp", 1883).is_secure());
        let mut tls = announcement("_mqtt._tcp", 1883);
        tls.tls = true;
        assert!(tls.is_secure());
    }

    #[tokio::test]
    async fn test_channel_source_streams_announcements() {
        let source = ChannelAnnouncements::new(8);
        let mut stream = source.announcements();
        assert_eq!(source.announce(announcement("_mqtt._tcp", 1883)), 1);
        let received = stream.next().await.unwrap();
        assert_eq!(received.port, 1883);
    }
}
