//! Discovery to session glue: opens a session for each newly found broker.

use crate::config::BridgeConf;
use crate::discovery::BrokerDescriptor;
use crate::events::{EventBus, KernelEvent};
use crate::session::{SessionConfig, SessionManager};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session config for `broker`, or `None` when it must be skipped.
pub fn session_config_for(
    broker: &BrokerDescriptor,
    defaults: &SessionConfig,
    bridge: &BridgeConf,
) -> Option<SessionConfig> {
    if broker.requires_auth && bridge.username.is_none() {
        return None;
    }
    let (username, password) = if broker.requires_auth {
        (bridge.username.clone(), bridge.password.clone())
    } else {
        (defaults.username.clone(), defaults.password.clone())
    };
    Some(SessionConfig {
        name: Some(
            broker
                .announced_name
                .clone()
                .unwrap_or_else(|| broker.address()),
        ),
        host: broker.host.clone(),
        port: Some(u32::from(broker.port)),
        use_tls: Some(broker.secure_transport),
        username,
        password,
        ..defaults.clone()
    })
}

pub fn spawn_discovery_bridge(
    bus: &EventBus,
    manager: SessionManager,
    defaults: SessionConfig,
    bridge: BridgeConf,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let broker = match rx.recv().await {
                Ok(KernelEvent::BrokerDiscovered { broker }) => broker,
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "discovery bridge lagged behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !bridge.auto_connect {
                continue;
            }
            if manager.find_active(&broker.host, broker.port).is_some() {
                debug!(broker = %broker.address(), "session already open");
                continue;
            }
            let Some(config) = session_config_for(&broker, &defaults, &bridge) else {
                info!(broker = %broker.address(), "broker requires credentials, skipped");
                continue;
            };
            match manager.connect(config) {
                Ok(id) => info!(broker = %broker.address(), session = %id, "auto-connecting"),
                Err(e) => warn!(broker = %broker.address(), error = %e, "auto-connect rejected"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryMethod;
    use std::collections::BTreeSet;
    use time::OffsetDateTime;

    fn broker(requires_auth: bool, secure: bool) -> BrokerDescriptor {
        let now = OffsetDateTime::now_utc();
        BrokerDescriptor {
            host: "10.0.0.7".into(),
            port: 8883,
            method: DiscoveryMethod::HandshakeProbe,
            methods: BTreeSet::from([DiscoveryMethod::HandshakeProbe]),
            requires_auth,
            secure_transport: secure,
            anonymous_access: !requires_auth,
            last_ack_code: Some(if requires_auth { 5 } else { 0 }),
            service_name: Some("mqtts".into()),
            announced_name: None,
            first_seen: now,
            last_seen: now,
            seen_count: 1,
        }
    }

    #[test]
    fn test_config_follows_descriptor() {
        let defaults = SessionConfig {
            buffer_capacity: 50,
            ..SessionConfig::default()
        };
        let config = session_config_for(&broker(false, true), &defaults, &BridgeConf::default()).unwrap();
        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.port, Some(8883));
        assert_eq!(config.use_tls, Some(true));
        assert_eq!(config.buffer_capacity, 50);
        assert_eq!(config.name.as_deref(), Some("10.0.0.7:8883"));
    }

    #[test]
    fn test_auth_required_needs_credentials() {
        let defaults = SessionConfig::default();
        assert!(session_config_for(&broker(true, false), &defaults, &BridgeConf::default()).is_none());

        let bridge = BridgeConf {
            username: Some("ops".into()),
            password: Some("secret".into()),
            ..BridgeConf::default()
        };
        let config = session_config_for(&broker(true, false), &defaults, &bridge).unwrap();
        assert_eq!(config.username.as_deref(), Some("ops"));
        assert_eq!(config.password.as_deref(), Some("secret"));
    }
}
