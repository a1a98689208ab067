//! Port-based service identification for open endpoints.

/// Common service name for a well-known port.
pub fn identify_service(port: u16) -> Option<&'static str> {
    let name = match port {
        1883 | 1884 | 1888 | 8888 => "mqtt",
        8883 | 8884 => "mqtts",
        9001 => "mqtt-ws",
        80 | 8080 => "http",
        443 | 8443 => "https",
        502 => "modbus",
        102 => "s7comm",
        22 => "ssh",
        _ => return None,
    };
    Some(name)
}

pub fn is_mqtt_port(port: u16) -> bool {
    matches!(identify_service(port), Some(name) if name.starts_with("mqtt"))
}

pub fn is_secure_port(port: u16) -> bool {
    matches!(port, 8883 | 8884)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_service() {
        assert_eq!(identify_service(1883), Some("mqtt"));
        assert_eq!(identify_service(8883), Some("mqtts"));
        assert_eq!(identify_service(502), Some("modbus"));
        assert_eq!(identify_service(102), Some("s7comm"));
        assert_eq!(identify_service(4242), None);
        assert!(is_mqtt_port(9001));
        assert!(!is_mqtt_port(8080));
        assert!(is_secure_port(8884));
        assert!(!is_secure_port(1883));
    }
}
