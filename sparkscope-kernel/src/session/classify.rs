//! Message kind classification for inbound publishes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    DecodedMetric,
    Undecodable,
    Json,
    Telemetry,
    Command,
    Alarm,
    Configuration,
    Unknown,
}

/// Outcome of the Sparkplug decode attempt for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    NotAddressed,
    Decoded,
    Failed,
}

const KEYWORDS: [(MessageKind, &[&str]); 4] = [
    (MessageKind::Telemetry, &["telemetry", "sensor", "data"]),
    (MessageKind::Command, &["command", "cmd", "control"]),
    (MessageKind::Alarm, &["alarm", "alert", "event"]),
    (MessageKind::Configuration, &["config", "setting"]),
];

pub fn classify(topic: &str, payload: &[u8], schema: SchemaOutcome) -> MessageKind {
    match schema {
        SchemaOutcome::Decoded => return MessageKind::DecodedMetric,
        SchemaOutcome::Failed => return MessageKind::Undecodable,
        SchemaOutcome::NotAddressed => {}
    }

    if !payload.is_empty() && serde_json::from_slice::<serde_json::Value>(payload).is_ok() {
        return MessageKind::Json;
    }

    let topic = topic.to_ascii_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| topic.contains(w)))
        .map(|(kind, _)| *kind)
        .unwrap_or(MessageKind::Unknown)
}
