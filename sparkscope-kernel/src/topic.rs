/**
 * TOPIC - Sparkplug topic addressing
 *
 * ROLE: splits `namespace/group/kind/node[/device...]` into its parts when the
 * namespace token is recognised. Anything else is simply "not addressed".
 *
 * HOW: a splitn(5) keeps every slash after the fourth segment inside the
 * device id, so parse followed by `to_topic_string` reproduces the input.
 */

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

pub const SPARKPLUG_B_NAMESPACE: &str = "spBv1.0";

/// Message kind carried in the third topic segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKind {
    NBirth,
    NDeath,
    DBirth,
    DDeath,
    NData,
    DData,
    NCmd,
    DCmd,
    State,
    Other(String),
}

impl TopicKind {
    pub fn parse(segment: &str) -> Self {
        match segment {
            "NBIRTH" => TopicKind::NBirth,
            "NDEATH" => TopicKind::NDeath,
            "DBIRTH" => TopicKind::DBirth,
            "DDEATH" => TopicKind::DDeath,
            "NDATA" => TopicKind::NData,
            "DDATA" => TopicKind::DData,
            "NCMD" => TopicKind::NCmd,
            "DCMD" => TopicKind::DCmd,
            "STATE" => TopicKind::State,
            other => TopicKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TopicKind::NBirth => "NBIRTH",
            TopicKind::NDeath => "NDEATH",
            TopicKind::DBirth => "DBIRTH",
            TopicKind::DDeath => "DDEATH",
            TopicKind::NData => "NDATA",
            TopicKind::DData => "DDATA",
            TopicKind::NCmd => "NCMD",
            TopicKind::DCmd => "DCMD",
            TopicKind::State => "STATE",
            TopicKind::Other(other) => other,
        }
    }

    pub fn is_birth(&self) -> bool {
        matches!(self, TopicKind::NBirth | TopicKind::DBirth)
    }

    pub fn is_death(&self) -> bool {
        matches!(self, TopicKind::NDeath | TopicKind::DDeath)
    }

    pub fn description(&self) -> &str {
        match self {
            TopicKind::NBirth => "Node Birth Certificate",
            TopicKind::NDeath => "Node Death Certificate",
            TopicKind::DBirth => "Device Birth Certificate",
            TopicKind::DDeath => "Device Death Certificate",
            TopicKind::NData => "Node Data",
            TopicKind::DData => "Device Data",
            TopicKind::NCmd => "Node Command",
            TopicKind::DCmd => "Device Command",
            TopicKind::State => "Host Application State",
            TopicKind::Other(other) => other,
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TopicKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SparkplugTopic {
    pub namespace: String,
    pub group_id: String,
    pub kind: TopicKind,
    pub edge_node_id: String,
    pub device_id: Option<String>,
}

impl SparkplugTopic {
    pub fn to_topic_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SparkplugTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.group_id, self.kind, self.edge_node_id
        )?;
        if let Some(device) = &self.device_id {
            write!(f, "/{device}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicParser {
    namespaces: Vec<String>,
}

impl Default for TopicParser {
    fn default() -> Self {
        Self {
            namespaces: vec![SPARKPLUG_B_NAMESPACE.to_string()],
        }
    }
}

impl TopicParser {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn recognizes(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|ns| ns == namespace)
    }

    pub fn is_addressed(&self, topic: &str) -> bool {
        self.parse(topic).is_some()
    }

    /// Returns `None` for anything that is not `ns/group/kind/node[/device...]`
    /// with a recognised namespace.
    pub fn parse(&self, topic: &str) -> Option<SparkplugTopic> {
        let mut segments = topic.splitn(5, '/');
        let namespace = segments.next()?;
        if !self.recognizes(namespace) {
            return None;
        }
        let group_id = segments.next()?;
        let kind = segments.next()?;
        let edge_node_id = segments.next()?;
        let device_id = segments.next().map(str::to_string);

        Some(SparkplugTopic {
            namespace: namespace.to_string(),
            group_id: group_id.to_string(),
            kind: TopicKind::parse(kind),
            edge_node_id: edge_node_id.to_string(),
            device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_topic() {
        let parser = TopicParser::default();
        let topic = parser.parse("spBv1.0/Plant1/NBIRTH/Edge1").unwrap();
        assert_eq!(topic.group_id, "Plant1");
        assert_eq!(topic.kind, TopicKind::NBirth);
        assert_eq!(topic.edge_node_id, "Edge1");
        assert_eq!(topic.device_id, None);
        assert!(topic.kind.is_birth());
    }

    #[test]
    fn test_device_segments_are_rejoined() {
        let parser = TopicParser::default();
        let raw = "spBv1.0/G1/DDATA/Edge1/line/4/motor";
        let topic = parser.parse(raw).unwrap();
        assert_eq!(topic.device_id.as_deref(), Some("line/4/motor"));
        assert_eq!(topic.to_topic_string(), raw);
    }

    #[test]
    fn test_rejoin_reproduces_input() {
        let parser = TopicParser::new(["spBv1.0", "ns"]);
        for raw in [
            "ns/G1/DDATA/Edge1/Dev1",
            "spBv1.0/G/NDATA/E",
            "spBv1.0//CUSTOM/E/",
            "ns/a/b/c/d/e/f/",
        ] {
            let topic = parser.parse(raw).unwrap();
            assert_eq!(topic.to_topic_string(), raw);
        }
    }

    #[test]
    fn test_non_matching_topics() {
        let parser = TopicParser::default();
        for raw in [
            "",
            "spBv1.0",
            "spBv1.0/G1/NDATA",
            "spBv1.0/STATE/host",
            "factory/line1/temp/sensor",
            "spAv1.0/G1/NDATA/E1",
            "/spBv1.0/G1/NDATA/E1",
        ] {
            assert!(parser.parse(raw).is_none(), "{raw} should not match");
        }
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let topic = TopicParser::default().parse("spBv1.0/G/FOO/E").unwrap();
        assert_eq!(topic.kind, TopicKind::Other("FOO".into()));
        assert_eq!(topic.kind.description(), "FOO");
        assert!(!topic.kind.is_death());
    }
}
