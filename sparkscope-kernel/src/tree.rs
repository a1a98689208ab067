/**
 * TREE - Sparkplug metric tree aggregator
 *
 * ROLE: folds (topic, decoded payload) pairs into Group -> Edge Node -> Device
 * nodes with activity timestamps, message counters and latest metrics.
 *
 * HOW: nodes are created lazily by identity key and never removed, so a given
 * (group, node, device) triple always lands on the same entry. Birth and death
 * kinds only bump counters; data is accepted regardless of ordering.
 *
 * USE: the session manager owns one tree and feeds it from every session.
 */

use crate::buffer::RingBuffer;
use crate::sparkplug::{Metric, MetricValue, Payload};
use crate::topic::{SparkplugTopic, TopicKind};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// One recorded metric value, kept in the owning node's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: TopicKind,
    pub timestamp: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub value: MetricValue,
}

/// Metrics attached to an edge node or a device.
#[derive(Debug, Clone, Serialize)]
pub struct MetricStore {
    pub metrics: BTreeMap<String, Metric>,
    pub history: RingBuffer<MetricSample>,
    /// Learned from metrics that carry both a name and an alias.
    pub aliases: BTreeMap<u64, String>,
}

impl MetricStore {
    fn new(history_capacity: usize) -> Self {
        Self {
            metrics: BTreeMap::new(),
            history: RingBuffer::with_capacity(history_capacity),
            aliases: BTreeMap::new(),
        }
    }

    /// Records every metric of `payload`, returning the names it touched.
    fn absorb(&mut self, payload: &Payload, kind: &TopicKind, at: OffsetDateTime) -> Vec<String> {
        let mut touched = Vec::with_capacity(payload.metrics.len());
        for metric in &payload.metrics {
            let name = self.resolve_name(metric);
            let mut stored = metric.clone();
            stored.name = Some(name.clone());
            self.history.push(MetricSample {
                name: name.clone(),
                kind: kind.clone(),
                timestamp: metric.timestamp.or(payload.timestamp),
                received_at: at,
                value: metric.value.clone(),
            });
            self.metrics.insert(name.clone(), stored);
            touched.push(name);
        }
        touched
    }

    fn resolve_name(&mut self, metric: &Metric) -> String {
        match (&metric.name, metric.alias) {
            (Some(name), Some(alias)) => {
                self.aliases.insert(alias, name.clone());
                name.clone()
            }
            (Some(name), None) => name.clone(),
            (None, Some(alias)) => self
                .aliases
                .get(&alias)
                .cloned()
                .unwrap_or_else(|| format!("alias:{alias}")),
            (None, None) => "<unnamed>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceNode {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    pub message_count: u64,
    pub births: u64,
    pub deaths: u64,
    #[serde(flatten)]
    pub store: MetricStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeNode {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    pub message_count: u64,
    pub births: u64,
    pub deaths: u64,
    #[serde(flatten)]
    pub store: MetricStore,
    pub devices: BTreeMap<String, DeviceNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupNode {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    pub message_count: u64,
    pub edge_nodes: BTreeMap<String, EdgeNode>,
}

/// Path touched by one `apply` call, published as a tree-update event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeUpdate {
    pub group_id: String,
    pub edge_node_id: String,
    pub device_id: Option<String>,
    pub kind: TopicKind,
    pub metrics: Vec<String>,
    /// Message count of the deepest node addressed.
    pub message_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeSummary {
    pub groups: usize,
    pub edge_nodes: usize,
    pub devices: usize,
    pub metrics: usize,
    pub messages: u64,
    pub births: u64,
    pub deaths: u64,
    pub kinds: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricTree {
    groups: BTreeMap<String, GroupNode>,
    history_capacity: usize,
    messages: u64,
    births: u64,
    deaths: u64,
    kinds: BTreeMap<String, u64>,
}

impl Default for MetricTree {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MetricTree {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            groups: BTreeMap::new(),
            history_capacity,
            messages: 0,
            births: 0,
            deaths: 0,
            kinds: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, topic: &SparkplugTopic, payload: &Payload, at: OffsetDateTime) -> TreeUpdate {
        let birth = topic.kind.is_birth();
        let death = topic.kind.is_death();
        let capacity = self.history_capacity;

        self.messages += 1;
        self.births += u64::from(birth);
        self.deaths += u64::from(death);
        *self.kinds.entry(topic.kind.to_string()).or_insert(0) += 1;

        let group = self
            .groups
            .entry(topic.group_id.clone())
            .or_insert_with(|| GroupNode {
                id: topic.group_id.clone(),
                last_activity: at,
                message_count: 0,
                edge_nodes: BTreeMap::new(),
            });
        group.last_activity = at;
        group.message_count += 1;

        let node = group
            .edge_nodes
            .entry(topic.edge_node_id.clone())
            .or_insert_with(|| EdgeNode {
                id: topic.edge_node_id.clone(),
                last_activity: at,
                message_count: 0,
                births: 0,
                deaths: 0,
                store: MetricStore::new(capacity),
                devices: BTreeMap::new(),
            });
        node.last_activity = at;
        node.message_count += 1;

        let (metrics, message_count) = match &topic.device_id {
            Some(device_id) => {
                let device = node
                    .devices
                    .entry(device_id.clone())
                    .or_insert_with(|| DeviceNode {
                        id: device_id.clone(),
                        last_activity: at,
                        message_count: 0,
                        births: 0,
                        deaths: 0,
                        store: MetricStore::new(capacity),
                    });
                device.last_activity = at;
                device.message_count += 1;
                device.births += u64::from(birth);
                device.deaths += u64::from(death);
                (device.store.absorb(payload, &topic.kind, at), device.message_count)
            }
            None => {
                node.births += u64::from(birth);
                node.deaths += u64::from(death);
                (node.store.absorb(payload, &topic.kind, at), node.message_count)
            }
        };

        TreeUpdate {
            group_id: topic.group_id.clone(),
            edge_node_id: topic.edge_node_id.clone(),
            device_id: topic.device_id.clone(),
            kind: topic.kind.clone(),
            metrics,
            message_count,
        }
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupNode> {
        self.groups.get(group_id)
    }

    pub fn edge_node(&self, group_id: &str, edge_node_id: &str) -> Option<&EdgeNode> {
        self.group(group_id)?.edge_nodes.get(edge_node_id)
    }

    pub fn device(&self, group_id: &str, edge_node_id: &str, device_id: &str) -> Option<&DeviceNode> {
        self.edge_node(group_id, edge_node_id)?.devices.get(device_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupNode> {
        self.groups.values()
    }

    pub fn snapshot(&self) -> MetricTree {
        self.clone()
    }

    pub fn summary(&self) -> TreeSummary {
        let mut summary = TreeSummary {
            groups: self.groups.len(),
            messages: self.messages,
            births: self.births,
            deaths: self.deaths,
            kinds: self.kinds.clone(),
            ..TreeSummary::default()
        };
        for group in self.groups.values() {
            summary.edge_nodes += group.edge_nodes.len();
            for node in group.edge_nodes.values() {
                summary.metrics += node.store.metrics.len();
                summary.devices += node.devices.len();
                summary.metrics += node
                    .devices
                    .values()
                    .map(|d| d.store.metrics.len())
                    .sum::<usize>();
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparkplug::DataType;
    use crate::topic::TopicParser;

    fn payload(metrics: Vec<Metric>) -> Payload {
        Payload {
            metrics,
            ..Payload::default()
        }
    }

    #[test]
    fn test_device_data_builds_full_path() {
        let parser = TopicParser::new(["ns"]);
        let topic = parser.parse("ns/G1/DDATA/Edge1/Dev1").unwrap();
        let mut tree = MetricTree::default();
        let update = tree.apply(
            &topic,
            &payload(vec![Metric::new("Temp", DataType::Int32, MetricValue::Int32(21))]),
            OffsetDateTime::now_utc(),
        );

        let device = tree.device("G1", "Edge1", "Dev1").unwrap();
        assert_eq!(device.message_count, 1);
        assert!(device.store.metrics.contains_key("Temp"));
        assert_eq!(update.metrics, vec!["Temp".to_string()]);
        assert_eq!(update.message_count, 1);
        assert_eq!(tree.edge_node("G1", "Edge1").unwrap().message_count, 1);
        assert_eq!(tree.group("G1").unwrap().message_count, 1);
    }

    #[test]
    fn test_node_metrics_stay_on_edge_node() {
        let parser = TopicParser::default();
        let topic = parser.parse("spBv1.0/G1/NDATA/Edge1").unwrap();
        let mut tree = MetricTree::default();
        tree.apply(
            &topic,
            &payload(vec![Metric::new("Uptime", DataType::UInt64, MetricValue::UInt64(5))]),
            OffsetDateTime::now_utc(),
        );
        let node = tree.edge_node("G1", "Edge1").unwrap();
        assert!(node.store.metrics.contains_key("Uptime"));
        assert!(node.devices.is_empty());
    }

    #[test]
    fn test_same_triple_reuses_node() {
        let parser = TopicParser::default();
        let topic = parser.parse("spBv1.0/G1/DDATA/Edge1/Dev1").unwrap();
        let mut tree = MetricTree::default();
        let now = OffsetDateTime::now_utc();
        for n in 0..3 {
            tree.apply(
                &topic,
                &payload(vec![Metric::new("Temp", DataType::Int32, MetricValue::Int32(n))]),
                now,
            );
        }
        let summary = tree.summary();
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.edge_nodes, 1);
        assert_eq!(summary.devices, 1);
        assert_eq!(summary.metrics, 1);
        let device = tree.device("G1", "Edge1", "Dev1").unwrap();
        assert_eq!(device.message_count, 3);
        assert_eq!(device.store.history.len(), 3);
        assert_eq!(device.store.metrics["Temp"].value, MetricValue::Int32(2));
    }

    #[test]
    fn test_birth_and_death_are_counted() {
        let parser = TopicParser::default();
        let mut tree = MetricTree::default();
        let now = OffsetDateTime::now_utc();
        for raw in [
            "spBv1.0/G1/NBIRTH/Edge1",
            "spBv1.0/G1/DBIRTH/Edge1/Dev1",
            "spBv1.0/G1/DDEATH/Edge1/Dev1",
        ] {
            tree.apply(&parser.parse(raw).unwrap(), &Payload::default(), now);
        }
        let summary = tree.summary();
        assert_eq!(summary.births, 2);
        assert_eq!(summary.deaths, 1);
        assert_eq!(summary.kinds.get("DBIRTH"), Some(&1));
        let device = tree.device("G1", "Edge1", "Dev1").unwrap();
        assert_eq!((device.births, device.deaths), (1, 1));
        assert_eq!(tree.edge_node("G1", "Edge1").unwrap().births, 1);
    }

    #[test]
    fn test_alias_only_metric_resolves_birth_name() {
        let parser = TopicParser::default();
        let mut tree = MetricTree::default();
        let now = OffsetDateTime::now_utc();
        tree.apply(
            &parser.parse("spBv1.0/G1/DBIRTH/Edge1/Dev1").unwrap(),
            &payload(vec![
                Metric::new("Temp", DataType::Double, MetricValue::Double(20.0)).with_alias(4)
            ]),
            now,
        );
        let aliased = Metric {
            alias: Some(4),
            datatype: Some(DataType::Double),
            value: MetricValue::Double(22.5),
            ..Metric::default()
        };
        let update = tree.apply(
            &parser.parse("spBv1.0/G1/DDATA/Edge1/Dev1").unwrap(),
            &payload(vec![aliased]),
            now,
        );
        assert_eq!(update.metrics, vec!["Temp".to_string()]);
        let device = tree.device("G1", "Edge1", "Dev1").unwrap();
        assert_eq!(device.store.metrics["Temp"].value, MetricValue::Double(22.5));
    }

    #[test]
    fn test_history_is_bounded() {
        let parser = TopicParser::default();
        let topic = parser.parse("spBv1.0/G1/NDATA/Edge1").unwrap();
        let mut tree = MetricTree::new(2);
        let now = OffsetDateTime::now_utc();
        for n in 0..5 {
            tree.apply(
                &topic,
                &payload(vec![Metric::new("N", DataType::Int32, MetricValue::Int32(n))]),
                now,
            );
        }
        let history: Vec<_> = tree
            .edge_node("G1", "Edge1")
            .unwrap()
            .store
            .history
            .iter()
            .map(|s| s.value.clone())
            .collect();
        assert_eq!(history, vec![MetricValue::Int32(3), MetricValue::Int32(4)]);
    }
}
