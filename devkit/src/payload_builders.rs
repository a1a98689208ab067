/*!
Builders for Sparkplug B test traffic.
*/

use sparkscope_kernel::sparkplug::{encode, DataType, Metric, MetricValue, Payload};
use sparkscope_kernel::topic::{SparkplugTopic, TopicKind};

/// Sparkplug topic string, e.g. `topic("spBv1.0", "G1", TopicKind::DData, "E1", Some("D1"))`.
pub fn topic(namespace: &str, group: &str, kind: TopicKind, edge_node: &str, device: Option<&str>) -> String {
    SparkplugTopic {
        namespace: namespace.into(),
        group_id: group.into(),
        kind,
        edge_node_id: edge_node.into(),
        device_id: device.map(str::to_string),
    }
    .to_string()
}

#[derive(Debug, Clone, Default)]
pub struct SparkplugPayloadBuilder {
    payload: Payload,
}

impl SparkplugPayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.payload.seq = Some(seq);
        self
    }

    pub fn timestamp(mut self, millis: u64) -> Self {
        self.payload.timestamp = Some(millis);
        self
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.payload.metrics.push(metric);
        self
    }

    pub fn double(self, name: &str, value: f64) -> Self {
        self.metric(Metric::new(name, DataType::Double, MetricValue::Double(value)))
    }

    pub fn int32(self, name: &str, value: i32) -> Self {
        self.metric(Metric::new(name, DataType::Int32, MetricValue::Int32(value)))
    }

    pub fn boolean(self, name: &str, value: bool) -> Self {
        self.metric(Metric::new(name, DataType::Boolean, MetricValue::Boolean(value)))
    }

    pub fn string(self, name: &str, value: &str) -> Self {
        self.metric(Metric::new(name, DataType::String, MetricValue::String(value.into())))
    }

    /// Metric known only by alias, as in DATA messages after a birth.
    pub fn aliased(mut self, alias: u64, datatype: DataType, value: MetricValue) -> Self {
        self.payload.metrics.push(Metric {
            alias: Some(alias),
            datatype: Some(datatype),
            value,
            ..Metric::default()
        });
        self
    }

    pub fn build(self) -> Payload {
        self.payload
    }

    pub fn encode(self) -> Vec<u8> {
        encode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkscope_kernel::sparkplug::decode;

    #[test]
    fn test_topic_with_and_without_device() {
        assert_eq!(topic("spBv1.0", "G1", TopicKind::DData, "E1", Some("D1")), "spBv1.0/G1/DDATA/E1/D1");
        assert_eq!(topic("spBv1.0", "G1", TopicKind::NBirth, "E1", None), "spBv1.0/G1/NBIRTH/E1");
    }

    #[test]
    fn test_builder_output_decodes() {
        let bytes = SparkplugPayloadBuilder::new()
            .seq(3)
            .timestamp(1_700_000_000_000)
            .double("temperature", 21.5)
            .aliased(7, DataType::Int32, MetricValue::Int32(-4))
            .encode();
        let payload = decode(&bytes).unwrap();
        assert_eq!(payload.seq, Some(3));
        assert_eq!(payload.metrics.len(), 2);
        assert_eq!(payload.metrics[0].name.as_deref(), Some("temperature"));
        assert_eq!(payload.metrics[0].value, MetricValue::Double(21.5));
        assert_eq!(payload.metrics[1].alias, Some(7));
        assert_eq!(payload.metrics[1].value, MetricValue::Int32(-4));
    }
}
