//! Payload statistics and human-readable metric descriptions.

use super::payload::{Metric, Payload};
use super::types::MetricValue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadSummary {
    pub metric_count: usize,
    /// Datatype name to number of metrics declaring it.
    pub data_types: BTreeMap<String, usize>,
    pub aliases: Vec<u64>,
    pub has_template: bool,
    pub has_dataset: bool,
}

impl PayloadSummary {
    pub fn of(payload: &Payload) -> Self {
        let mut summary = PayloadSummary {
            metric_count: payload.metrics.len(),
            ..Self::default()
        };
        for metric in &payload.metrics {
            *summary.data_types.entry(metric.datatype_name()).or_insert(0) += 1;
            if let Some(alias) = metric.alias {
                summary.aliases.push(alias);
            }
            match metric.value {
                MetricValue::Template(_) => summary.has_template = true,
                MetricValue::DataSet(_) => summary.has_dataset = true,
                _ => {}
            }
        }
        summary
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int8(v) => write!(f, "{v}"),
            MetricValue::Int16(v) => write!(f, "{v}"),
            MetricValue::Int32(v) => write!(f, "{v}"),
            MetricValue::Int64(v) => write!(f, "{v}"),
            MetricValue::UInt8(v) => write!(f, "{v}"),
            MetricValue::UInt16(v) => write!(f, "{v}"),
            MetricValue::UInt32(v) => write!(f, "{v}"),
            MetricValue::UInt64(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v:.2}"),
            MetricValue::Double(v) => write!(f, "{v:.2}"),
            MetricValue::Boolean(v) => write!(f, "{v}"),
            MetricValue::String(v) => f.write_str(v),
            MetricValue::DateTime(ms) => match format_epoch_millis(*ms) {
                Some(text) => f.write_str(&text),
                None => write!(f, "{ms}"),
            },
            MetricValue::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            MetricValue::DataSet(v) => write!(f, "DataSet({} rows)", v.rows.len()),
            MetricValue::Template(v) => write!(f, "Template({} metrics)", v.metrics.len()),
            MetricValue::PropertySet(v) => write!(f, "PropertySet({} keys)", v.len()),
            MetricValue::Null => f.write_str("null"),
        }
    }
}

/// `"Temp" (alias: 3) Int32: 21 [Historical]`
impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "\"{name}\" ")?;
        }
        if let Some(alias) = self.alias {
            write!(f, "(alias: {alias}) ")?;
        }
        write!(f, "{}: {}", self.datatype_name(), self.value)?;
        if self.is_historical {
            f.write_str(" [Historical]")?;
        }
        if self.is_transient {
            f.write_str(" [Transient]")?;
        }
        if self.is_null {
            f.write_str(" [NULL]")?;
        }
        Ok(())
    }
}

fn format_epoch_millis(ms: u64) -> Option<String> {
    let nanos = i128::from(ms).checked_mul(1_000_000)?;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()?
        .format(&Rfc3339)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparkplug::types::{DataSet, DataType, Template};

    #[test]
    fn test_summary_counts_types_and_structures() {
        let payload = Payload {
            metrics: vec![
                Metric::new("A", DataType::Int32, MetricValue::Int32(1)).with_alias(1),
                Metric::new("B", DataType::Int32, MetricValue::Int32(2)).with_alias(2),
                Metric::new("C", DataType::DataSet, MetricValue::DataSet(DataSet::default())),
                Metric::new("D", DataType::Template, MetricValue::Template(Template::default())),
            ],
            ..Payload::default()
        };
        let summary = PayloadSummary::of(&payload);
        assert_eq!(summary.metric_count, 4);
        assert_eq!(summary.data_types.get("Int32"), Some(&2));
        assert_eq!(summary.aliases, vec![1, 2]);
        assert!(summary.has_template);
        assert!(summary.has_dataset);
    }

    #[test]
    fn test_metric_description() {
        let mut metric = Metric::new("Temp", DataType::Double, MetricValue::Double(21.456)).with_alias(3);
        metric.is_historical = true;
        assert_eq!(metric.to_string(), "\"Temp\" (alias: 3) Double: 21.46 [Historical]");

        let bare = Metric {
            alias: Some(9),
            value: MetricValue::Null,
            is_null: true,
            ..Metric::default()
        };
        assert_eq!(bare.to_string(), "(alias: 9) Unknown: null [NULL]");
    }

    #[test]
    fn test_datetime_formats_as_rfc3339() {
        let value = MetricValue::DateTime(0);
        assert_eq!(value.to_string(), "1970-01-01T00:00:00Z");
    }
}
