//! Sparkplug B binary payload codec.
//!
//! Sparkplug B payloads are protobuf (proto2) messages. The codec reads and
//! writes the wire format directly so the type-tag table stays explicit.

mod payload;
mod summary;
mod types;
mod wire;

pub use payload::{decode, encode, MetaData, Metric, Payload};
pub use summary::PayloadSummary;
pub use types::{
    DataSet, DataType, MetricValue, Parameter, PropertyData, PropertySet, PropertyValue, Template,
    Variant,
};
