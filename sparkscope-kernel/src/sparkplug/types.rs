//! Sparkplug B type tags and value unions.

use super::payload::Metric;
use serde::Serialize;
use std::fmt;

/// Sparkplug B datatype tag as carried in `Metric.datatype`,
/// `Parameter.type`, `PropertyValue.type` and `DataSet.types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Boolean,
    String,
    DateTime,
    Text,
    Uuid,
    DataSet,
    Bytes,
    File,
    Template,
    PropertySet,
    PropertySetList,
    Unknown(u32),
}

impl DataType {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            1 => DataType::Int8,
            2 => DataType::Int16,
            3 => DataType::Int32,
            4 => DataType::Int64,
            5 => DataType::UInt8,
            6 => DataType::UInt16,
            7 => DataType::UInt32,
            8 => DataType::UInt64,
            9 => DataType::Float,
            10 => DataType::Double,
            11 => DataType::Boolean,
            12 => DataType::String,
            13 => DataType::DateTime,
            14 => DataType::Text,
            15 => DataType::Uuid,
            16 => DataType::DataSet,
            17 => DataType::Bytes,
            18 => DataType::File,
            19 => DataType::Template,
            20 => DataType::PropertySet,
            21 => DataType::PropertySetList,
            other => DataType::Unknown(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 3,
            DataType::Int64 => 4,
            DataType::UInt8 => 5,
            DataType::UInt16 => 6,
            DataType::UInt32 => 7,
            DataType::UInt64 => 8,
            DataType::Float => 9,
            DataType::Double => 10,
            DataType::Boolean => 11,
            DataType::String => 12,
            DataType::DateTime => 13,
            DataType::Text => 14,
            DataType::Uuid => 15,
            DataType::DataSet => 16,
            DataType::Bytes => 17,
            DataType::File => 18,
            DataType::Template => 19,
            DataType::PropertySet => 20,
            DataType::PropertySetList => 21,
            DataType::Unknown(tag) => tag,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, DataType::Unknown(_))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int8 => "Int8",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::UInt8 => "UInt8",
            DataType::UInt16 => "UInt16",
            DataType::UInt32 => "UInt32",
            DataType::UInt64 => "UInt64",
            DataType::Float => "Float",
            DataType::Double => "Double",
            DataType::Boolean => "Boolean",
            DataType::String => "String",
            DataType::DateTime => "DateTime",
            DataType::Text => "Text",
            DataType::Uuid => "UUID",
            DataType::DataSet => "DataSet",
            DataType::Bytes => "Bytes",
            DataType::File => "File",
            DataType::Template => "Template",
            DataType::PropertySet => "PropertySet",
            DataType::PropertySetList => "PropertySetList",
            DataType::Unknown(tag) => return write!(f, "Unknown({tag})"),
        };
        f.write_str(name)
    }
}

impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Decoded metric value. Exactly one variant per metric; the declared
/// datatype decides which wire field it came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum MetricValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    /// Milliseconds since the Unix epoch.
    DateTime(u64),
    Bytes(Vec<u8>),
    DataSet(DataSet),
    Template(Template),
    PropertySet(PropertySet),
    #[default]
    Null,
}

impl MetricValue {
    /// Datatype a value maps to when a metric carries no tag of its own.
    pub fn natural_type(&self) -> Option<DataType> {
        Some(match self {
            MetricValue::Int8(_) => DataType::Int8,
            MetricValue::Int16(_) => DataType::Int16,
            MetricValue::Int32(_) => DataType::Int32,
            MetricValue::Int64(_) => DataType::Int64,
            MetricValue::UInt8(_) => DataType::UInt8,
            MetricValue::UInt16(_) => DataType::UInt16,
            MetricValue::UInt32(_) => DataType::UInt32,
            MetricValue::UInt64(_) => DataType::UInt64,
            MetricValue::Float(_) => DataType::Float,
            MetricValue::Double(_) => DataType::Double,
            MetricValue::Boolean(_) => DataType::Boolean,
            MetricValue::String(_) => DataType::String,
            MetricValue::DateTime(_) => DataType::DateTime,
            MetricValue::Bytes(_) => DataType::Bytes,
            MetricValue::DataSet(_) => DataType::DataSet,
            MetricValue::Template(_) => DataType::Template,
            MetricValue::PropertySet(_) => DataType::PropertySet,
            MetricValue::Null => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            MetricValue::Int8(v) => Some(f64::from(v)),
            MetricValue::Int16(v) => Some(f64::from(v)),
            MetricValue::Int32(v) => Some(f64::from(v)),
            MetricValue::Int64(v) => Some(v as f64),
            MetricValue::UInt8(v) => Some(f64::from(v)),
            MetricValue::UInt16(v) => Some(f64::from(v)),
            MetricValue::UInt32(v) => Some(f64::from(v)),
            MetricValue::UInt64(v) => Some(v as f64),
            MetricValue::Float(v) => Some(f64::from(v)),
            MetricValue::Double(v) => Some(v),
            MetricValue::Boolean(v) => Some(if v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// Scalar union shared by DataSet cells and Template parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Variant {
    Int(u32),
    Long(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    Null,
}

/// Ordered columnar table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataSet {
    pub num_of_columns: Option<u64>,
    pub columns: Vec<String>,
    pub types: Vec<DataType>,
    pub rows: Vec<Vec<Variant>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Template {
    pub version: Option<String>,
    pub metrics: Vec<Metric>,
    pub parameters: Vec<Parameter>,
    pub template_ref: Option<String>,
    pub is_definition: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: Option<String>,
    pub datatype: Option<DataType>,
    pub value: Variant,
}

/// Parallel key/value lists; keys and values pair up by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PropertySet {
    pub keys: Vec<String>,
    pub values: Vec<PropertyValue>,
}

impl PropertySet {
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.keys
            .iter()
            .position(|k| k == key)
            .and_then(|index| self.values.get(index))
    }

    pub fn len(&self) -> usize {
        self.keys.len().min(self.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyValue {
    pub datatype: Option<DataType>,
    pub is_null: bool,
    pub value: PropertyData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyData {
    Int(u32),
    Long(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    PropertySet(PropertySet),
    PropertySetList(Vec<PropertySet>),
    Null,
}
