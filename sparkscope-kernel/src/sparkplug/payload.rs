//! Sparkplug B payload model with its protobuf decoder and encoder.
//!
//! Field numbers follow the Sparkplug B `Payload` schema. Decoding is pure:
//! the same bytes always yield the same `Payload` or the same `DecodeError`.

use super::types::{
    DataSet, DataType, MetricValue, Parameter, PropertyData, PropertySet, PropertyValue, Template,
    Variant,
};
use super::wire::{WireReader, WireWriter, FIXED32, FIXED64, LEN, VARINT};
use crate::error::DecodeError;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Payload {
    pub timestamp: Option<u64>,
    pub metrics: Vec<Metric>,
    pub seq: Option<u64>,
    pub uuid: Option<String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metric {
    pub name: Option<String>,
    pub alias: Option<u64>,
    pub timestamp: Option<u64>,
    pub datatype: Option<DataType>,
    pub is_historical: bool,
    pub is_transient: bool,
    pub is_null: bool,
    pub metadata: Option<MetaData>,
    pub properties: Option<PropertySet>,
    pub value: MetricValue,
}

impl Metric {
    pub fn new(name: impl Into<String>, datatype: DataType, value: MetricValue) -> Self {
        Self {
            name: Some(name.into()),
            datatype: Some(datatype),
            value,
            ..Self::default()
        }
    }

    pub fn with_alias(mut self, alias: u64) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn datatype_name(&self) -> String {
        self.datatype
            .map(|d| d.to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetaData {
    pub is_multi_part: Option<bool>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub seq: Option<u64>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub md5: Option<String>,
    pub description: Option<String>,
}

/// The oneof `value` field of a metric as found on the wire, before the
/// datatype tag is applied.
enum RawValue {
    Int(u32),
    Long(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
    DataSet(DataSet),
    Template(Template),
    Extension(PropertySet),
}

impl RawValue {
    fn field_name(&self) -> &'static str {
        match self {
            RawValue::Int(_) => "int_value",
            RawValue::Long(_) => "long_value",
            RawValue::Float(_) => "float_value",
            RawValue::Double(_) => "double_value",
            RawValue::Boolean(_) => "boolean_value",
            RawValue::String(_) => "string_value",
            RawValue::Bytes(_) => "bytes_value",
            RawValue::DataSet(_) => "dataset_value",
            RawValue::Template(_) => "template_value",
            RawValue::Extension(_) => "extension_value",
        }
    }

    fn into_natural(self) -> MetricValue {
        match self {
            RawValue::Int(v) => MetricValue::UInt32(v),
            RawValue::Long(v) => MetricValue::UInt64(v),
            RawValue::Float(v) => MetricValue::Float(v),
            RawValue::Double(v) => MetricValue::Double(v),
            RawValue::Boolean(v) => MetricValue::Boolean(v),
            RawValue::String(v) => MetricValue::String(v),
            RawValue::Bytes(v) => MetricValue::Bytes(v),
            RawValue::DataSet(v) => MetricValue::DataSet(v),
            RawValue::Template(v) => MetricValue::Template(v),
            RawValue::Extension(v) => MetricValue::PropertySet(v),
        }
    }
}

/// Decodes a Sparkplug B payload.
pub fn decode(bytes: &[u8]) -> Result<Payload, DecodeError> {
    let mut reader = WireReader::new(bytes);
    let mut payload = Payload::default();

    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, VARINT) => payload.timestamp = Some(reader.read_varint()?),
            (2, LEN) => payload.metrics.push(decode_metric(&mut reader.read_message()?, 0)?),
            (3, VARINT) => payload.seq = Some(reader.read_varint()?),
            (4, LEN) => payload.uuid = Some(reader.read_string(field)?),
            (5, LEN) => payload.body = Some(reader.read_slice()?.to_vec()),
            (1..=5, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }

    Ok(payload)
}

/// Encodes a payload; `decode(&encode(p)) == p` for any payload whose metric
/// values agree with their datatypes.
pub fn encode(payload: &Payload) -> Vec<u8> {
    let mut writer = WireWriter::new();
    if let Some(timestamp) = payload.timestamp {
        writer.uint64(1, timestamp);
    }
    for metric in &payload.metrics {
        writer.message(2, |w| encode_metric(w, metric));
    }
    if let Some(seq) = payload.seq {
        writer.uint64(3, seq);
    }
    if let Some(uuid) = &payload.uuid {
        writer.string(4, uuid);
    }
    if let Some(body) = &payload.body {
        writer.bytes(5, body);
    }
    writer.into_vec()
}

/// Deepest chain of metric, template and property-set messages accepted.
pub const MAX_NESTING: u32 = 64;

fn nested(depth: u32) -> Result<u32, DecodeError> {
    if depth >= MAX_NESTING {
        return Err(DecodeError::NestingTooDeep { limit: MAX_NESTING });
    }
    Ok(depth + 1)
}

/// Tags wider than 32 bits are never valid and stay unknown.
fn read_datatype(reader: &mut WireReader<'_>) -> Result<DataType, DecodeError> {
    let tag = reader.read_varint()?;
    Ok(u32::try_from(tag).map_or(DataType::Unknown(u32::MAX), DataType::from_tag))
}

fn decode_metric(reader: &mut WireReader<'_>, depth: u32) -> Result<Metric, DecodeError> {
    let depth = nested(depth)?;
    let mut metric = Metric::default();
    let mut raw = None;

    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, LEN) => metric.name = Some(reader.read_string(field)?),
            (2, VARINT) => metric.alias = Some(reader.read_varint()?),
            (3, VARINT) => metric.timestamp = Some(reader.read_varint()?),
            (4, VARINT) => metric.datatype = Some(read_datatype(reader)?),
            (5, VARINT) => metric.is_historical = reader.read_bool()?,
            (6, VARINT) => metric.is_transient = reader.read_bool()?,
            (7, VARINT) => metric.is_null = reader.read_bool()?,
            (8, LEN) => metric.metadata = Some(decode_metadata(&mut reader.read_message()?)?),
            (9, LEN) => metric.properties = Some(decode_property_set(&mut reader.read_message()?, depth)?),
            (10, VARINT) => raw = Some(RawValue::Int(reader.read_varint()? as u32)),
            (11, VARINT) => raw = Some(RawValue::Long(reader.read_varint()?)),
            (12, FIXED32) => raw = Some(RawValue::Float(f32::from_bits(reader.read_fixed32()?))),
            (13, FIXED64) => raw = Some(RawValue::Double(f64::from_bits(reader.read_fixed64()?))),
            (14, VARINT) => raw = Some(RawValue::Boolean(reader.read_bool()?)),
            (15, LEN) => raw = Some(RawValue::String(reader.read_string(field)?)),
            (16, LEN) => raw = Some(RawValue::Bytes(reader.read_slice()?.to_vec())),
            (17, LEN) => raw = Some(RawValue::DataSet(decode_dataset(&mut reader.read_message()?)?)),
            (18, LEN) => raw = Some(RawValue::Template(decode_template(&mut reader.read_message()?, depth)?)),
            (19, LEN) => {
                raw = Some(RawValue::Extension(decode_property_set(&mut reader.read_message()?, depth)?))
            }
            (1..=19, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }

    metric.value = resolve_value(&metric, raw)?;
    Ok(metric)
}

/// Applies the datatype tag to the raw oneof field. A known tag must match
/// the field it selects; unknown or missing tags keep the field as found.
fn resolve_value(metric: &Metric, raw: Option<RawValue>) -> Result<MetricValue, DecodeError> {
    let Some(raw) = raw else {
        return Ok(MetricValue::Null);
    };
    if metric.is_null {
        return Ok(MetricValue::Null);
    }
    let Some(datatype) = metric.datatype.filter(|d| d.is_known()) else {
        return Ok(raw.into_natural());
    };

    let name = || metric.name.clone().unwrap_or_default();
    let out_of_range = || DecodeError::OutOfRange {
        metric: name(),
        datatype: datatype.to_string(),
    };

    let value = match (datatype, raw) {
        (DataType::Int8, RawValue::Int(v)) => {
            MetricValue::Int8(i8::try_from(v as i32).map_err(|_| out_of_range())?)
        }
        (DataType::Int16, RawValue::Int(v)) => {
            MetricValue::Int16(i16::try_from(v as i32).map_err(|_| out_of_range())?)
        }
        (DataType::Int32, RawValue::Int(v)) => MetricValue::Int32(v as i32),
        (DataType::UInt8, RawValue::Int(v)) => {
            MetricValue::UInt8(u8::try_from(v).map_err(|_| out_of_range())?)
        }
        (DataType::UInt16, RawValue::Int(v)) => {
            MetricValue::UInt16(u16::try_from(v).map_err(|_| out_of_range())?)
        }
        (DataType::UInt32, RawValue::Int(v)) => MetricValue::UInt32(v),
        (DataType::Int64, RawValue::Long(v)) => MetricValue::Int64(v as i64),
        (DataType::UInt64, RawValue::Long(v)) => MetricValue::UInt64(v),
        (DataType::DateTime, RawValue::Long(v)) => MetricValue::DateTime(v),
        (DataType::Float, RawValue::Float(v)) => MetricValue::Float(v),
        (DataType::Double, RawValue::Double(v)) => MetricValue::Double(v),
        (DataType::Boolean, RawValue::Boolean(v)) => MetricValue::Boolean(v),
        (DataType::String | DataType::Text | DataType::Uuid, RawValue::String(v)) => {
            MetricValue::String(v)
        }
        (DataType::Bytes | DataType::File, RawValue::Bytes(v)) => MetricValue::Bytes(v),
        (DataType::DataSet, RawValue::DataSet(v)) => MetricValue::DataSet(v),
        (DataType::Template, RawValue::Template(v)) => MetricValue::Template(v),
        (DataType::PropertySet | DataType::PropertySetList, RawValue::Extension(v)) => {
            MetricValue::PropertySet(v)
        }
        (_, raw) => {
            return Err(DecodeError::ValueMismatch {
                metric: name(),
                datatype: datatype.to_string(),
                found: raw.field_name(),
            })
        }
    };
    Ok(value)
}

fn encode_metric(w: &mut WireWriter, metric: &Metric) {
    if let Some(name) = &metric.name {
        w.string(1, name);
    }
    if let Some(alias) = metric.alias {
        w.uint64(2, alias);
    }
    if let Some(timestamp) = metric.timestamp {
        w.uint64(3, timestamp);
    }
    if let Some(datatype) = metric.datatype {
        w.uint32(4, datatype.tag());
    }
    if metric.is_historical {
        w.boolean(5, true);
    }
    if metric.is_transient {
        w.boolean(6, true);
    }
    if metric.is_null {
        w.boolean(7, true);
    }
    if let Some(metadata) = &metric.metadata {
        w.message(8, |w| encode_metadata(w, metadata));
    }
    if let Some(properties) = &metric.properties {
        w.message(9, |w| encode_property_set(w, properties));
    }

    match &metric.value {
        MetricValue::Int8(v) => w.uint32(10, i32::from(*v) as u32),
        MetricValue::Int16(v) => w.uint32(10, i32::from(*v) as u32),
        MetricValue::Int32(v) => w.uint32(10, *v as u32),
        MetricValue::UInt8(v) => w.uint32(10, u32::from(*v)),
        MetricValue::UInt16(v) => w.uint32(10, u32::from(*v)),
        MetricValue::UInt32(v) => w.uint32(10, *v),
        MetricValue::Int64(v) => w.uint64(11, *v as u64),
        MetricValue::UInt64(v) | MetricValue::DateTime(v) => w.uint64(11, *v),
        MetricValue::Float(v) => w.float(12, *v),
        MetricValue::Double(v) => w.double(13, *v),
        MetricValue::Boolean(v) => w.boolean(14, *v),
        MetricValue::String(v) => w.string(15, v),
        MetricValue::Bytes(v) => w.bytes(16, v),
        MetricValue::DataSet(v) => w.message(17, |w| encode_dataset(w, v)),
        MetricValue::Template(v) => w.message(18, |w| encode_template(w, v)),
        MetricValue::PropertySet(v) => w.message(19, |w| encode_property_set(w, v)),
        MetricValue::Null => {}
    }
}

fn decode_metadata(reader: &mut WireReader<'_>) -> Result<MetaData, DecodeError> {
    let mut metadata = MetaData::default();
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, VARINT) => metadata.is_multi_part = Some(reader.read_bool()?),
            (2, LEN) => metadata.content_type = Some(reader.read_string(field)?),
            (3, VARINT) => metadata.size = Some(reader.read_varint()?),
            (4, VARINT) => metadata.seq = Some(reader.read_varint()?),
            (5, LEN) => metadata.file_name = Some(reader.read_string(field)?),
            (6, LEN) => metadata.file_type = Some(reader.read_string(field)?),
            (7, LEN) => metadata.md5 = Some(reader.read_string(field)?),
            (8, LEN) => metadata.description = Some(reader.read_string(field)?),
            (1..=8, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(metadata)
}

fn encode_metadata(w: &mut WireWriter, metadata: &MetaData) {
    if let Some(v) = metadata.is_multi_part {
        w.boolean(1, v);
    }
    if let Some(v) = &metadata.content_type {
        w.string(2, v);
    }
    if let Some(v) = metadata.size {
        w.uint64(3, v);
    }
    if let Some(v) = metadata.seq {
        w.uint64(4, v);
    }
    if let Some(v) = &metadata.file_name {
        w.string(5, v);
    }
    if let Some(v) = &metadata.file_type {
        w.string(6, v);
    }
    if let Some(v) = &metadata.md5 {
        w.string(7, v);
    }
    if let Some(v) = &metadata.description {
        w.string(8, v);
    }
}

fn decode_property_set(reader: &mut WireReader<'_>, depth: u32) -> Result<PropertySet, DecodeError> {
    let depth = nested(depth)?;
    let mut set = PropertySet::default();
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, LEN) => set.keys.push(reader.read_string(field)?),
            (2, LEN) => set.values.push(decode_property_value(&mut reader.read_message()?, depth)?),
            (1..=2, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(set)
}

fn encode_property_set(w: &mut WireWriter, set: &PropertySet) {
    for key in &set.keys {
        w.string(1, key);
    }
    for value in &set.values {
        w.message(2, |w| encode_property_value(w, value));
    }
}

fn decode_property_value(reader: &mut WireReader<'_>, depth: u32) -> Result<PropertyValue, DecodeError> {
    let mut value = PropertyValue {
        datatype: None,
        is_null: false,
        value: PropertyData::Null,
    };
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, VARINT) => value.datatype = Some(read_datatype(reader)?),
            (2, VARINT) => value.is_null = reader.read_bool()?,
            (3, VARINT) => value.value = PropertyData::Int(reader.read_varint()? as u32),
            (4, VARINT) => value.value = PropertyData::Long(reader.read_varint()?),
            (5, FIXED32) => value.value = PropertyData::Float(f32::from_bits(reader.read_fixed32()?)),
            (6, FIXED64) => {
                value.value = PropertyData::Double(f64::from_bits(reader.read_fixed64()?))
            }
            (7, VARINT) => value.value = PropertyData::Boolean(reader.read_bool()?),
            (8, LEN) => value.value = PropertyData::String(reader.read_string(field)?),
            (9, LEN) => {
                value.value =
                    PropertyData::PropertySet(decode_property_set(&mut reader.read_message()?, depth)?)
            }
            (10, LEN) => {
                let mut list = reader.read_message()?;
                let mut sets = Vec::new();
                while list.has_remaining() {
                    let (field, wire_type) = list.read_key()?;
                    match (field, wire_type) {
                        (1, LEN) => sets.push(decode_property_set(&mut list.read_message()?, depth)?),
                        (1, _) => return Err(DecodeError::WireType { field, wire_type }),
                        _ => list.skip(field, wire_type)?,
                    }
                }
                value.value = PropertyData::PropertySetList(sets);
            }
            (1..=10, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(value)
}

fn encode_property_value(w: &mut WireWriter, value: &PropertyValue) {
    if let Some(datatype) = value.datatype {
        w.uint32(1, datatype.tag());
    }
    if value.is_null {
        w.boolean(2, true);
    }
    match &value.value {
        PropertyData::Int(v) => w.uint32(3, *v),
        PropertyData::Long(v) => w.uint64(4, *v),
        PropertyData::Float(v) => w.float(5, *v),
        PropertyData::Double(v) => w.double(6, *v),
        PropertyData::Boolean(v) => w.boolean(7, *v),
        PropertyData::String(v) => w.string(8, v),
        PropertyData::PropertySet(v) => w.message(9, |w| encode_property_set(w, v)),
        PropertyData::PropertySetList(sets) => w.message(10, |w| {
            for set in sets {
                w.message(1, |w| encode_property_set(w, set));
            }
        }),
        PropertyData::Null => {}
    }
}

/// Reads one variant slot. DataSet cells use slots 1-6 directly, template
/// parameters shift them by two (fields 3-8).
fn read_variant(
    reader: &mut WireReader<'_>,
    slot: u32,
    field: u32,
    wire_type: u8,
) -> Result<Variant, DecodeError> {
    Ok(match (slot, wire_type) {
        (1, VARINT) => Variant::Int(reader.read_varint()? as u32),
        (2, VARINT) => Variant::Long(reader.read_varint()?),
        (3, FIXED32) => Variant::Float(f32::from_bits(reader.read_fixed32()?)),
        (4, FIXED64) => Variant::Double(f64::from_bits(reader.read_fixed64()?)),
        (5, VARINT) => Variant::Boolean(reader.read_bool()?),
        (6, LEN) => Variant::String(reader.read_string(field)?),
        _ => return Err(DecodeError::WireType { field, wire_type }),
    })
}

fn write_variant(w: &mut WireWriter, base: u32, value: &Variant) {
    match value {
        Variant::Int(v) => w.uint32(base + 1, *v),
        Variant::Long(v) => w.uint64(base + 2, *v),
        Variant::Float(v) => w.float(base + 3, *v),
        Variant::Double(v) => w.double(base + 4, *v),
        Variant::Boolean(v) => w.boolean(base + 5, *v),
        Variant::String(v) => w.string(base + 6, v),
        Variant::Null => {}
    }
}

fn decode_dataset(reader: &mut WireReader<'_>) -> Result<DataSet, DecodeError> {
    let mut dataset = DataSet::default();
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, VARINT) => dataset.num_of_columns = Some(reader.read_varint()?),
            (2, LEN) => dataset.columns.push(reader.read_string(field)?),
            (3, VARINT) => dataset.types.push(read_datatype(reader)?),
            (3, LEN) => {
                // packed encoding
                let mut packed = reader.read_message()?;
                while packed.has_remaining() {
                    dataset.types.push(read_datatype(&mut packed)?);
                }
            }
            (4, LEN) => dataset.rows.push(decode_row(&mut reader.read_message()?)?),
            (1..=4, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(dataset)
}

fn decode_row(reader: &mut WireReader<'_>) -> Result<Vec<Variant>, DecodeError> {
    let mut elements = Vec::new();
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, LEN) => {
                let mut element = reader.read_message()?;
                let mut value = Variant::Null;
                while element.has_remaining() {
                    let (field, wire_type) = element.read_key()?;
                    if (1..=6).contains(&field) {
                        value = read_variant(&mut element, field, field, wire_type)?;
                    } else {
                        element.skip(field, wire_type)?;
                    }
                }
                elements.push(value);
            }
            (1, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(elements)
}

fn encode_dataset(w: &mut WireWriter, dataset: &DataSet) {
    if let Some(columns) = dataset.num_of_columns {
        w.uint64(1, columns);
    }
    for column in &dataset.columns {
        w.string(2, column);
    }
    for datatype in &dataset.types {
        w.uint32(3, datatype.tag());
    }
    for row in &dataset.rows {
        w.message(4, |w| {
            for element in row {
                w.message(1, |w| write_variant(w, 0, element));
            }
        });
    }
}

fn decode_template(reader: &mut WireReader<'_>, depth: u32) -> Result<Template, DecodeError> {
    let depth = nested(depth)?;
    let mut template = Template::default();
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, LEN) => template.version = Some(reader.read_string(field)?),
            (2, LEN) => template.metrics.push(decode_metric(&mut reader.read_message()?, depth)?),
            (3, LEN) => template.parameters.push(decode_parameter(&mut reader.read_message()?)?),
            (4, LEN) => template.template_ref = Some(reader.read_string(field)?),
            (5, VARINT) => template.is_definition = reader.read_bool()?,
            (1..=5, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(template)
}

fn encode_template(w: &mut WireWriter, template: &Template) {
    if let Some(version) = &template.version {
        w.string(1, version);
    }
    for metric in &template.metrics {
        w.message(2, |w| encode_metric(w, metric));
    }
    for parameter in &template.parameters {
        w.message(3, |w| {
            if let Some(name) = &parameter.name {
                w.string(1, name);
            }
            if let Some(datatype) = parameter.datatype {
                w.uint32(2, datatype.tag());
            }
            write_variant(w, 2, &parameter.value);
        });
    }
    if let Some(template_ref) = &template.template_ref {
        w.string(4, template_ref);
    }
    if template.is_definition {
        w.boolean(5, true);
    }
}

fn decode_parameter(reader: &mut WireReader<'_>) -> Result<Parameter, DecodeError> {
    let mut parameter = Parameter {
        name: None,
        datatype: None,
        value: Variant::Null,
    };
    while reader.has_remaining() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, LEN) => parameter.name = Some(reader.read_string(field)?),
            (2, VARINT) => parameter.datatype = Some(read_datatype(reader)?),
            (3..=8, _) => parameter.value = read_variant(reader, field - 2, field, wire_type)?,
            (1..=2, _) => return Err(DecodeError::WireType { field, wire_type }),
            _ => reader.skip(field, wire_type)?,
        }
    }
    Ok(parameter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> Metric {
        Metric::new("Temp", DataType::Int32, MetricValue::Int32(-21))
            .with_alias(7)
            .with_timestamp(1_700_000_000_000)
    }

    #[test]
    fn test_round_trip_scalar_metrics() {
        let payload = Payload {
            timestamp: Some(1_700_000_000_123),
            seq: Some(4),
            uuid: Some("abc-123".into()),
            metrics: vec![
                temperature(),
                Metric::new("Small", DataType::Int8, MetricValue::Int8(-3)),
                Metric::new("Port", DataType::UInt16, MetricValue::UInt16(502)),
                Metric::new("Count", DataType::Int64, MetricValue::Int64(-9_000_000_000)),
                Metric::new("Pressure", DataType::Double, MetricValue::Double(1.25)),
                Metric::new("Ratio", DataType::Float, MetricValue::Float(0.5)),
                Metric::new("Running", DataType::Boolean, MetricValue::Boolean(true)),
                Metric::new("Label", DataType::Text, MetricValue::String("line 4".into())),
                Metric::new("Boot", DataType::DateTime, MetricValue::DateTime(1_699_999_999_000)),
                Metric::new("Blob", DataType::Bytes, MetricValue::Bytes(vec![0, 1, 2, 255])),
            ],
            body: Some(vec![9, 9]),
        };

        let decoded = decode(&encode(&payload)).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_round_trip_nested_structures() {
        let dataset = DataSet {
            num_of_columns: Some(2),
            columns: vec!["id".into(), "name".into()],
            types: vec![DataType::Int32, DataType::String],
            rows: vec![
                vec![Variant::Int(1), Variant::String("pump".into())],
                vec![Variant::Int(2), Variant::Null],
            ],
        };
        let template = Template {
            version: Some("1.0".into()),
            metrics: vec![temperature()],
            parameters: vec![Parameter {
                name: Some("limit".into()),
                datatype: Some(DataType::Double),
                value: Variant::Double(99.5),
            }],
            template_ref: Some("Motor".into()),
            is_definition: false,
        };
        let properties = PropertySet {
            keys: vec!["engUnit".into(), "nested".into()],
            values: vec![
                PropertyValue {
                    datatype: Some(DataType::String),
                    is_null: false,
                    value: PropertyData::String("degC".into()),
                },
                PropertyValue {
                    datatype: Some(DataType::PropertySetList),
                    is_null: false,
                    value: PropertyData::PropertySetList(vec![PropertySet::default()]),
                },
            ],
        };

        let mut with_props = temperature();
        with_props.properties = Some(properties);
        with_props.metadata = Some(MetaData {
            content_type: Some("text/plain".into()),
            size: Some(12),
            ..MetaData::default()
        });

        let payload = Payload {
            metrics: vec![
                Metric::new("Table", DataType::DataSet, MetricValue::DataSet(dataset)),
                Metric::new("Motor1", DataType::Template, MetricValue::Template(template)),
                with_props,
            ],
            ..Payload::default()
        };

        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn test_null_flag_wins_over_value_field() {
        let mut metric = Metric::new("Gone", DataType::Int32, MetricValue::Null);
        metric.is_null = true;
        let payload = Payload {
            metrics: vec![metric],
            ..Payload::default()
        };
        let decoded = decode(&encode(&payload)).unwrap();
        assert_eq!(decoded.metrics[0].value, MetricValue::Null);
        assert!(decoded.metrics[0].is_null);
    }

    #[test]
    fn test_alias_only_metric_keeps_natural_value() {
        let mut writer = WireWriter::new();
        writer.message(2, |w| {
            w.uint64(2, 7);
            w.double(13, 3.5);
        });
        let decoded = decode(&writer.into_vec()).unwrap();
        let metric = &decoded.metrics[0];
        assert_eq!(metric.name, None);
        assert_eq!(metric.alias, Some(7));
        assert_eq!(metric.value, MetricValue::Double(3.5));
    }

    #[test]
    fn test_datatype_mismatch_is_rejected() {
        let mut writer = WireWriter::new();
        writer.message(2, |w| {
            w.string(1, "Temp");
            w.uint32(4, DataType::Double.tag());
            w.uint32(10, 5);
        });
        let err = decode(&writer.into_vec()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ValueMismatch {
                metric: "Temp".into(),
                datatype: "Double".into(),
                found: "int_value",
            }
        );
    }

    #[test]
    fn test_out_of_range_narrow_type() {
        let mut writer = WireWriter::new();
        writer.message(2, |w| {
            w.string(1, "Byte");
            w.uint32(4, DataType::UInt8.tag());
            w.uint32(10, 300);
        });
        assert!(matches!(
            decode(&writer.into_vec()),
            Err(DecodeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut writer = WireWriter::new();
        writer.uint64(1, 10);
        writer.string(42, "future extension");
        writer.uint64(3, 2);
        let decoded = decode(&writer.into_vec()).unwrap();
        assert_eq!(decoded.timestamp, Some(10));
        assert_eq!(decoded.seq, Some(2));
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(decode(&[0x12, 0x7f, 0x01]).is_err());
        assert!(decode(&[0x08]).is_err());
        // payload.timestamp sent as a length-delimited field
        assert!(matches!(
            decode(&[0x0a, 0x00]),
            Err(DecodeError::WireType { field: 1, wire_type: 2 })
        ));
    }

    #[test]
    fn test_packed_dataset_types() {
        let mut writer = WireWriter::new();
        writer.message(2, |w| {
            w.string(1, "T");
            w.uint32(4, DataType::DataSet.tag());
            w.message(17, |w| {
                w.uint64(1, 2);
                // packed repeated uint32: [3, 12]
                w.bytes(3, &[3, 12]);
            });
        });
        let decoded = decode(&writer.into_vec()).unwrap();
        match &decoded.metrics[0].value {
            MetricValue::DataSet(dataset) => {
                assert_eq!(dataset.types, vec![DataType::Int32, DataType::String])
            }
            other => panic!("expected dataset, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_decodes() {
        assert_eq!(decode(&[]).unwrap(), Payload::default());
    }
    fn nested_property_sets(levels: usize) -> Vec<u8> {
        let mut set = Vec::new();
        for _ in 0..levels {
            let mut value = WireWriter::new();
            value.bytes(9, &set);
            let mut outer = WireWriter::new();
            outer.bytes(2, &value.into_vec());
            set = outer.into_vec();
        }
        let mut writer = WireWriter::new();
        writer.message(2, |w| {
            w.string(1, "Deep");
            w.bytes(9, &set);
        });
        writer.into_vec()
    }

    #[test]
    fn test_nesting_within_limit_decodes() {
        let decoded = decode(&nested_property_sets(40)).unwrap();
        assert!(decoded.metrics[0].properties.is_some());
    }

    #[test]
    fn test_deep_property_sets_are_rejected() {
        assert_eq!(
            decode(&nested_property_sets(100)),
            Err(DecodeError::NestingTooDeep { limit: MAX_NESTING })
        );
        // far past any sane depth; must fail without exhausting the stack
        assert!(matches!(
            decode(&nested_property_sets(5_000)),
            Err(DecodeError::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn test_deep_templates_are_rejected() {
        let mut metric = Vec::new();
        for _ in 0..200 {
            let mut template = WireWriter::new();
            template.bytes(2, &metric);
            let mut outer = WireWriter::new();
            outer.bytes(18, &template.into_vec());
            metric = outer.into_vec();
        }
        let mut writer = WireWriter::new();
        writer.bytes(2, &metric);
        assert!(matches!(
            decode(&writer.into_vec()),
            Err(DecodeError::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn test_oversized_datatype_tag_stays_unknown() {
        let mut writer = WireWriter::new();
        writer.message(2, |w| {
            w.string(1, "Wide");
            w.uint64(4, (1u64 << 32) | 3);
            w.uint32(10, 7);
        });
        let decoded = decode(&writer.into_vec()).unwrap();
        assert_eq!(decoded.metrics[0].datatype, Some(DataType::Unknown(u32::MAX)));
        assert_eq!(decoded.metrics[0].value, MetricValue::UInt32(7));
    }
}
