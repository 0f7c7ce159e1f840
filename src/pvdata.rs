//! # Narrow PV Data Interface
//!
//! The generic PV Data type system is an external collaborator of this
//! crate; the protocol core only needs a small, well-defined slice of it:
//! field descriptors for introspection exchange, a value tree for operation
//! payloads, bitsets for change/overrun tracking, and the pvRequest
//! descriptor that selects sub-fields and operation options.
//!
//! This module is deliberately not an authoritative schema. It covers the
//! scalar kinds, scalar arrays and flat structures the client core and its
//! tests exercise; richer shapes belong to the full pvData collaborator.
//!
//! ## Partial serialization
//!
//! Get and monitor payloads carry a changed [`BitSet`] followed by data for
//! the selected fields only. Bit 0 addresses the whole structure; bit `i+1`
//! addresses top-level field `i`. Nested structures are transferred whole
//! as a single field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::wire::ByteBuf;

/// Scalar type kinds supported by the narrow interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
}

impl ScalarKind {
    fn code(self) -> u8 {
        match self {
            ScalarKind::Boolean => 0,
            ScalarKind::Byte => 1,
            ScalarKind::Short => 2,
            ScalarKind::Int => 3,
            ScalarKind::Long => 4,
            ScalarKind::Float => 5,
            ScalarKind::Double => 6,
            ScalarKind::String => 7,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ScalarKind::Boolean,
            1 => ScalarKind::Byte,
            2 => ScalarKind::Short,
            3 => ScalarKind::Int,
            4 => ScalarKind::Long,
            5 => ScalarKind::Float,
            6 => ScalarKind::Double,
            7 => ScalarKind::String,
            c => return Err(ClientError::bad_stream(format!("bad scalar kind {c}"))),
        })
    }
}

const TAG_SCALAR: u8 = 0x20;
const TAG_SCALAR_ARRAY: u8 = 0x30;
const TAG_STRUCTURE: u8 = 0x80;

/// Field type descriptor, exchanged via the per-connection introspection
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldDesc {
    Scalar(ScalarKind),
    ScalarArray(ScalarKind),
    Structure {
        type_id: String,
        fields: Vec<(String, FieldDesc)>,
    },
}

impl FieldDesc {
    /// Conventional descriptor for a structure holding one scalar `value`.
    pub fn scalar_value(kind: ScalarKind) -> FieldDesc {
        FieldDesc::Structure {
            type_id: "structure".into(),
            fields: vec![("value".into(), FieldDesc::Scalar(kind))],
        }
    }

    pub fn encode(&self, buf: &mut ByteBuf) {
        match self {
            FieldDesc::Scalar(kind) => buf.put_u8(TAG_SCALAR | kind.code()),
            FieldDesc::ScalarArray(kind) => buf.put_u8(TAG_SCALAR_ARRAY | kind.code()),
            FieldDesc::Structure { type_id, fields } => {
                buf.put_u8(TAG_STRUCTURE);
                buf.put_string(type_id);
                buf.put_size(fields.len());
                for (name, desc) in fields {
                    buf.put_string(name);
                    desc.encode(buf);
                }
            }
        }
    }

    pub fn decode(buf: &mut ByteBuf) -> Result<FieldDesc> {
        let tag = buf.get_u8()?;
        if tag == TAG_STRUCTURE {
            let type_id = buf.get_string()?;
            let count = buf.get_size()?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                let name = buf.get_string()?;
                fields.push((name, FieldDesc::decode(buf)?));
            }
            return Ok(FieldDesc::Structure { type_id, fields });
        }
        let kind = ScalarKind::from_code(tag & 0x0F)?;
        match tag & 0xF0 {
            TAG_SCALAR => Ok(FieldDesc::Scalar(kind)),
            TAG_SCALAR_ARRAY => Ok(FieldDesc::ScalarArray(kind)),
            t => Err(ClientError::bad_stream(format!("bad field tag 0x{t:02x}"))),
        }
    }

    /// Index of a named top-level field within a structure descriptor.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self {
            FieldDesc::Structure { fields, .. } => fields.iter().position(|(n, _)| n == name),
            _ => None,
        }
    }

    /// Descriptor of a named top-level field.
    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        match self {
            FieldDesc::Structure { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
            }
            _ => None,
        }
    }
}

/// Value tree matching [`FieldDesc`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i32>),
    StringArray(Vec<String>),
    Structure(Vec<(String, Value)>),
}

impl Value {
    /// Zero-initialised value for a descriptor; the base onto which masked
    /// deltas are applied.
    pub fn default_for(desc: &FieldDesc) -> Result<Value> {
        Ok(match desc {
            FieldDesc::Scalar(kind) => match kind {
                ScalarKind::Boolean => Value::Boolean(false),
                ScalarKind::Byte => Value::Byte(0),
                ScalarKind::Short => Value::Short(0),
                ScalarKind::Int => Value::Int(0),
                ScalarKind::Long => Value::Long(0),
                ScalarKind::Float => Value::Float(0.0),
                ScalarKind::Double => Value::Double(0.0),
                ScalarKind::String => Value::Str(String::new()),
            },
            FieldDesc::ScalarArray(kind) => match kind {
                ScalarKind::Double => Value::DoubleArray(Vec::new()),
                ScalarKind::Int => Value::IntArray(Vec::new()),
                ScalarKind::String => Value::StringArray(Vec::new()),
                k => {
                    return Err(ClientError::UsageError(format!(
                        "unsupported array element kind {k:?}"
                    )))
                }
            },
            FieldDesc::Structure { fields, .. } => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, d) in fields {
                    out.push((name.clone(), Value::default_for(d)?));
                }
                Value::Structure(out)
            }
        })
    }

    /// Borrow a named top-level field of a structure value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Structure(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Byte(v) => Some(*v as f64),
            Value::Short(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Derive the descriptor matching this value; used where a value
    /// travels with its own introspection (rpc arguments).
    pub fn infer_desc(&self) -> FieldDesc {
        match self {
            Value::Boolean(_) => FieldDesc::Scalar(ScalarKind::Boolean),
            Value::Byte(_) => FieldDesc::Scalar(ScalarKind::Byte),
            Value::Short(_) => FieldDesc::Scalar(ScalarKind::Short),
            Value::Int(_) => FieldDesc::Scalar(ScalarKind::Int),
            Value::Long(_) => FieldDesc::Scalar(ScalarKind::Long),
            Value::Float(_) => FieldDesc::Scalar(ScalarKind::Float),
            Value::Double(_) => FieldDesc::Scalar(ScalarKind::Double),
            Value::Str(_) => FieldDesc::Scalar(ScalarKind::String),
            Value::DoubleArray(_) => FieldDesc::ScalarArray(ScalarKind::Double),
            Value::IntArray(_) => FieldDesc::ScalarArray(ScalarKind::Int),
            Value::StringArray(_) => FieldDesc::ScalarArray(ScalarKind::String),
            Value::Structure(fields) => FieldDesc::Structure {
                type_id: "structure".into(),
                fields: fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.infer_desc()))
                    .collect(),
            },
        }
    }

    fn encode_leaf(&self, desc: &FieldDesc, buf: &mut ByteBuf) -> Result<()> {
        match (desc, self) {
            (FieldDesc::Scalar(ScalarKind::Boolean), Value::Boolean(v)) => {
                buf.put_u8(u8::from(*v))
            }
            (FieldDesc::Scalar(ScalarKind::Byte), Value::Byte(v)) => buf.put_i8(*v),
            (FieldDesc::Scalar(ScalarKind::Short), Value::Short(v)) => buf.put_i16(*v),
            (FieldDesc::Scalar(ScalarKind::Int), Value::Int(v)) => buf.put_i32(*v),
            (FieldDesc::Scalar(ScalarKind::Long), Value::Long(v)) => buf.put_i64(*v),
            (FieldDesc::Scalar(ScalarKind::Float), Value::Float(v)) => buf.put_f32(*v),
            (FieldDesc::Scalar(ScalarKind::Double), Value::Double(v)) => buf.put_f64(*v),
            (FieldDesc::Scalar(ScalarKind::String), Value::Str(v)) => buf.put_string(v),
            (FieldDesc::ScalarArray(ScalarKind::Double), Value::DoubleArray(v)) => {
                buf.put_size(v.len());
                for x in v {
                    buf.put_f64(*x);
                }
            }
            (FieldDesc::ScalarArray(ScalarKind::Int), Value::IntArray(v)) => {
                buf.put_size(v.len());
                for x in v {
                    buf.put_i32(*x);
                }
            }
            (FieldDesc::ScalarArray(ScalarKind::String), Value::StringArray(v)) => {
                buf.put_size(v.len());
                for x in v {
                    buf.put_string(x);
                }
            }
            (FieldDesc::Structure { .. }, Value::Structure(_)) => {
                self.encode_full(desc, buf)?;
            }
            _ => {
                return Err(ClientError::UsageError(format!(
                    "value does not match descriptor {desc:?}"
                )))
            }
        }
        Ok(())
    }

    fn decode_leaf(desc: &FieldDesc, buf: &mut ByteBuf) -> Result<Value> {
        Ok(match desc {
            FieldDesc::Scalar(ScalarKind::Boolean) => Value::Boolean(buf.get_u8()? != 0),
            FieldDesc::Scalar(ScalarKind::Byte) => Value::Byte(buf.get_i8()?),
            FieldDesc::Scalar(ScalarKind::Short) => Value::Short(buf.get_i16()?),
            FieldDesc::Scalar(ScalarKind::Int) => Value::Int(buf.get_i32()?),
            FieldDesc::Scalar(ScalarKind::Long) => Value::Long(buf.get_i64()?),
            FieldDesc::Scalar(ScalarKind::Float) => Value::Float(buf.get_f32()?),
            FieldDesc::Scalar(ScalarKind::Double) => Value::Double(buf.get_f64()?),
            FieldDesc::Scalar(ScalarKind::String) => Value::Str(buf.get_string()?),
            FieldDesc::ScalarArray(kind) => {
                let n = buf.get_size()?;
                match kind {
                    ScalarKind::Double => {
                        let mut v = Vec::with_capacity(n);
                        for _ in 0..n {
                            v.push(buf.get_f64()?);
                        }
                        Value::DoubleArray(v)
                    }
                    ScalarKind::Int => {
                        let mut v = Vec::with_capacity(n);
                        for _ in 0..n {
                            v.push(buf.get_i32()?);
                        }
                        Value::IntArray(v)
                    }
                    ScalarKind::String => {
                        let mut v = Vec::with_capacity(n);
                        for _ in 0..n {
                            v.push(buf.get_string()?);
                        }
                        Value::StringArray(v)
                    }
                    k => {
                        return Err(ClientError::bad_stream(format!(
                            "unsupported array element kind {k:?}"
                        )))
                    }
                }
            }
            FieldDesc::Structure { .. } => Value::decode_full(desc, buf)?,
        })
    }

    /// Serialize every field of a structure value in descriptor order.
    pub fn encode_full(&self, desc: &FieldDesc, buf: &mut ByteBuf) -> Result<()> {
        match (desc, self) {
            (FieldDesc::Structure { fields, .. }, Value::Structure(values)) => {
                if fields.len() != values.len() {
                    return Err(ClientError::UsageError(
                        "structure value does not match descriptor arity".into(),
                    ));
                }
                for ((_, d), (_, v)) in fields.iter().zip(values) {
                    v.encode_leaf(d, buf)?;
                }
                Ok(())
            }
            _ => self.encode_leaf(desc, buf),
        }
    }

    pub fn decode_full(desc: &FieldDesc, buf: &mut ByteBuf) -> Result<Value> {
        match desc {
            FieldDesc::Structure { fields, .. } => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, d) in fields {
                    values.push((name.clone(), Value::decode_leaf(d, buf)?));
                }
                Ok(Value::Structure(values))
            }
            _ => Value::decode_leaf(desc, buf),
        }
    }

    /// Serialize the fields selected by `changed` (bit 0 = everything).
    pub fn encode_masked(&self, desc: &FieldDesc, changed: &BitSet, buf: &mut ByteBuf) -> Result<()> {
        if changed.get(0) {
            return self.encode_full(desc, buf);
        }
        match (desc, self) {
            (FieldDesc::Structure { fields, .. }, Value::Structure(values)) => {
                for (i, ((_, d), (_, v))) in fields.iter().zip(values).enumerate() {
                    if changed.get(i + 1) {
                        v.encode_leaf(d, buf)?;
                    }
                }
                Ok(())
            }
            _ => Err(ClientError::UsageError(
                "masked serialization requires a structure".into(),
            )),
        }
    }

    /// Apply a masked payload onto this value in place.
    pub fn apply_masked(
        &mut self,
        desc: &FieldDesc,
        changed: &BitSet,
        buf: &mut ByteBuf,
    ) -> Result<()> {
        if changed.get(0) {
            *self = Value::decode_full(desc, buf)?;
            return Ok(());
        }
        match (desc, self) {
            (FieldDesc::Structure { fields, .. }, Value::Structure(values)) => {
                for (i, ((_, d), slot)) in fields.iter().zip(values.iter_mut()).enumerate() {
                    if changed.get(i + 1) {
                        slot.1 = Value::decode_leaf(d, buf)?;
                    }
                }
                Ok(())
            }
            _ => Err(ClientError::bad_stream(
                "masked payload for a non-structure value",
            )),
        }
    }
}

/// Grow-able bit vector used for changed/overrun tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        BitSet::default()
    }

    pub fn with_bit(bit: usize) -> Self {
        let mut s = BitSet::new();
        s.set(bit);
        s
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 64);
    }

    pub fn clear(&mut self, bit: usize) {
        if let Some(w) = self.words.get_mut(bit / 64) {
            *w &= !(1 << (bit % 64));
        }
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .map_or(false, |w| w & (1 << (bit % 64)) != 0)
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// OR another bitset into this one.
    pub fn or_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self
            .words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes
    }

    pub fn encode(&self, buf: &mut ByteBuf) {
        let bytes = self.to_bytes();
        buf.put_size(bytes.len());
        buf.put_slice(&bytes);
    }

    pub fn decode(buf: &mut ByteBuf) -> Result<BitSet> {
        let n = buf.get_size()?;
        let bytes = buf.get_slice(n)?;
        let mut words = vec![0u64; (n + 7) / 8];
        for (i, b) in bytes.iter().enumerate() {
            words[i / 8] |= (*b as u64) << ((i % 8) * 8);
        }
        Ok(BitSet { words })
    }
}

/// Parsed pvRequest descriptor.
///
/// Accepts the textual form used throughout PVA tooling, e.g. `"field()"`,
/// `"field(value,alarm)"` or `"record[queueSize=4,pipeline=true]field()"`.
/// An empty field list selects the full structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvRequest {
    raw: String,
    fields: Vec<String>,
    options: BTreeMap<String, String>,
}

impl Default for PvRequest {
    fn default() -> Self {
        // Unwrap is fine: the default request text is well-formed.
        PvRequest::parse("field()").expect("default pvRequest")
    }
}

impl PvRequest {
    pub fn parse(text: &str) -> Result<PvRequest> {
        let raw = text.trim().to_string();
        let mut options = BTreeMap::new();
        let mut fields = Vec::new();
        let mut rest = raw.as_str();

        if let Some(body) = rest.strip_prefix("record[") {
            let end = body.find(']').ok_or_else(|| {
                ClientError::UsageError(format!("unterminated record options in {raw:?}"))
            })?;
            for pair in body[..end].split(',').filter(|p| !p.trim().is_empty()) {
                let (k, v) = pair.split_once('=').ok_or_else(|| {
                    ClientError::UsageError(format!("bad record option {pair:?}"))
                })?;
                options.insert(k.trim().to_string(), v.trim().to_string());
            }
            rest = &body[end + 1..];
        }

        let rest = rest.trim();
        if !rest.is_empty() {
            let body = rest
                .strip_prefix("field(")
                .and_then(|b| b.strip_suffix(')'))
                .ok_or_else(|| {
                    ClientError::UsageError(format!("malformed pvRequest {raw:?}"))
                })?;
            for f in body.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                fields.push(f.to_string());
            }
        }

        Ok(PvRequest {
            raw,
            fields,
            options,
        })
    }

    pub fn text(&self) -> &str {
        &self.raw
    }

    /// Selected top-level field names; empty means the full structure.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Monitor queue size option; protocol default is 2.
    pub fn queue_size(&self) -> usize {
        self.option("queueSize")
            .and_then(|v| v.parse().ok())
            .unwrap_or(2)
    }

    /// Whether monitor flow-control acknowledgements are requested.
    pub fn pipeline(&self) -> bool {
        self.option("pipeline").map_or(false, |v| v == "true")
    }

    /// Percentage of the queue that must be released before an ack is
    /// sent; default 50.
    pub fn ack_percent(&self) -> u32 {
        self.option("ackAny")
            .and_then(|v| v.trim_end_matches('%').parse().ok())
            .unwrap_or(50)
    }

    pub fn encode(&self, buf: &mut ByteBuf) {
        buf.put_string(&self.raw);
    }

    pub fn decode(buf: &mut ByteBuf) -> Result<PvRequest> {
        let raw = buf.get_string()?;
        PvRequest::parse(&raw)
    }
}
