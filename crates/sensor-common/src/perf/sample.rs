//! Decoding of `PERF_RECORD_SAMPLE` records produced by tracepoint events.

use std::collections::HashMap;

use bytes::{Buf, Bytes};
use thiserror::Error;

use super::tracefs::{FieldKind, TraceEventFormat};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("sample truncated: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("field {0} not found")]
    MissingField(String),
    #[error("field {field} is not {expected}")]
    UnexpectedType {
        field: String,
        expected: &'static str,
    },
    #[error("invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Sample of a tracepoint event, as laid out with
/// `PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU | PERF_SAMPLE_RAW`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    /// Kernel id of the event which produced the sample.
    pub id: u64,
    pub pid: u32,
    pub tid: u32,
    /// Monotonic timestamp in nanoseconds.
    pub time: u64,
    pub cpu: u32,
    /// Tracepoint record, starting with `common_type`.
    pub raw: Bytes,
}

impl SampleRecord {
    /// Parse the body of a sample record, the part following `perf_event_header`.
    pub fn parse(mut body: &[u8]) -> Result<Self, DecodeError> {
        need(body, 32)?;
        let id = body.get_u64_ne();
        let pid = body.get_u32_ne();
        let tid = body.get_u32_ne();
        let time = body.get_u64_ne();
        let cpu = body.get_u32_ne();
        let _reserved = body.get_u32_ne();
        need(body, 4)?;
        let size = body.get_u32_ne() as usize;
        need(body, size)?;
        let raw = Bytes::copy_from_slice(&body[..size]);
        Ok(Self {
            id,
            pid,
            tid,
            time,
            cpu,
            raw,
        })
    }
}

fn need(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Signed(i64),
    Unsigned(u64),
    String(String),
    Bytes(Bytes),
}

/// Fields of a tracepoint record, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceEventSampleData {
    fields: HashMap<String, FieldValue>,
}

impl TraceEventSampleData {
    /// Decode every field described by `format` out of a raw tracepoint record.
    pub fn decode(format: &TraceEventFormat, raw: &Bytes) -> Result<Self, DecodeError> {
        let mut fields = HashMap::with_capacity(format.fields.len());
        for field in &format.fields {
            let end = field.offset + field.size;
            need(raw, end)?;
            let bytes = &raw[field.offset..end];
            let value = match field.kind {
                FieldKind::Integer => integer(bytes, field.signed),
                FieldKind::CharArray => FieldValue::String(c_string(bytes)),
                FieldKind::DataLoc => {
                    let loc: [u8; 4] = bytes
                        .try_into()
                        .map_err(|_| unexpected(&field.name, "a data location"))?;
                    let loc = u32::from_ne_bytes(loc);
                    let start = (loc & 0xffff) as usize;
                    let len = ((loc >> 16) & 0xffff) as usize;
                    need(raw, start + len)?;
                    FieldValue::String(c_string(&raw[start..start + len]))
                }
                FieldKind::Bytes => FieldValue::Bytes(raw.slice(field.offset..end)),
            };
            fields.insert(field.name.clone(), value);
        }
        Ok(Self { fields })
    }

    fn field(&self, name: &str) -> Result<&FieldValue, DecodeError> {
        self.fields
            .get(name)
            .ok_or_else(|| DecodeError::MissingField(name.to_string()))
    }

    pub fn signed(&self, name: &str) -> Result<i64, DecodeError> {
        match self.field(name)? {
            FieldValue::Signed(value) => Ok(*value),
            FieldValue::Unsigned(value) => Ok(*value as i64),
            _ => Err(unexpected(name, "an integer")),
        }
    }

    pub fn unsigned(&self, name: &str) -> Result<u64, DecodeError> {
        match self.field(name)? {
            FieldValue::Unsigned(value) => Ok(*value),
            FieldValue::Signed(value) => Ok(*value as u64),
            _ => Err(unexpected(name, "an integer")),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str, DecodeError> {
        match self.field(name)? {
            FieldValue::String(value) => Ok(value),
            _ => Err(unexpected(name, "a string")),
        }
    }

    /// Signed field that must fit a pid.
    pub fn pid(&self, name: &str) -> Result<i32, DecodeError> {
        let value = self.signed(name)?;
        i32::try_from(value).map_err(|err| DecodeError::InvalidValue {
            field: name.to_string(),
            reason: err.to_string(),
        })
    }
}

impl<K: Into<String>> FromIterator<(K, FieldValue)> for TraceEventSampleData {
    fn from_iter<I: IntoIterator<Item = (K, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }
}

fn unexpected(field: &str, expected: &'static str) -> DecodeError {
    DecodeError::UnexpectedType {
        field: field.to_string(),
        expected,
    }
}

fn integer(mut bytes: &[u8], signed: bool) -> FieldValue {
    match (bytes.len(), signed) {
        (1, true) => FieldValue::Signed(bytes.get_i8().into()),
        (2, true) => FieldValue::Signed(bytes.get_i16_ne().into()),
        (4, true) => FieldValue::Signed(bytes.get_i32_ne().into()),
        (8, true) => FieldValue::Signed(bytes.get_i64_ne()),
        (1, false) => FieldValue::Unsigned(bytes.get_u8().into()),
        (2, false) => FieldValue::Unsigned(bytes.get_u16_ne().into()),
        (4, false) => FieldValue::Unsigned(bytes.get_u32_ne().into()),
        (8, false) => FieldValue::Unsigned(bytes.get_u64_ne()),
        _ => FieldValue::Bytes(Bytes::copy_from_slice(bytes)),
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
