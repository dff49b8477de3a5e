//! Typed attribute values.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    xdr::{Decode, Encode, XdrBufMut, XdrReader},
};

/// Wire tag of [`Value::Int32`].
pub const TAG_INT32: i32 = 1;
/// Wire tag of [`Value::Int64`].
pub const TAG_INT64: i32 = 2;
/// Wire tag of [`Value::Float64`].
pub const TAG_FLOAT64: i32 = 3;
/// Wire tag of [`Value::String`].
pub const TAG_STRING: i32 = 4;
/// Wire tag of [`Value::Opaque`].
pub const TAG_OPAQUE: i32 = 5;

/// A notification attribute, Nack argument or connection option value.
///
/// Encoded as `[tag:int32][payload]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// IEEE-754 double.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Uninterpreted bytes.
    Opaque(Bytes),
}

impl Value {
    /// Wire tag for this value's type.
    pub fn tag(&self) -> i32 {
        match self {
            Self::Int32(_) => TAG_INT32,
            Self::Int64(_) => TAG_INT64,
            Self::Float64(_) => TAG_FLOAT64,
            Self::String(_) => TAG_STRING,
            Self::Opaque(_) => TAG_OPAQUE,
        }
    }

    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Numeric value widened to `f64`, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(value) => Some(f64::from(*value)),
            Self::Int64(value) => Some(*value as f64),
            Self::Float64(value) => Some(*value),
            Self::String(_) | Self::Opaque(_) => None,
        }
    }

    /// Integer value widened to `i64`, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(value) => Some(i64::from(*value)),
            Self::Int64(value) => Some(*value),
            _ => None,
        }
    }
}

impl Encode for Value {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.tag());
        match self {
            Self::Int32(value) => buf.put_i32(*value),
            Self::Int64(value) => buf.put_i64(*value),
            Self::Float64(value) => buf.put_f64(*value),
            Self::String(value) => buf.put_xdr_string(value),
            Self::Opaque(value) => buf.put_xdr_opaque(value),
        }
    }
}

impl Decode for Value {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        match reader.read_i32()? {
            TAG_INT32 => reader.read_i32().map(Self::Int32),
            TAG_INT64 => reader.read_i64().map(Self::Int64),
            TAG_FLOAT64 => reader.read_f64().map(Self::Float64),
            TAG_STRING => reader.read_string().map(Self::String),
            TAG_OPAQUE => reader.read_bytes().map(Self::Opaque),
            tag => Err(ProtocolError::CorruptValue(tag)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(value) => write!(f, "{value}"),
            Self::Int64(value) => write!(f, "{value}L"),
            Self::Float64(value) => write!(f, "{value:?}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Opaque(value) => write!(f, "[{}]", hex::encode(value)),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Opaque(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Opaque(Bytes::from(value))
    }
}

/// Write a counted list of values.
pub(crate) fn put_values(buf: &mut BytesMut, values: &[Value]) {
    buf.put_xdr_count(values.len());
    for value in values {
        value.encode(buf);
    }
}

/// Read a counted list of values.
pub(crate) fn read_values(reader: &mut XdrReader<'_>) -> Result<Vec<Value>> {
    // Smallest value is a tag plus a 4-byte payload.
    let count = reader.read_count(8)?;
    (0..count).map(|_| Value::decode(reader)).collect()
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::xdr::decode_from;

    fn round_trip(value: &Value) {
        let bytes = value.to_bytes();
        let (decoded, used) = decode_from::<Value>(&bytes).unwrap();
        assert_eq!(&decoded, value);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn every_type_round_trips() {
        round_trip(&Value::Int32(i32::MIN));
        round_trip(&Value::Int64(i64::MAX));
        round_trip(&Value::Float64(-0.5));
        round_trip(&Value::String(String::new()));
        round_trip(&Value::String("unaligned".into()));
        round_trip(&Value::Opaque(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn int32_layout() {
        assert_eq!(&Value::Int32(7).to_bytes()[..], &hex!("00 00 00 01 00 00 00 07"));
    }

    #[test]
    fn unknown_tag_is_corrupt_not_a_panic() {
        let input = hex!("00 00 00 09 00 00 00 00");
        assert_eq!(decode_from::<Value>(&input).unwrap_err(), ProtocolError::CorruptValue(9));
    }

    #[test]
    fn numeric_widening() {
        assert_eq!(Value::Int32(3).as_f64(), Some(3.0));
        assert_eq!(Value::Int64(-4).as_i64(), Some(-4));
        assert_eq!(Value::from("x").as_f64(), None);
    }
}
