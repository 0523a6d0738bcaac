//! Tag-prefixed value codec
//!
//! Every encoded value is one type tag byte followed by the big-endian body.
//! Fixed-width types must decode from exactly their width; strings and byte
//! arrays take the rest of the buffer.

use crate::error::{DefsError, Result};

/// A portable field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Architecture-neutral signed integer (stored as 8 bytes)
    Int(i64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    /// Architecture-neutral unsigned integer (stored as 8 bytes)
    Uint(u64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Complex64(f32, f32),
    Complex128(f64, f64),
}

/// Type tags on the wire
pub mod tag {
    pub const INT: u8 = 1;
    pub const INT8: u8 = 2;
    pub const INT16: u8 = 3;
    pub const INT32: u8 = 4;
    pub const INT64: u8 = 5;
    pub const UINT: u8 = 6;
    pub const UINT8: u8 = 7;
    pub const UINT16: u8 = 8;
    pub const UINT32: u8 = 9;
    pub const UINT64: u8 = 10;
    pub const FLOAT32: u8 = 11;
    pub const FLOAT64: u8 = 12;
    pub const STRING: u8 = 13;
    pub const BYTES: u8 = 14;
    pub const BOOL: u8 = 15;
    pub const COMPLEX64: u8 = 16;
    pub const COMPLEX128: u8 = 17;
}

/// Type name for a tag, or `None` when the tag is unknown
pub fn tag_name(t: u8) -> Option<&'static str> {
    Some(match t {
        tag::INT => "int",
        tag::INT8 => "int8",
        tag::INT16 => "int16",
        tag::INT32 => "int32",
        tag::INT64 => "int64",
        tag::UINT => "uint",
        tag::UINT8 => "uint8",
        tag::UINT16 => "uint16",
        tag::UINT32 => "uint32",
        tag::UINT64 => "uint64",
        tag::FLOAT32 => "float32",
        tag::FLOAT64 => "float64",
        tag::STRING => "string",
        tag::BYTES => "bytes",
        tag::BOOL => "bool",
        tag::COMPLEX64 => "complex64",
        tag::COMPLEX128 => "complex128",
        _ => return None,
    })
}

/// Fixed body width for a tag; `None` for variable-length types
fn fixed_width(t: u8) -> Option<usize> {
    match t {
        tag::INT8 | tag::UINT8 | tag::BOOL => Some(1),
        tag::INT16 | tag::UINT16 => Some(2),
        tag::INT32 | tag::UINT32 | tag::FLOAT32 => Some(4),
        tag::INT | tag::INT64 | tag::UINT | tag::UINT64 | tag::FLOAT64 | tag::COMPLEX64 => {
            Some(8)
        }
        tag::COMPLEX128 => Some(16),
        _ => None,
    }
}

impl Value {
    /// Wire tag of this value
    pub fn tag(&self) -> u8 {
        match self {
            Value::Int(_) => tag::INT,
            Value::Int8(_) => tag::INT8,
            Value::Int16(_) => tag::INT16,
            Value::Int32(_) => tag::INT32,
            Value::Int64(_) => tag::INT64,
            Value::Uint(_) => tag::UINT,
            Value::Uint8(_) => tag::UINT8,
            Value::Uint16(_) => tag::UINT16,
            Value::Uint32(_) => tag::UINT32,
            Value::Uint64(_) => tag::UINT64,
            Value::Float32(_) => tag::FLOAT32,
            Value::Float64(_) => tag::FLOAT64,
            Value::String(_) => tag::STRING,
            Value::Bytes(_) => tag::BYTES,
            Value::Bool(_) => tag::BOOL,
            Value::Complex64(..) => tag::COMPLEX64,
            Value::Complex128(..) => tag::COMPLEX128,
        }
    }

    /// Type name of this value
    pub fn type_name(&self) -> &'static str {
        tag_name(self.tag()).unwrap_or("unknown")
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Any signed integer variant widened to i64
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) | Value::Int64(v) => Some(v),
            Value::Int8(v) => Some(v as i64),
            Value::Int16(v) => Some(v as i64),
            Value::Int32(v) => Some(v as i64),
            _ => None,
        }
    }

    /// Any unsigned integer variant widened to u64
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(v) | Value::Uint64(v) => Some(v),
            Value::Uint8(v) => Some(v as u64),
            Value::Uint16(v) => Some(v as u64),
            Value::Uint32(v) => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// Encode a value as `tag || big-endian body`
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(value.tag());
    match value {
        Value::Int(v) | Value::Int64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Int8(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Int16(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Int32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Uint(v) | Value::Uint64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Uint8(v) => out.push(*v),
        Value::Uint16(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Uint32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Float32(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::Float64(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::String(s) => out.extend_from_slice(s.as_bytes()),
        Value::Bytes(b) => out.extend_from_slice(b),
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::Complex64(re, im) => {
            out.extend_from_slice(&re.to_bits().to_be_bytes());
            out.extend_from_slice(&im.to_bits().to_be_bytes());
        }
        Value::Complex128(re, im) => {
            out.extend_from_slice(&re.to_bits().to_be_bytes());
            out.extend_from_slice(&im.to_bits().to_be_bytes());
        }
    }
    out
}

/// Name of the type carried by an encoded buffer
pub fn type_of(bytes: &[u8]) -> Result<&'static str> {
    let t = *bytes
        .first()
        .ok_or(DefsError::InvalidLength {
            type_name: "tag",
            expected: 1,
            actual: 0,
        })?;
    tag_name(t).ok_or(DefsError::UnsupportedType(t))
}

/// Decode a tag-prefixed buffer
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let type_name = type_of(bytes)?;
    let t = bytes[0];
    let body = &bytes[1..];

    if let Some(width) = fixed_width(t) {
        if body.len() != width {
            return Err(DefsError::InvalidLength {
                type_name,
                expected: width,
                actual: body.len(),
            });
        }
    }

    let value = match t {
        tag::INT => Value::Int(i64::from_be_bytes(array(body))),
        tag::INT8 => Value::Int8(body[0] as i8),
        tag::INT16 => Value::Int16(i16::from_be_bytes(array(body))),
        tag::INT32 => Value::Int32(i32::from_be_bytes(array(body))),
        tag::INT64 => Value::Int64(i64::from_be_bytes(array(body))),
        tag::UINT => Value::Uint(u64::from_be_bytes(array(body))),
        tag::UINT8 => Value::Uint8(body[0]),
        tag::UINT16 => Value::Uint16(u16::from_be_bytes(array(body))),
        tag::UINT32 => Value::Uint32(u32::from_be_bytes(array(body))),
        tag::UINT64 => Value::Uint64(u64::from_be_bytes(array(body))),
        tag::FLOAT32 => Value::Float32(f32::from_bits(u32::from_be_bytes(array(body)))),
        tag::FLOAT64 => Value::Float64(f64::from_bits(u64::from_be_bytes(array(body)))),
        tag::STRING => Value::String(
            String::from_utf8(body.to_vec())
                .map_err(|e| DefsError::Serialization(format!("invalid utf-8 string: {}", e)))?,
        ),
        tag::BYTES => Value::Bytes(body.to_vec()),
        tag::BOOL => Value::Bool(body[0] != 0),
        tag::COMPLEX64 => Value::Complex64(
            f32::from_bits(u32::from_be_bytes(array(&body[..4]))),
            f32::from_bits(u32::from_be_bytes(array(&body[4..]))),
        ),
        tag::COMPLEX128 => Value::Complex128(
            f64::from_bits(u64::from_be_bytes(array(&body[..8]))),
            f64::from_bits(u64::from_be_bytes(array(&body[8..]))),
        ),
        other => return Err(DefsError::UnsupportedType(other)),
    };
    Ok(value)
}

/// Copy a slice whose length was already checked into a fixed array
fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_width_layout() {
        assert_eq!(encode(&Value::Uint16(0x0102)), vec![tag::UINT16, 0x01, 0x02]);
        assert_eq!(
            encode(&Value::Int32(-1)),
            vec![tag::INT32, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(encode(&Value::Bool(true)), vec![tag::BOOL, 1]);
        assert_eq!(encode(&Value::Int(1)).len(), 9);
        assert_eq!(encode(&Value::Complex128(1.0, 2.0)).len(), 17);
    }

    #[test]
    fn test_bool_nonzero_is_true() {
        assert_eq!(decode(&[tag::BOOL, 7]).unwrap(), Value::Bool(true));
        assert_eq!(decode(&[tag::BOOL, 0]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_invalid_length() {
        let err = decode(&[tag::INT32, 0, 0, 1]).unwrap_err();
        assert!(matches!(
            err,
            DefsError::InvalidLength {
                expected: 4,
                actual: 3,
                ..
            }
        ));

        let err = decode(&[tag::UINT8]).unwrap_err();
        assert!(matches!(err, DefsError::InvalidLength { .. }));
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            decode(&[99, 1, 2]),
            Err(DefsError::UnsupportedType(99))
        ));
        assert!(matches!(type_of(&[0]), Err(DefsError::UnsupportedType(0))));
    }

    #[test]
    fn test_empty_buffer() {
        assert!(matches!(decode(&[]), Err(DefsError::InvalidLength { .. })));
    }

    #[test]
    fn test_variable_length_types() {
        assert_eq!(decode(&[tag::STRING]).unwrap(), Value::String(String::new()));
        assert_eq!(
            decode(&encode(&Value::Bytes(vec![1, 2, 3]))).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_type_of() {
        assert_eq!(type_of(&encode(&Value::from("abc"))).unwrap(), "string");
        assert_eq!(type_of(&encode(&Value::Uint32(3))).unwrap(), "uint32");
        assert_eq!(
            type_of(&encode(&Value::Complex64(0.0, 1.0))).unwrap(),
            "complex64"
        );
    }

    fn any_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Int),
            any::<i8>().prop_map(Value::Int8),
            any::<i16>().prop_map(Value::Int16),
            any::<i32>().prop_map(Value::Int32),
            any::<i64>().prop_map(Value::Int64),
            any::<u64>().prop_map(Value::Uint),
            any::<u8>().prop_map(Value::Uint8),
            any::<u16>().prop_map(Value::Uint16),
            any::<u32>().prop_map(Value::Uint32),
            any::<u64>().prop_map(Value::Uint64),
            proptest::num::f32::NORMAL.prop_map(Value::Float32),
            proptest::num::f64::NORMAL.prop_map(Value::Float64),
            ".*".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
            any::<bool>().prop_map(Value::Bool),
            (proptest::num::f32::NORMAL, proptest::num::f32::NORMAL)
                .prop_map(|(a, b)| Value::Complex64(a, b)),
            (proptest::num::f64::NORMAL, proptest::num::f64::NORMAL)
                .prop_map(|(a, b)| Value::Complex128(a, b)),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(v in any_value()) {
            let bytes = encode(&v);
            prop_assert_eq!(decode(&bytes).unwrap(), v.clone());
            prop_assert_eq!(type_of(&bytes).unwrap(), v.type_name());
        }
    }
}
