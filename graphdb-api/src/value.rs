//! Tagged-union property value with a fixed binary layout.
//!
//! Each variant is encoded as a one-byte discriminant followed by a
//! fixed-width or length-prefixed payload. Equality is defined over
//! `(tag, raw-bytes)`, not over the decoded Rust value, so floats compare
//! by bit pattern rather than IEEE-754 semantics (two `NaN`s with the same
//! bits are equal; `+0.0` and `-0.0` are not).

use std::fmt;

/// Typed property value stored on nodes and edges.
#[derive(Debug, Clone)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Unix seconds.
    Timestamp(i64),
    Vector(Vec<f32>),
    StringArray(Vec<String>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    BoolArray(Vec<bool>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    String = 0,
    Int = 1,
    Float = 2,
    Bool = 3,
    Bytes = 4,
    Timestamp = 5,
    Vector = 6,
    StringArray = 7,
    IntArray = 8,
    FloatArray = 9,
    BoolArray = 10,
}

impl Tag {
    fn from_byte(b: u8) -> Option<Tag> {
        Some(match b {
            0 => Tag::String,
            1 => Tag::Int,
            2 => Tag::Float,
            3 => Tag::Bool,
            4 => Tag::Bytes,
            5 => Tag::Timestamp,
            6 => Tag::Vector,
            7 => Tag::StringArray,
            8 => Tag::IntArray,
            9 => Tag::FloatArray,
            10 => Tag::BoolArray,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Tag::String => "String",
            Tag::Int => "Int",
            Tag::Float => "Float",
            Tag::Bool => "Bool",
            Tag::Bytes => "Bytes",
            Tag::Timestamp => "Timestamp",
            Tag::Vector => "Vector",
            Tag::StringArray => "StringArray",
            Tag::IntArray => "IntArray",
            Tag::FloatArray => "FloatArray",
            Tag::BoolArray => "BoolArray",
        }
    }
}

/// Human-readable name for a [`Value::tag_byte`] discriminant, or `None`
/// for an unrecognized byte.
pub fn tag_name(tag_byte: u8) -> Option<&'static str> {
    Tag::from_byte(tag_byte).map(Tag::name)
}

/// Errors produced while decoding a [`Value`] from its wire form.
#[derive(Debug)]
pub enum DecodeError {
    Empty,
    UnknownTag(u8),
    /// The payload is too short, or a length prefix does not match the
    /// remaining bytes.
    MalformedValue,
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty value bytes"),
            DecodeError::UnknownTag(t) => write!(f, "unknown value tag: {t}"),
            DecodeError::MalformedValue => write!(f, "malformed value payload"),
            DecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 in string value"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Raised when a caller asks to decode or compare a value as a tag it is
/// not encoded as (e.g. reading an `Int` property as a `Vector`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongValueType {
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for WrongValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wrong value type: expected {}, found {}",
            self.expected, self.found
        )
    }
}

impl std::error::Error for WrongValueType {}

impl Value {
    fn tag(&self) -> Tag {
        match self {
            Value::String(_) => Tag::String,
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Bool(_) => Tag::Bool,
            Value::Bytes(_) => Tag::Bytes,
            Value::Timestamp(_) => Tag::Timestamp,
            Value::Vector(_) => Tag::Vector,
            Value::StringArray(_) => Tag::StringArray,
            Value::IntArray(_) => Tag::IntArray,
            Value::FloatArray(_) => Tag::FloatArray,
            Value::BoolArray(_) => Tag::BoolArray,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "String",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::Bytes(_) => "Bytes",
            Value::Timestamp(_) => "Timestamp",
            Value::Vector(_) => "Vector",
            Value::StringArray(_) => "StringArray",
            Value::IntArray(_) => "IntArray",
            Value::FloatArray(_) => "FloatArray",
            Value::BoolArray(_) => "BoolArray",
        }
    }

    /// The one-byte discriminant this value encodes with. Stable across
    /// versions; used by property indexes to remember the declared type
    /// of an indexed key without holding a sample value around.
    pub fn tag_byte(&self) -> u8 {
        self.tag() as u8
    }

    /// Encodes this value to its fixed binary layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tag() as u8];
        match self {
            Value::String(s) => encode_bytes(&mut out, s.as_bytes()),
            Value::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
            Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
            Value::Bool(b) => out.push(if *b { 1 } else { 0 }),
            Value::Bytes(b) => encode_bytes(&mut out, b),
            Value::Timestamp(t) => out.extend_from_slice(&t.to_le_bytes()),
            Value::Vector(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                for f in v {
                    out.extend_from_slice(&f.to_le_bytes());
                }
            }
            Value::StringArray(items) => {
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for s in items {
                    encode_bytes(&mut out, s.as_bytes());
                }
            }
            Value::IntArray(items) => {
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for i in items {
                    out.extend_from_slice(&i.to_le_bytes());
                }
            }
            Value::FloatArray(items) => {
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for f in items {
                    out.extend_from_slice(&f.to_le_bytes());
                }
            }
            Value::BoolArray(items) => {
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for b in items {
                    out.push(if *b { 1 } else { 0 });
                }
            }
        }
        out
    }

    /// Decodes a value from its fixed binary layout.
    ///
    /// Vector/array decoders validate that the payload length matches the
    /// length prefix; a mismatch is reported as [`DecodeError::MalformedValue`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let Some(&tag_byte) = bytes.first() else {
            return Err(DecodeError::Empty);
        };
        let tag = Tag::from_byte(tag_byte).ok_or(DecodeError::UnknownTag(tag_byte))?;
        let payload = &bytes[1..];
        match tag {
            Tag::String => Ok(Value::String(decode_string(payload)?)),
            Tag::Int => Ok(Value::Int(read_i64(payload)?)),
            Tag::Float => Ok(Value::Float(read_f64(payload)?)),
            Tag::Bool => Ok(Value::Bool(read_bool(payload)?)),
            Tag::Bytes => Ok(Value::Bytes(decode_bytes(payload)?.to_vec())),
            Tag::Timestamp => Ok(Value::Timestamp(read_i64(payload)?)),
            Tag::Vector => {
                let (len, rest) = read_len(payload)?;
                if rest.len() != len * 4 {
                    return Err(DecodeError::MalformedValue);
                }
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(read_f32_at(rest, i * 4)?);
                }
                Ok(Value::Vector(out))
            }
            Tag::StringArray => {
                let (len, mut rest) = read_len(payload)?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    let (s, consumed) = decode_string_prefixed(rest)?;
                    out.push(s);
                    rest = &rest[consumed..];
                }
                if !rest.is_empty() {
                    return Err(DecodeError::MalformedValue);
                }
                Ok(Value::StringArray(out))
            }
            Tag::IntArray => {
                let (len, rest) = read_len(payload)?;
                if rest.len() != len * 8 {
                    return Err(DecodeError::MalformedValue);
                }
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(read_i64_at(rest, i * 8)?);
                }
                Ok(Value::IntArray(out))
            }
            Tag::FloatArray => {
                let (len, rest) = read_len(payload)?;
                if rest.len() != len * 8 {
                    return Err(DecodeError::MalformedValue);
                }
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(read_f64_at(rest, i * 8)?);
                }
                Ok(Value::FloatArray(out))
            }
            Tag::BoolArray => {
                let (len, rest) = read_len(payload)?;
                if rest.len() != len {
                    return Err(DecodeError::MalformedValue);
                }
                let mut out = Vec::with_capacity(len);
                for &b in rest {
                    out.push(b != 0);
                }
                Ok(Value::BoolArray(out))
            }
        }
    }

    /// A human-readable form. Not a canonical comparison key — use
    /// [`Value::encode`] for that.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::Timestamp(t) => format!("@{t}"),
            Value::Vector(v) => format!("<vector[{}]>", v.len()),
            Value::StringArray(v) => format!("{v:?}"),
            Value::IntArray(v) => format!("{v:?}"),
            Value::FloatArray(v) => format!("{v:?}"),
            Value::BoolArray(v) => format!("{v:?}"),
        }
    }

    pub fn as_str(&self) -> Result<&str, WrongValueType> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(WrongValueType {
                expected: "String",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_int(&self) -> Result<i64, WrongValueType> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(WrongValueType {
                expected: "Int",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_float(&self) -> Result<f64, WrongValueType> {
        match self {
            Value::Float(f) => Ok(*f),
            other => Err(WrongValueType {
                expected: "Float",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_bool(&self) -> Result<bool, WrongValueType> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(WrongValueType {
                expected: "Bool",
                found: other.type_name(),
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // Spec contract: equality is (tag, raw-bytes) equality.
        self.encode() == other.encode()
    }
}

impl Eq for Value {}

// Serialized as the raw tagged-binary encoding rather than a JSON-native
// representation: serde_json rejects non-finite floats, and the codec's
// own framing is already the one canonical wire form.
impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.encode())
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct BytesVisitor;
        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a byte buffer holding an encoded Value")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }
        let bytes = deserializer.deserialize_bytes(BytesVisitor)?;
        Value::decode(&bytes).map_err(serde::de::Error::custom)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode_bytes(payload: &[u8]) -> Result<&[u8], DecodeError> {
    let (len, rest) = read_len(payload)?;
    if rest.len() != len {
        return Err(DecodeError::MalformedValue);
    }
    Ok(rest)
}

fn decode_string(payload: &[u8]) -> Result<String, DecodeError> {
    let bytes = decode_bytes(payload)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

/// Decodes a length-prefixed string and returns it along with the number
/// of bytes consumed (prefix + payload), for use inside array decoders.
fn decode_string_prefixed(bytes: &[u8]) -> Result<(String, usize), DecodeError> {
    let (len, rest) = read_len(bytes)?;
    if rest.len() < len {
        return Err(DecodeError::MalformedValue);
    }
    let s = String::from_utf8(rest[..len].to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((s, 4 + len))
}

fn read_len(bytes: &[u8]) -> Result<(usize, &[u8]), DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::MalformedValue);
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    Ok((len, &bytes[4..]))
}

fn read_i64(payload: &[u8]) -> Result<i64, DecodeError> {
    if payload.len() != 8 {
        return Err(DecodeError::MalformedValue);
    }
    Ok(i64::from_le_bytes(payload.try_into().unwrap()))
}

fn read_f64(payload: &[u8]) -> Result<f64, DecodeError> {
    if payload.len() != 8 {
        return Err(DecodeError::MalformedValue);
    }
    Ok(f64::from_le_bytes(payload.try_into().unwrap()))
}

fn read_bool(payload: &[u8]) -> Result<bool, DecodeError> {
    if payload.len() != 1 {
        return Err(DecodeError::MalformedValue);
    }
    Ok(payload[0] != 0)
}

fn read_i64_at(bytes: &[u8], offset: usize) -> Result<i64, DecodeError> {
    bytes
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .map(i64::from_le_bytes)
        .ok_or(DecodeError::MalformedValue)
}

fn read_f64_at(bytes: &[u8], offset: usize) -> Result<f64, DecodeError> {
    bytes
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .map(f64::from_le_bytes)
        .ok_or(DecodeError::MalformedValue)
}

fn read_f32_at(bytes: &[u8], offset: usize) -> Result<f32, DecodeError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .map(f32::from_le_bytes)
        .ok_or(DecodeError::MalformedValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_every_variant() {
        let values = vec![
            Value::String("hello".to_string()),
            Value::Int(-42),
            Value::Float(std::f64::consts::PI),
            Value::Bool(true),
            Value::Bytes(vec![1, 2, 3, 4]),
            Value::Timestamp(1_700_000_000),
            Value::Vector(vec![1.0, 2.5, -3.25]),
            Value::StringArray(vec!["a".into(), "bb".into()]),
            Value::IntArray(vec![1, -2, 3]),
            Value::FloatArray(vec![1.5, -2.5]),
            Value::BoolArray(vec![true, false, true]),
        ];
        for v in values {
            let bytes = v.encode();
            let decoded = Value::decode(&bytes).expect("decode should succeed");
            assert_eq!(decoded, v);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let err = Value::decode(&[255]).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTag(255)));
    }

    #[test]
    fn decode_rejects_truncated_vector_payload() {
        // tag=Vector, len=2 but only one f32 worth of payload follows.
        let mut bytes = vec![Tag::Vector as u8];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        let err = Value::decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedValue));
    }

    #[test]
    fn extreme_floats_roundtrip_under_bitwise_equality() {
        let values = [
            0.0,
            f64::from_bits(1), // smallest positive subnormal
            f64::MAX,
            -f64::MAX,
            std::f64::consts::PI,
            std::f64::consts::E,
            std::f64::consts::SQRT_2,
        ];
        for v in values {
            let encoded = Value::Float(v).encode();
            let decoded = Value::decode(&encoded).unwrap();
            match decoded {
                Value::Float(got) => assert_eq!(got.to_bits(), v.to_bits()),
                other => panic!("expected Float, got {other:?}"),
            }
        }
    }

    #[test]
    fn float_equality_is_bitwise_not_ieee() {
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn as_int_rejects_wrong_tag() {
        let err = Value::String("x".into()).as_int().unwrap_err();
        assert_eq!(err.expected, "Int");
        assert_eq!(err.found, "String");
    }
}
