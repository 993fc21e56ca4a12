use crate::types::Error;
use std::{convert::TryFrom, fmt};

/// Defines the fundamental types a reading can carry. Handlers set
/// the value for each reading they produce and, for devices that can
/// be written, decode the payload themselves.

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// For devices that report no value at all. Listen handlers use
    /// this for event-only devices.
    Null,

    /// For devices that report a simple true/false, on/off, etc.,
    /// state.
    Bool(bool),

    /// For devices that report text. Since strings can greatly vary
    /// in size, care must be taken when returning this type. A
    /// handler that returns strings rapidly should keep them short.
    String(String),

    /// For devices that report raw, uninterpreted payloads.
    Bytes(Vec<u8>),

    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),

    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),

    Float32(f32),
    Float64(f64),
}

impl Value {
    /// A short name for the variant, used in log and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Uint8(_) => "uint8",
            Value::Uint16(_) => "uint16",
            Value::Uint32(_) => "uint32",
            Value::Uint64(_) => "uint64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
        }
    }

    /// Widens any numeric variant to an `f64`. Non-numeric variants
    /// return `None`. Scale transforms operate through this view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int8(v) => Some(f64::from(*v)),
            Value::Int16(v) => Some(f64::from(*v)),
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) => Some(*v as f64),
            Value::Uint8(v) => Some(f64::from(*v)),
            Value::Uint16(v) => Some(f64::from(*v)),
            Value::Uint32(v) => Some(f64::from(*v)),
            Value::Uint64(v) => Some(*v as f64),
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "\"{}\"", v),
            Value::Bytes(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?
                }
                Ok(())
            }
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint8(v) => write!(f, "{}", v),
            Value::Uint16(v) => write!(f, "{}", v),
            Value::Uint32(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Bool(v) = value {
            Ok(v)
        } else {
            Err(Error::TypeError)
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::String(v) = value {
            Ok(v)
        } else {
            Err(Error::TypeError)
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if let Value::Bytes(v) = value {
            Ok(v)
        } else {
            Err(Error::TypeError)
        }
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::Int8(value)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int16(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Uint8(value)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Uint16(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Uint32(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Uint64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float64(value)
    }
}

// Widening integer extraction. Signed variants convert if they fit,
// which lets write handlers accept any integer reading without
// matching every variant.

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int8(v) => Ok(i64::from(v)),
            Value::Int16(v) => Ok(i64::from(v)),
            Value::Int32(v) => Ok(i64::from(v)),
            Value::Int64(v) => Ok(v),
            Value::Uint8(v) => Ok(i64::from(v)),
            Value::Uint16(v) => Ok(i64::from(v)),
            Value::Uint32(v) => Ok(i64::from(v)),
            Value::Uint64(v) => i64::try_from(v).map_err(|_| Error::TypeError),
            _ => Err(Error::TypeError),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or(Error::TypeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!("null", format!("{}", Value::Null));
        assert_eq!("false", format!("{}", Value::Bool(false)));
        assert_eq!("true", format!("{}", Value::Bool(true)));

        assert_eq!("0", format!("{}", Value::Int32(0)));
        assert_eq!("-1", format!("{}", Value::Int32(-1)));
        assert_eq!("-128", format!("{}", Value::Int8(-0x80)));
        assert_eq!("65535", format!("{}", Value::Uint16(0xffff)));
        assert_eq!(
            "18446744073709551615",
            format!("{}", Value::Uint64(u64::MAX))
        );

        assert_eq!("2.5", format!("{}", Value::Float64(2.5)));
        assert_eq!("\"hello\"", format!("{}", Value::String("hello".into())));
        assert_eq!("0xdeadbeef", format!("{}", Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])));
        assert_eq!("0x", format!("{}", Value::Bytes(vec![])));
    }

    #[test]
    fn test_from() {
        assert_eq!(Value::Bool(true), Value::from(true));
        assert_eq!(Value::Int8(-3), Value::from(-3i8));
        assert_eq!(Value::Int16(-3), Value::from(-3i16));
        assert_eq!(Value::Int32(-3), Value::from(-3i32));
        assert_eq!(Value::Int64(-3), Value::from(-3i64));
        assert_eq!(Value::Uint8(3), Value::from(3u8));
        assert_eq!(Value::Uint16(3), Value::from(3u16));
        assert_eq!(Value::Uint32(3), Value::from(3u32));
        assert_eq!(Value::Uint64(3), Value::from(3u64));
        assert_eq!(Value::Float32(1.5), Value::from(1.5f32));
        assert_eq!(Value::Float64(1.5), Value::from(1.5f64));
        assert_eq!(Value::String("x".into()), Value::from("x"));
        assert_eq!(Value::Bytes(vec![1, 2]), Value::from(vec![1u8, 2u8]));
    }

    #[test]
    fn test_try_from() {
        assert_eq!(bool::try_from(Value::Bool(true)), Ok(true));
        assert!(bool::try_from(Value::Int32(0)).is_err());

        assert_eq!(i64::try_from(Value::Int8(-5)), Ok(-5i64));
        assert_eq!(i64::try_from(Value::Uint32(7)), Ok(7i64));
        assert_eq!(i64::try_from(Value::Uint64(7)), Ok(7i64));
        assert!(i64::try_from(Value::Uint64(u64::MAX)).is_err());
        assert!(i64::try_from(Value::Bool(true)).is_err());

        assert_eq!(f64::try_from(Value::Float32(0.5)), Ok(0.5f64));
        assert_eq!(f64::try_from(Value::Int16(-2)), Ok(-2.0f64));
        assert!(f64::try_from(Value::String("2".into())).is_err());

        assert_eq!(
            String::try_from(Value::String("hi".into())),
            Ok(String::from("hi"))
        );
        assert!(String::try_from(Value::Null).is_err());

        assert_eq!(Vec::<u8>::try_from(Value::Bytes(vec![9])), Ok(vec![9u8]));
        assert!(Vec::<u8>::try_from(Value::Bool(false)).is_err());
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(Value::Int64(3).as_f64(), Some(3.0));
        assert_eq!(Value::Uint64(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float32(0.25).as_f64(), Some(0.25));
        assert_eq!(Value::Null.as_f64(), None);
        assert_eq!(Value::String("3".into()).as_f64(), None);
        assert_eq!(Value::Bytes(vec![3]).as_f64(), None);

        assert!(Value::Uint8(1).is_numeric());
        assert!(!Value::Bool(true).is_numeric());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Bool(true).type_name(), "bool");
        assert_eq!(Value::Int8(0).type_name(), "int8");
        assert_eq!(Value::Uint64(0).type_name(), "uint64");
        assert_eq!(Value::Float64(0.0).type_name(), "float64");
        assert_eq!(Value::Bytes(vec![]).type_name(), "bytes");
    }
}
