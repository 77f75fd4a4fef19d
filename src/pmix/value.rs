use bytes::{Buf, BufMut, Bytes};

use super::status::PmixError;
use crate::coordinator::protocol::{ProtocolError, ensure, get_bytes, get_string, put_bytes, put_string};

/// Visibility class of a published value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Scope {
    /// Visible to the owning process only
    Local = 1,
    /// Visible to other processes
    Remote = 2,
    /// Visible to all processes
    Global = 3,
}

impl Scope {
    /// Scopes that leave the owning process at a fence.
    pub const SHARED: [Scope; 2] = [Scope::Remote, Scope::Global];

    pub fn is_shared(self) -> bool {
        self != Scope::Local
    }
}

impl TryFrom<u8> for Scope {
    type Error = PmixError;

    fn try_from(value: u8) -> Result<Self, PmixError> {
        match value {
            1 => Ok(Scope::Local),
            2 => Ok(Scope::Remote),
            3 => Ok(Scope::Global),
            _ => Err(PmixError::InvalidScope),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Bool = 1,
    Byte = 2,
    String = 3,
    Size = 4,
    Pid = 5,
    Int = 6,
    Int8 = 7,
    Int16 = 8,
    Int32 = 9,
    Int64 = 10,
    Uint8 = 11,
    Uint16 = 12,
    Uint32 = 13,
    Uint64 = 14,
    Float = 15,
    Double = 16,
    Bytes = 17,
}

impl TryFrom<u8> for DataType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => DataType::Bool,
            2 => DataType::Byte,
            3 => DataType::String,
            4 => DataType::Size,
            5 => DataType::Pid,
            6 => DataType::Int,
            7 => DataType::Int8,
            8 => DataType::Int16,
            9 => DataType::Int32,
            10 => DataType::Int64,
            11 => DataType::Uint8,
            12 => DataType::Uint16,
            13 => DataType::Uint32,
            14 => DataType::Uint64,
            15 => DataType::Float,
            16 => DataType::Double,
            17 => DataType::Bytes,
            _ => return Err(ProtocolError::InvalidDataType(value)),
        })
    }
}

/// A typed value. The variant is the type tag; `Int` is the plain C `int`
/// and is distinct from `Int32` even though both hold an `i32`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    String(String),
    Size(u64),
    Pid(u32),
    Int(i32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    Bytes(Bytes),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Byte(_) => DataType::Byte,
            Value::String(_) => DataType::String,
            Value::Size(_) => DataType::Size,
            Value::Pid(_) => DataType::Pid,
            Value::Int(_) => DataType::Int,
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Uint8(_) => DataType::Uint8,
            Value::Uint16(_) => DataType::Uint16,
            Value::Uint32(_) => DataType::Uint32,
            Value::Uint64(_) => DataType::Uint64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Bytes(_) => DataType::Bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.data_type() as u8);
        match self {
            Value::Bool(v) => buf.put_u8(*v as u8),
            Value::Byte(v) | Value::Uint8(v) => buf.put_u8(*v),
            Value::String(v) => put_string(buf, v),
            Value::Size(v) | Value::Uint64(v) => buf.put_u64(*v),
            Value::Pid(v) | Value::Uint32(v) => buf.put_u32(*v),
            Value::Int(v) | Value::Int32(v) => buf.put_i32(*v),
            Value::Int8(v) => buf.put_i8(*v),
            Value::Int16(v) => buf.put_i16(*v),
            Value::Int64(v) => buf.put_i64(*v),
            Value::Uint16(v) => buf.put_u16(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Bytes(v) => put_bytes(buf, v),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(buf, 1)?;
        let tag = DataType::try_from(buf.get_u8())?;
        let fixed = match tag {
            DataType::Bool | DataType::Byte | DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Pid | DataType::Int | DataType::Int32 | DataType::Uint32 | DataType::Float => 4,
            DataType::Size | DataType::Int64 | DataType::Uint64 | DataType::Double => 8,
            DataType::String | DataType::Bytes => 0,
        };
        ensure(buf, fixed)?;
        Ok(match tag {
            DataType::Bool => Value::Bool(buf.get_u8() != 0),
            DataType::Byte => Value::Byte(buf.get_u8()),
            DataType::String => Value::String(get_string(buf)?),
            DataType::Size => Value::Size(buf.get_u64()),
            DataType::Pid => Value::Pid(buf.get_u32()),
            DataType::Int => Value::Int(buf.get_i32()),
            DataType::Int8 => Value::Int8(buf.get_i8()),
            DataType::Int16 => Value::Int16(buf.get_i16()),
            DataType::Int32 => Value::Int32(buf.get_i32()),
            DataType::Int64 => Value::Int64(buf.get_i64()),
            DataType::Uint8 => Value::Uint8(buf.get_u8()),
            DataType::Uint16 => Value::Uint16(buf.get_u16()),
            DataType::Uint32 => Value::Uint32(buf.get_u32()),
            DataType::Uint64 => Value::Uint64(buf.get_u64()),
            DataType::Float => Value::Float(buf.get_f32()),
            DataType::Double => Value::Double(buf.get_f64()),
            DataType::Bytes => Value::Bytes(get_bytes(buf)?),
        })
    }
}

macro_rules! pmix_value_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(src: $t) -> Self {
                Value::$variant(src)
            }
        }
    };
}

macro_rules! pmix_value_from_newtype {
    ($t:ty, $newtype:ident, $variant:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq)]
        pub struct $newtype(pub $t);

        impl From<$newtype> for Value {
            fn from(src: $newtype) -> Self {
                Value::$variant(src.0)
            }
        }
    };
}

pmix_value_from!(bool, Bool);
pmix_value_from_newtype!(u8, Byte, Byte);
pmix_value_from!(String, String);
pmix_value_from_newtype!(u64, Size, Size);
pmix_value_from_newtype!(u32, Pid, Pid);
pmix_value_from!(i32, Int);
pmix_value_from!(i8, Int8);
pmix_value_from!(i16, Int16);
pmix_value_from_newtype!(i32, Int32, Int32);
pmix_value_from!(i64, Int64);
pmix_value_from!(u8, Uint8);
pmix_value_from!(u16, Uint16);
pmix_value_from!(u32, Uint32);
pmix_value_from!(u64, Uint64);
pmix_value_from!(f32, Float);
pmix_value_from!(f64, Double);
pmix_value_from!(Bytes, Bytes);

impl From<&str> for Value {
    fn from(src: &str) -> Self {
        Value::String(src.to_owned())
    }
}
