//! Scalar values and rows.
//!
//! # Encoding
//!
//! Each value is a one-byte tag followed by its payload, little-endian:
//!
//! ```text
//! 0 Null    (no payload)
//! 1 Int     (8 bytes, i64)
//! 2 UInt    (8 bytes, u64)
//! 3 Float   (8 bytes, f64 bits)
//! 4 String  (4 byte length + UTF-8 bytes)
//! ```

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CoreError, CoreResult};
use crate::limits::STRING_SIZE_BYTES_MAX;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_UINT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;

/// A single row: one value per block column.
pub type Row = Vec<Value>;

/// A scalar cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer.
    UInt(u64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
}

impl Value {
    /// Returns a short name of the value's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Int(_) => "Int64",
            Self::UInt(_) => "UInt64",
            Self::Float(_) => "Float64",
            Self::String(_) => "String",
        }
    }

    /// Returns true if the value is `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an `f64` if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Null | Self::String(_) => None,
        }
    }

    /// Compares two values.
    ///
    /// Numbers compare numerically across integer and float types, strings
    /// compare lexically. `Null` and mixed string/number comparisons are
    /// unordered.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::UInt(a), Self::UInt(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::UInt(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::UInt(a), Self::Int(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Encodes the value to bytes.
    #[allow(clippy::cast_possible_truncation)] // String sizes bounded by limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Null => buf.put_u8(TAG_NULL),
            Self::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*v);
            }
            Self::UInt(v) => {
                buf.put_u8(TAG_UINT);
                buf.put_u64_le(*v);
            }
            Self::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_u64_le(v.to_bits());
            }
            Self::String(s) => {
                buf.put_u8(TAG_STRING);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
        }
    }

    /// Decodes a value from bytes.
    ///
    /// # Errors
    /// Returns `Decode` if the buffer is truncated, the tag is unknown or a
    /// string is not valid UTF-8.
    pub fn decode(buf: &mut impl Buf) -> CoreResult<Self> {
        if buf.remaining() < 1 {
            return Err(CoreError::Decode {
                reason: "missing value tag",
            });
        }
        match buf.get_u8() {
            TAG_NULL => Ok(Self::Null),
            TAG_INT => {
                ensure_remaining(buf, 8)?;
                Ok(Self::Int(buf.get_i64_le()))
            }
            TAG_UINT => {
                ensure_remaining(buf, 8)?;
                Ok(Self::UInt(buf.get_u64_le()))
            }
            TAG_FLOAT => {
                ensure_remaining(buf, 8)?;
                Ok(Self::Float(f64::from_bits(buf.get_u64_le())))
            }
            TAG_STRING => {
                ensure_remaining(buf, 4)?;
                let len = buf.get_u32_le();
                if len > STRING_SIZE_BYTES_MAX {
                    return Err(CoreError::Decode {
                        reason: "string length exceeds maximum",
                    });
                }
                ensure_remaining(buf, len as usize)?;
                let bytes = buf.copy_to_bytes(len as usize);
                String::from_utf8(bytes.to_vec())
                    .map(Self::String)
                    .map_err(|_| CoreError::Decode {
                        reason: "string is not valid UTF-8",
                    })
            }
            _ => Err(CoreError::Decode {
                reason: "unknown value tag",
            }),
        }
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> CoreResult<()> {
    if buf.remaining() < needed {
        return Err(CoreError::Decode {
            reason: "buffer too small for value",
        });
    }
    Ok(())
}

impl fmt::Display for Value {
    /// Renders the value as a query literal.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
