//! Wire reply value types
//!
//! A single tagged union covers every reply the protocol can carry,
//! baseline and extended types alike. Decoders always produce a `Reply`;
//! which variants can actually appear depends on the negotiated protocol
//! version.

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// A decoded reply from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple status string: `+OK\r\n`
    SimpleString(String),
    /// Error: `-ERR message\r\n` (also blob errors in the extended protocol)
    Error(String),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Double: `,1.23\r\n`
    Double(f64),
    /// Boolean: `#t\r\n` / `#f\r\n`
    Boolean(bool),
    /// Bulk string: `$6\r\nfoobar\r\n`; binary-safe
    BulkString(Bytes),
    /// Null: `$-1\r\n`, `*-1\r\n` or `_\r\n`
    Null,
    /// Array: `*2\r\n...`
    Array(Vec<Reply>),
    /// Map of key-value pairs: `%2\r\n...`; order preserved as received
    Map(Vec<(Reply, Reply)>),
    /// Set: `~3\r\n...`
    Set(Vec<Reply>),
    /// Push message delivered outside request/response correlation: `>4\r\n...`
    Push(Vec<Reply>),
    /// Arbitrary precision number: `(3492890328409238509324850943850\r\n`
    BigNumber(String),
    /// Verbatim string with a format prefix: `=15\r\ntxt:Some string\r\n`
    Verbatim {
        /// Three-character format tag, e.g. `txt` or `mkd`
        format: String,
        /// The payload without the format prefix
        data: Bytes,
    },
}

impl Reply {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) => Ok(s.clone()),
            Self::BigNumber(s) => Ok(s.clone()),
            Self::BulkString(b) | Self::Verbatim { data: b, .. } => {
                String::from_utf8(b.to_vec())
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))
            }
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Boolean(b) => Ok(i64::from(*b)),
            Self::BulkString(b) => {
                let s = String::from_utf8(b.to_vec())
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to a float if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a float.
    pub fn as_double(&self) -> RedisResult<f64> {
        match self {
            Self::Double(f) => Ok(*f),
            Self::Integer(i) => Ok(*i as f64),
            Self::BulkString(b) => {
                let s = String::from_utf8(b.to_vec())
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))?;
                s.parse::<f64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse double: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to double"
            ))),
        }
    }

    /// Convert to a boolean if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a boolean.
    pub fn as_bool(&self) -> RedisResult<bool> {
        match self {
            Self::Boolean(b) => Ok(*b),
            Self::Integer(1) => Ok(true),
            Self::Integer(0) => Ok(false),
            Self::SimpleString(s) if s == "OK" => Ok(true),
            _ => Err(RedisError::Type(format!("Cannot convert {self:?} to bool"))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) | Self::Verbatim { data: b, .. } => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Convert to an array of elements if possible
    ///
    /// Sets and push messages are sequences too and convert the same way.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an array.
    pub fn as_array(&self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(items) | Self::Set(items) | Self::Push(items) => Ok(items.clone()),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to array"
            ))),
        }
    }

    /// Convert to key-value pairs if possible
    ///
    /// A flat array of even length converts pairwise, matching how the
    /// baseline protocol renders maps.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to pairs.
    pub fn as_map(&self) -> RedisResult<Vec<(Self, Self)>> {
        match self {
            Self::Map(pairs) => Ok(pairs.clone()),
            Self::Array(items) if items.len() % 2 == 0 => Ok(items
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect()),
            _ => Err(RedisError::Type(format!("Cannot convert {self:?} to map"))),
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error reply
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Extract the error message if this is an error reply
    #[must_use]
    pub fn into_error(self) -> Option<String> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Name of the reply type, for diagnostics
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple-string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::BulkString(_) => "bulk-string",
            Self::Null => "null",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Push(_) => "push",
            Self::BigNumber(_) => "big-number",
            Self::Verbatim { .. } => "verbatim-string",
        }
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::from(s.as_bytes().to_vec()))
    }
}
impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<f64> for Reply {
    fn from(f: f64) -> Self {
        Self::Double(f)
    }
}
impl From<bool> for Reply {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}
impl From<Vec<u8>> for Reply {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}
impl From<Vec<Reply>> for Reply {
    fn from(items: Vec<Reply>) -> Self {
        Self::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_conversions() {
        assert_eq!(
            Reply::SimpleString("OK".to_string()).as_string().unwrap(),
            "OK"
        );
        assert_eq!(Reply::from("hello").as_string().unwrap(), "hello");
        assert!(Reply::Null.as_string().is_err());
        assert!(Reply::Integer(1).as_string().is_err());
    }

    #[test]
    fn test_int_conversions() {
        assert_eq!(Reply::Integer(42).as_int().unwrap(), 42);
        assert_eq!(Reply::from("42").as_int().unwrap(), 42);
        assert_eq!(Reply::Boolean(true).as_int().unwrap(), 1);
        assert!(Reply::from("nope").as_int().is_err());
    }

    #[test]
    fn test_bool_conversions() {
        assert!(Reply::Boolean(true).as_bool().unwrap());
        assert!(Reply::Integer(1).as_bool().unwrap());
        assert!(!Reply::Integer(0).as_bool().unwrap());
        assert!(Reply::SimpleString("OK".to_string()).as_bool().unwrap());
    }

    #[test]
    fn test_map_from_flat_array() {
        let flat = Reply::Array(vec![
            Reply::from("a"),
            Reply::Integer(1),
            Reply::from("b"),
            Reply::Integer(2),
        ]);
        let pairs = flat.as_map().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (Reply::from("a"), Reply::Integer(1)));

        let odd = Reply::Array(vec![Reply::from("a")]);
        assert!(odd.as_map().is_err());
    }

    #[test]
    fn test_null_is_distinct_from_empty() {
        assert!(Reply::Null.is_null());
        assert!(!Reply::BulkString(Bytes::new()).is_null());
        assert!(!Reply::Array(vec![]).is_null());
    }
}
