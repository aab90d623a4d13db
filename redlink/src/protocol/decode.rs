//! Resumable reply decoding
//!
//! The decoder reads from a cursor over whatever bytes have arrived so
//! far. A short read yields `Ok(None)` and consumes nothing observable;
//! the caller appends more bytes and retries from a fresh cursor. A
//! malformed marker or length is a `Protocol` error and means the stream
//! position is no longer trustworthy; the owning connection must be
//! closed, never resynchronized.

use bytes::{Buf, Bytes};
use redlink_core::{RedisError, RedisResult, Reply};
use std::io::Cursor;

/// Decodes replies from a byte stream cursor
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one reply, returning `None` if the buffer holds only a
    /// partial frame so far.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let marker = buf.chunk()[0];
        buf.advance(1);

        match marker {
            b'+' => Self::decode_simple_string(buf),
            b'-' => Self::decode_error(buf),
            b':' => Self::decode_integer(buf),
            b'$' => Self::decode_bulk_string(buf),
            b'*' => Self::decode_array(buf),
            b'_' => Self::decode_null(buf),
            b'#' => Self::decode_boolean(buf),
            b',' => Self::decode_double(buf),
            b'(' => Self::decode_big_number(buf),
            b'!' => Self::decode_blob_error(buf),
            b'=' => Self::decode_verbatim(buf),
            b'%' => Self::decode_map(buf),
            b'~' => Self::decode_set(buf),
            b'>' => Self::decode_push(buf),
            b'|' => Self::decode_attribute(buf),
            _ => Err(RedisError::Protocol(format!(
                "Unknown reply type marker: 0x{marker:02x}"
            ))),
        }
    }

    fn decode_simple_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::read_line(buf)? {
            Some(line) => Ok(Some(Reply::SimpleString(Self::line_to_string(&line)?))),
            None => Ok(None),
        }
    }

    fn decode_error(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::read_line(buf)? {
            Some(line) => Ok(Some(Reply::Error(Self::line_to_string(&line)?))),
            None => Ok(None),
        }
    }

    fn decode_integer(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let num = Self::line_to_string(&line)?
            .parse::<i64>()
            .map_err(|e| RedisError::Protocol(format!("Invalid integer: {e}")))?;
        Ok(Some(Reply::Integer(num)))
    }

    fn decode_bulk_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let len = match Self::read_length(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };

        if len == -1 {
            return Ok(Some(Reply::Null));
        }
        let len = Self::checked_length(len, "bulk string")?;

        match Self::read_payload(buf, len)? {
            Some(data) => Ok(Some(Reply::BulkString(data))),
            None => Ok(None),
        }
    }

    fn decode_array(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::decode_sequence(buf, "array")? {
            Some(Some(items)) => Ok(Some(Reply::Array(items))),
            Some(None) => Ok(Some(Reply::Null)),
            None => Ok(None),
        }
    }

    fn decode_set(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::decode_sequence(buf, "set")? {
            Some(Some(items)) => Ok(Some(Reply::Set(items))),
            Some(None) => Err(RedisError::Protocol("Invalid set length: -1".to_string())),
            None => Ok(None),
        }
    }

    fn decode_push(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::decode_sequence(buf, "push")? {
            Some(Some(items)) => Ok(Some(Reply::Push(items))),
            Some(None) => Err(RedisError::Protocol("Invalid push length: -1".to_string())),
            None => Ok(None),
        }
    }

    /// Shared element-sequence decoding; outer `None` means incomplete,
    /// inner `None` means the null sentinel (`-1` length).
    fn decode_sequence(
        buf: &mut Cursor<&[u8]>,
        what: &str,
    ) -> RedisResult<Option<Option<Vec<Reply>>>> {
        let len = match Self::read_length(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };

        if len == -1 {
            return Ok(Some(None));
        }
        let len = Self::checked_length(len, what)?;

        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            match Self::decode(buf)? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(Some(items)))
    }

    fn decode_null(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        if !line.is_empty() {
            return Err(RedisError::Protocol("Malformed null reply".to_string()));
        }
        Ok(Some(Reply::Null))
    }

    fn decode_boolean(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        match line.as_slice() {
            b"t" => Ok(Some(Reply::Boolean(true))),
            b"f" => Ok(Some(Reply::Boolean(false))),
            other => Err(RedisError::Protocol(format!(
                "Invalid boolean payload: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn decode_double(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let num = Self::line_to_string(&line)?
            .parse::<f64>()
            .map_err(|e| RedisError::Protocol(format!("Invalid double: {e}")))?;
        Ok(Some(Reply::Double(num)))
    }

    fn decode_big_number(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let text = Self::line_to_string(&line)?;
        if text.is_empty()
            || !text
                .strip_prefix(['+', '-'])
                .unwrap_or(&text)
                .bytes()
                .all(|b| b.is_ascii_digit())
        {
            return Err(RedisError::Protocol(format!("Invalid big number: {text}")));
        }
        Ok(Some(Reply::BigNumber(text)))
    }

    fn decode_blob_error(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let len = match Self::read_length(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let len = Self::checked_length(len, "blob error")?;

        match Self::read_payload(buf, len)? {
            Some(data) => Ok(Some(Reply::Error(
                String::from_utf8_lossy(&data).to_string(),
            ))),
            None => Ok(None),
        }
    }

    fn decode_verbatim(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        let len = match Self::read_length(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let len = Self::checked_length(len, "verbatim string")?;

        let data = match Self::read_payload(buf, len)? {
            Some(data) => data,
            None => return Ok(None),
        };

        // payload is "<3-char format>:<content>"
        if len < 4 || data[3] != b':' {
            return Err(RedisError::Protocol(
                "Malformed verbatim string payload".to_string(),
            ));
        }
        let format = String::from_utf8_lossy(&data[..3]).to_string();
        Ok(Some(Reply::Verbatim {
            format,
            data: data.slice(4..),
        }))
    }

    fn decode_map(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::decode_pairs(buf, "map")? {
            Some(pairs) => Ok(Some(Reply::Map(pairs))),
            None => Ok(None),
        }
    }

    /// Attribute metadata precedes an ordinary reply; decode the pairs,
    /// discard them, and return the reply they annotate.
    fn decode_attribute(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Reply>> {
        match Self::decode_pairs(buf, "attribute")? {
            Some(_) => Self::decode(buf),
            None => Ok(None),
        }
    }

    fn decode_pairs(
        buf: &mut Cursor<&[u8]>,
        what: &str,
    ) -> RedisResult<Option<Vec<(Reply, Reply)>>> {
        let len = match Self::read_length(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let len = Self::checked_length(len, what)?;

        let mut pairs = Vec::with_capacity(len);
        for _ in 0..len {
            let key = match Self::decode(buf)? {
                Some(key) => key,
                None => return Ok(None),
            };
            let value = match Self::decode(buf)? {
                Some(value) => value,
                None => return Ok(None),
            };
            pairs.push((key, value));
        }
        Ok(Some(pairs))
    }

    /// Read a declared element count or payload length
    fn read_length(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<i64>> {
        let line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let len = Self::line_to_string(&line)?
            .parse::<i64>()
            .map_err(|e| RedisError::Protocol(format!("Invalid length: {e}")))?;
        Ok(Some(len))
    }

    /// Reject negative lengths other than the null sentinel, which each
    /// caller handles before getting here.
    fn checked_length(len: i64, what: &str) -> RedisResult<usize> {
        usize::try_from(len)
            .map_err(|_| RedisError::Protocol(format!("Invalid {what} length: {len}")))
    }

    /// Read `len` payload bytes plus the trailing terminator
    fn read_payload(buf: &mut Cursor<&[u8]>, len: usize) -> RedisResult<Option<Bytes>> {
        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let start = buf.position() as usize;
        let data = Bytes::copy_from_slice(&buf.get_ref()[start..start + len]);
        buf.advance(len);

        let mut terminator = [0u8; 2];
        terminator[0] = buf.chunk()[0];
        buf.advance(1);
        terminator[1] = buf.chunk()[0];
        buf.advance(1);
        if terminator != *b"\r\n" {
            return Err(RedisError::Protocol(
                "Missing payload terminator".to_string(),
            ));
        }

        Ok(Some(data))
    }

    /// Read one terminator-delimited line, excluding the terminator
    fn read_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Vec<u8>>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();

        for i in start..slice.len().saturating_sub(1) {
            if slice[i] == b'\r' && slice[i + 1] == b'\n' {
                let line = slice[start..i].to_vec();
                buf.set_position((i + 2) as u64);
                return Ok(Some(line));
            }
        }

        Ok(None)
    }

    fn line_to_string(line: &[u8]) -> RedisResult<String> {
        String::from_utf8(line.to_vec())
            .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))
    }
}
