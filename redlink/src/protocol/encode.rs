//! Request encoding

use super::CRLF;
use crate::command::Command;
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes commands into the wire request form
///
/// A request is a length-prefixed array of length-prefixed binary-safe
/// strings, so encoding cannot fail and needs no escaping regardless of
/// argument content.
pub struct RespEncoder;

impl RespEncoder {
    /// Encode one command into the buffer
    pub fn encode_command(command: &Command, buf: &mut BytesMut) {
        let parts = command.parts();
        buf.put_u8(b'*');
        buf.put_slice(parts.len().to_string().as_bytes());
        buf.put_slice(CRLF);

        for part in parts {
            buf.put_u8(b'$');
            buf.put_slice(part.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(part);
            buf.put_slice(CRLF);
        }
    }

    /// Encode one command into a frozen frame
    #[must_use]
    pub fn command_bytes(command: &Command) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_command(command, &mut buf);
        buf.freeze()
    }

    /// Encode a batch into one contiguous frame.
    ///
    /// A batch is written with a single transport write so no other
    /// caller's frames can interleave with it.
    #[must_use]
    pub fn batch_bytes(commands: &[Command]) -> Bytes {
        let mut buf = BytesMut::new();
        for command in commands {
            Self::encode_command(command, &mut buf);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_against_reference_bytes() {
        let cmd = Command::new("SET").arg("foo").arg("bar");
        let bytes = RespEncoder::command_bytes(&cmd);
        assert_eq!(&bytes[..], b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn test_encode_empty_and_binary_args() {
        let cmd = Command::new("SET").arg("k").arg(&b"\x00\r\n\xff"[..]);
        let bytes = RespEncoder::command_bytes(&cmd);
        assert_eq!(&bytes[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\n\x00\r\n\xff\r\n");

        let cmd = Command::new("SET").arg("k").arg("");
        let bytes = RespEncoder::command_bytes(&cmd);
        assert_eq!(&bytes[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$0\r\n\r\n");
    }

    #[test]
    fn test_batch_is_contiguous() {
        let batch = [
            Command::new("SET").arg("a").arg("1"),
            Command::new("GET").arg("a"),
        ];
        let bytes = RespEncoder::batch_bytes(&batch);
        assert_eq!(
            &bytes[..],
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n"
        );
    }
}
