//! Generic command model
//!
//! A command is an ordered sequence of binary-safe argument blobs; the
//! first element is the operation name. One builder replaces per-command
//! wrapper types: wrappers outside the engine construct a `Command` and
//! hand it to `execute`. Key positions for cluster routing come from a
//! static table rather than per-command code.

use bytes::Bytes;

/// A single command ready for encoding
///
/// Immutable once built; arguments are stored exactly as provided with
/// no delimiter escaping (the wire encoding is length-prefixed).
#[derive(Debug, Clone)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    /// Create a command with the given operation name.
    ///
    /// A name containing spaces (e.g. `CLUSTER INFO`) is split into
    /// separate arguments, matching how the server expects compound
    /// command names.
    pub fn new(name: impl AsRef<str>) -> Self {
        let parts = name
            .as_ref()
            .split_whitespace()
            .map(|word| Bytes::from(word.as_bytes().to_vec()))
            .collect();
        Self { parts }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.parts.push(arg.into_arg());
        self
    }

    /// Append several arguments of one type
    #[must_use]
    pub fn args<T: IntoArg>(mut self, args: impl IntoIterator<Item = T>) -> Self {
        self.parts.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// All parts in order, operation name first
    #[must_use]
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Uppercased operation name
    #[must_use]
    pub fn name(&self) -> String {
        self.parts
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Key arguments of this command, per the key-position table.
    ///
    /// Commands without key arguments (PING, SUBSCRIBE, cluster
    /// management) return an empty vector. Unknown commands fall back to
    /// treating the first argument as the key.
    #[must_use]
    pub fn keys(&self) -> Vec<&[u8]> {
        let name = self.name();
        let Some(spec) = key_spec(&name) else {
            return Vec::new();
        };

        let argc = self.parts.len();
        let last = if spec.last < 0 {
            (argc as i32 + spec.last) as usize
        } else {
            (spec.last as usize).min(argc.saturating_sub(1))
        };

        let mut keys = Vec::new();
        let mut index = spec.first;
        while index <= last && index < argc {
            keys.push(self.parts[index].as_ref());
            index += spec.step;
        }
        keys
    }
}

/// Conversion of scalar values into binary-safe argument blobs
///
/// Integers and floats are rendered as decimal text, the encoding the
/// server parses them back from. There is intentionally no impl for
/// `bool`: a boolean has no canonical wire text and must be converted
/// explicitly by the caller.
pub trait IntoArg {
    /// Produce the argument bytes
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}
impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}
impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_vec())
    }
}
impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.into_bytes())
    }
}
impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.as_bytes().to_vec())
    }
}
impl IntoArg for i64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string().into_bytes())
    }
}
impl IntoArg for u64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string().into_bytes())
    }
}
impl IntoArg for usize {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string().into_bytes())
    }
}
impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string().into_bytes())
    }
}

/// Key positions within a command's argument list
///
/// `first` is the index of the first key (the name is index 0), `last`
/// is the index of the last key (negative counts from the end), `step`
/// the distance between consecutive keys.
#[derive(Debug, Clone, Copy)]
struct KeySpec {
    first: usize,
    last: i32,
    step: usize,
}

const fn spec(first: usize, last: i32, step: usize) -> KeySpec {
    KeySpec { first, last, step }
}

fn key_spec(name: &str) -> Option<KeySpec> {
    match name {
        // control-plane and connection commands carry no keys
        "PING" | "ECHO" | "AUTH" | "HELLO" | "SELECT" | "CLIENT" | "CLUSTER" | "ASKING"
        | "READONLY" | "INFO" | "COMMAND" | "CONFIG" | "DBSIZE" | "FLUSHDB" | "FLUSHALL"
        | "MULTI" | "EXEC" | "DISCARD" | "UNWATCH" | "SUBSCRIBE" | "UNSUBSCRIBE"
        | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "PUBLISH" | "QUIT" | "SCAN" | "WAIT" => None,
        // every trailing argument is a key
        "DEL" | "EXISTS" | "MGET" | "UNLINK" | "TOUCH" | "WATCH" | "SINTER" | "SUNION"
        | "SDIFF" | "SINTERSTORE" | "SUNIONSTORE" | "SDIFFSTORE" | "PFCOUNT" | "PFMERGE" => {
            Some(spec(1, -1, 1))
        }
        // alternating key/value pairs
        "MSET" | "MSETNX" => Some(spec(1, -1, 2)),
        // source and destination keys
        "RENAME" | "RENAMENX" | "RPOPLPUSH" | "LMOVE" | "SMOVE" | "COPY" | "GETDEL" => {
            Some(spec(1, 2, 1))
        }
        // single key in position 1; also the fallback for unknown commands
        _ => Some(spec(1, 1, 1)),
    }
}
