use std::error;
use std::fmt;
use std::io;
use std::str::{from_utf8, Utf8Error};
use std::string::FromUtf8Error;

use bytes::Bytes;
use num_bigint::BigInt;

macro_rules! fail {
    ($expr:expr) => {
        return Err(::std::convert::From::from($expr))
    };
}

pub(crate) use fail;

/// The RESP3 type of a single protocol element.
///
/// Every element on the wire starts with one of these tags.  Aggregate kinds
/// (`Array`, `Push`, `Set`, `Map`, `Attribute`) carry a size header and are
/// followed by their children; all other kinds are leaves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Resp3Type {
    /// `+` line reply, e.g. `+OK`.
    SimpleString,
    /// `-` error line, e.g. `-ERR unknown command`.
    SimpleError,
    /// `$` length-prefixed binary-safe string.
    BlobString,
    /// `!` length-prefixed error.
    BlobError,
    /// `=` blob string with a three-character format prefix.
    VerbatimString,
    /// `;` one segment of a streamed string; an empty segment terminates the
    /// stream.
    StreamedStringPart,
    /// `:` signed 64-bit integer.
    Number,
    /// `,` double precision float, including `inf`, `-inf` and `nan`.
    Double,
    /// `#` boolean, `t` or `f`.
    Boolean,
    /// `(` integer outside the 64-bit range.
    BigNumber,
    /// `_` the RESP3 null.
    Null,
    /// `*` heterogeneous aggregate.
    Array,
    /// `>` out-of-band server message.
    Push,
    /// `~` aggregate with set semantics.
    Set,
    /// `%` aggregate of field/value pairs.
    Map,
    /// `|` metadata aggregate attached to the element that follows it.
    Attribute,
}

impl Resp3Type {
    /// Returns true for kinds whose node payload is a child count rather
    /// than bytes.
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Resp3Type::Array
                | Resp3Type::Push
                | Resp3Type::Set
                | Resp3Type::Map
                | Resp3Type::Attribute
        )
    }

    /// Returns true for the two error kinds.
    pub fn is_error(self) -> bool {
        matches!(self, Resp3Type::SimpleError | Resp3Type::BlobError)
    }

    // Maps and attributes declare pairs, every other aggregate declares
    // single children.
    pub(crate) fn children_per_unit(self) -> usize {
        match self {
            Resp3Type::Map | Resp3Type::Attribute => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Resp3Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resp3Type::SimpleString => "simple-string",
            Resp3Type::SimpleError => "simple-error",
            Resp3Type::BlobString => "blob-string",
            Resp3Type::BlobError => "blob-error",
            Resp3Type::VerbatimString => "verbatim-string",
            Resp3Type::StreamedStringPart => "streamed-string-part",
            Resp3Type::Number => "number",
            Resp3Type::Double => "double",
            Resp3Type::Boolean => "boolean",
            Resp3Type::BigNumber => "big-number",
            Resp3Type::Null => "null",
            Resp3Type::Array => "array",
            Resp3Type::Push => "push",
            Resp3Type::Set => "set",
            Resp3Type::Map => "map",
            Resp3Type::Attribute => "attribute",
        };
        f.write_str(name)
    }
}

/// Payload of a [`Node`].
#[derive(Clone, PartialEq, Eq)]
pub enum NodeValue {
    /// Leaf payload.  Numbers, doubles, booleans and big numbers keep their
    /// ASCII form; conversion happens in the response adapter.
    Blob(Bytes),
    /// Declared child count of an aggregate.
    Size(usize),
    /// Aggregate or blob string of unknown size, closed by an empty
    /// [`Resp3Type::StreamedStringPart`] sentinel one level below.
    Streamed,
}

impl NodeValue {
    /// Returns the leaf bytes, or `None` for aggregates.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            NodeValue::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the declared aggregate size, or `None` for leaves and
    /// streamed aggregates.
    pub fn aggregate_size(&self) -> Option<usize> {
        match self {
            NodeValue::Size(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Debug for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Blob(bytes) => match from_utf8(bytes) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "{bytes:?}"),
            },
            NodeValue::Size(n) => write!(f, "size({n})"),
            NodeValue::Streamed => f.write_str("streamed"),
        }
    }
}

/// One element of a parsed response tree.
///
/// A complete response is a pre-order sequence of nodes; `depth` is the
/// nesting level, zero for the top-level element.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Node {
    /// Protocol type of this element.
    pub kind: Resp3Type,
    /// Nesting level, zero at the top.
    pub depth: usize,
    /// Leaf bytes or aggregate size.
    pub value: NodeValue,
}

impl Node {
    pub(crate) fn leaf(kind: Resp3Type, depth: usize, payload: Bytes) -> Node {
        Node {
            kind,
            depth,
            value: NodeValue::Blob(payload),
        }
    }

    pub(crate) fn aggregate(kind: Resp3Type, depth: usize, size: usize) -> Node {
        Node {
            kind,
            depth,
            value: NodeValue::Size(size),
        }
    }

    pub(crate) fn streamed(kind: Resp3Type, depth: usize) -> Node {
        Node {
            kind,
            depth,
            value: NodeValue::Streamed,
        }
    }
}

/// A complete response tree in pre-order.
pub type NodeList = Vec<Node>;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The operation requires an established connection and none exists.
    NotConnected,
    /// The connection dropped before the request was answered.
    ConnectionLost,
    /// The server stopped answering health-check pings.
    PongTimeout,
    /// The protocol handshake was rejected or timed out.
    HandshakeFailed,
    /// A byte that is not a RESP3 type tag appeared where an element was
    /// expected.
    InvalidTypeByte,
    /// A protocol line was not terminated by CRLF.
    ExpectedNewline,
    /// A size header or numeric payload could not be parsed.
    NotANumber,
    /// An element exceeds the configured read buffer cap.
    ExceedsMaxSize,
    /// The stream ended in the middle of an element.
    UnexpectedEof,
    /// A response element cannot be adapted into the requested slot shape.
    IncompatibleType,
    /// An aggregate had a different number of children than the slot
    /// expects.
    UnexpectedSize,
    /// The server answered with a `-` error line.
    Resp3SimpleError,
    /// The server answered with a `!` error blob.
    Resp3BlobError,
    /// The operation was cancelled before completion.
    Cancelled,
    /// The surrounding task or connection was torn down.
    OperationAborted,
    /// The request was malformed on the client side.
    ClientError,
    /// An I/O level failure.
    IoError,
}

/// Represents a failure raised by this library.  Inspect it through
/// [`RedisError::kind`] and the predicate helpers rather than matching on
/// the internal representation.
pub struct RedisError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Server(ErrorKind, String),
    IoError(io::Error),
}

impl PartialEq for RedisError {
    fn eq(&self, other: &RedisError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Server(kind_a, msg_a), ErrorRepr::Server(kind_b, msg_b)) => {
                kind_a == kind_b && msg_a == msg_b
            }
            _ => false,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<Utf8Error> for RedisError {
    fn from(_: Utf8Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(ErrorKind::IncompatibleType, "Invalid UTF-8"),
        }
    }
}

impl From<FromUtf8Error> for RedisError {
    fn from(_: FromUtf8Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(ErrorKind::IncompatibleType, "Invalid UTF-8"),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::IoError(ref err) => Some(err as &dyn error::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::Server(kind, ref message) => {
                f.write_str("An error was signalled by the server - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                message.fmt(f)
            }
            ErrorRepr::IoError(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl RedisError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _)
            | ErrorRepr::Server(kind, _) => kind,
            ErrorRepr::IoError(_) => ErrorKind::IoError,
        }
    }

    /// Returns the error detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Server(_, ref message) => Some(message.as_str()),
            _ => None,
        }
    }

    /// The verbatim message of a server-signalled error, e.g. `ERR unknown
    /// command`.
    pub fn server_message(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Server(_, ref message) => Some(message.as_str()),
            _ => None,
        }
    }

    pub(crate) fn from_server(kind: Resp3Type, message: String) -> RedisError {
        let kind = match kind {
            Resp3Type::BlobError => ErrorKind::Resp3BlobError,
            _ => ErrorKind::Resp3SimpleError,
        };
        RedisError {
            repr: ErrorRepr::Server(kind, message),
        }
    }

    /// True when this error came from the server as an ordinary RESP3 error
    /// element.  Such errors are attached to the slot of the failing command
    /// and are never fatal to the connection.
    pub fn is_server_error(&self) -> bool {
        matches!(self.repr, ErrorRepr::Server(..))
    }

    /// True for failures of the connection itself rather than of an
    /// individual request.
    pub fn is_connection_dropped(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => matches!(self.kind(), ErrorKind::ConnectionLost),
        }
    }

    /// True when the error was caused by an I/O time out.
    pub fn is_timeout(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether the reconnect loop may retry after this failure.  Parser
    /// errors discard the stream but a fresh socket starts cleanly framed,
    /// so they are retryable; rejected handshakes and cancellations are not.
    pub(crate) fn is_recoverable(&self) -> bool {
        match self.kind() {
            ErrorKind::ConnectionLost
            | ErrorKind::PongTimeout
            | ErrorKind::InvalidTypeByte
            | ErrorKind::ExpectedNewline
            | ErrorKind::NotANumber
            | ErrorKind::ExceedsMaxSize
            | ErrorKind::UnexpectedEof
            | ErrorKind::IoError => true,
            _ => false,
        }
    }

    /// Clone the error, throwing away the non-cloneable parts of a wrapped
    /// `io::Error`.  Used when one failure has to be delivered to several
    /// waiting requests.
    pub(crate) fn clone_mostly(&self) -> RedisError {
        let repr = match self.repr {
            ErrorRepr::WithDescription(kind, desc) => ErrorRepr::WithDescription(kind, desc),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.clone())
            }
            ErrorRepr::Server(kind, ref message) => ErrorRepr::Server(kind, message.clone()),
            ErrorRepr::IoError(ref e) => ErrorRepr::IoError(io::Error::new(e.kind(), e.to_string())),
        };
        RedisError { repr }
    }
}

/// Library generic result type.
pub type RedisResult<T> = Result<T, RedisError>;

/// Serializes one value into the payload of one bulk string.
///
/// This is the encoding extension point: implement it for your own types to
/// pass them to [`crate::Request::push`].  The provided implementations
/// cover byte strings, integers and floating point numbers.
pub trait ToBulk {
    /// Appends the payload bytes of a single bulk string to `out`.
    fn to_bulk(&self, out: &mut Vec<u8>);
}

impl ToBulk for str {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToBulk for String {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToBulk for [u8] {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<const N: usize> ToBulk for [u8; N] {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToBulk for Vec<u8> {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToBulk for Bytes {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<T: ToBulk + ?Sized> ToBulk for &T {
    fn to_bulk(&self, out: &mut Vec<u8>) {
        T::to_bulk(self, out)
    }
}

macro_rules! itoa_based_to_bulk_impl {
    ($($t:ty),*) => {
        $(
            impl ToBulk for $t {
                fn to_bulk(&self, out: &mut Vec<u8>) {
                    let mut buf = ::itoa::Buffer::new();
                    out.extend_from_slice(buf.format(*self).as_bytes());
                }
            }
        )*
    };
}

macro_rules! ryu_based_to_bulk_impl {
    ($($t:ty),*) => {
        $(
            impl ToBulk for $t {
                fn to_bulk(&self, out: &mut Vec<u8>) {
                    let mut buf = ::ryu::Buffer::new();
                    out.extend_from_slice(buf.format(*self).as_bytes());
                }
            }
        )*
    };
}

itoa_based_to_bulk_impl!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
ryu_based_to_bulk_impl!(f32, f64);

/// Converts the payload of a leaf element into a user type.
///
/// This is the decoding extension point used by the scalar response slots.
/// Numbers arrive in their ASCII form and are parsed here, not in the
/// parser.
pub trait FromBulk: Sized {
    /// Converts a leaf payload.
    fn from_bulk(bytes: &[u8]) -> RedisResult<Self>;
}

impl FromBulk for String {
    fn from_bulk(bytes: &[u8]) -> RedisResult<String> {
        Ok(from_utf8(bytes)?.to_owned())
    }
}

impl FromBulk for Vec<u8> {
    fn from_bulk(bytes: &[u8]) -> RedisResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

impl FromBulk for Bytes {
    fn from_bulk(bytes: &[u8]) -> RedisResult<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl FromBulk for () {
    fn from_bulk(_: &[u8]) -> RedisResult<()> {
        Ok(())
    }
}

impl FromBulk for bool {
    fn from_bulk(bytes: &[u8]) -> RedisResult<bool> {
        match bytes {
            b"t" | b"1" => Ok(true),
            b"f" | b"0" => Ok(false),
            _ => fail!((
                ErrorKind::IncompatibleType,
                "Expected boolean, got garbage",
                String::from_utf8_lossy(bytes).into_owned()
            )),
        }
    }
}

impl FromBulk for BigInt {
    fn from_bulk(bytes: &[u8]) -> RedisResult<BigInt> {
        BigInt::parse_bytes(bytes, 10)
            .ok_or_else(|| RedisError::from((ErrorKind::NotANumber, "Expected big number")))
    }
}

macro_rules! parsed_from_bulk_impl {
    ($($t:ty),*) => {
        $(
            impl FromBulk for $t {
                fn from_bulk(bytes: &[u8]) -> RedisResult<$t> {
                    from_utf8(bytes)?.trim().parse::<$t>().map_err(|_| {
                        RedisError::from((
                            ErrorKind::NotANumber,
                            "Could not convert to a number",
                            String::from_utf8_lossy(bytes).into_owned(),
                        ))
                    })
                }
            }
        )*
    };
}

parsed_from_bulk_impl!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_roundtrip() {
        let err = RedisError::from((ErrorKind::NotConnected, "no connection"));
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(err.detail().is_none());

        let err = RedisError::from((
            ErrorKind::NotANumber,
            "Could not convert to a number",
            "abc".to_string(),
        ));
        assert_eq!(err.detail(), Some("abc"));
    }

    #[test]
    fn server_errors_compare_by_message() {
        let a = RedisError::from_server(Resp3Type::SimpleError, "ERR boom".into());
        let b = RedisError::from_server(Resp3Type::SimpleError, "ERR boom".into());
        let c = RedisError::from_server(Resp3Type::BlobError, "ERR boom".into());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.kind(), ErrorKind::Resp3SimpleError);
        assert_eq!(c.kind(), ErrorKind::Resp3BlobError);
        assert!(a.is_server_error());
    }

    #[test]
    fn to_bulk_formats_numbers() {
        let mut out = Vec::new();
        42i64.to_bulk(&mut out);
        assert_eq!(out, b"42");

        out.clear();
        2.5f64.to_bulk(&mut out);
        assert_eq!(out, b"2.5");

        out.clear();
        "hi".to_bulk(&mut out);
        assert_eq!(out, b"hi");
    }

    #[test]
    fn from_bulk_parses_scalars() {
        assert_eq!(i64::from_bulk(b"42").unwrap(), 42);
        assert_eq!(f64::from_bulk(b"inf").unwrap(), f64::INFINITY);
        assert!(bool::from_bulk(b"t").unwrap());
        assert_eq!(String::from_bulk(b"pong").unwrap(), "pong");
        assert_eq!(
            i64::from_bulk(b"abc").unwrap_err().kind(),
            ErrorKind::NotANumber
        );
    }

    #[test]
    fn from_bulk_big_number() {
        let n = BigInt::from_bulk(b"3492890328409238509324850943850943825024385").unwrap();
        assert_eq!(
            n,
            BigInt::parse_bytes(b"3492890328409238509324850943850943825024385", 10).unwrap()
        );
    }
}
