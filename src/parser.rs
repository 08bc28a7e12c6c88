use std::mem;
use std::str::from_utf8;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{fail, ErrorKind, Node, NodeList, RedisError, RedisResult, Resp3Type};

const MAX_NESTING_DEPTH: usize = 100;

// One open aggregate.  `remaining` counts outstanding children; `None` marks
// a streamed element that is closed by a sentinel instead of a count.
struct Frame {
    kind: Resp3Type,
    remaining: Option<usize>,
    attribute: bool,
}

/// The incremental RESP3 parser.
///
/// Feed it a buffer of received bytes and it yields one complete top-level
/// tree at a time as a flat pre-order [`NodeList`].  A partial element is
/// never consumed: when [`NodeParser::parse`] returns `Ok(None)` the
/// unparsed suffix stays in the buffer and parsing resumes exactly where it
/// left off once more bytes arrive.  Feeding a message split at arbitrary
/// points therefore produces the same trees as feeding it whole.
pub struct NodeParser {
    stack: Vec<Frame>,
    nodes: NodeList,
    max_size: Option<usize>,
}

impl Default for NodeParser {
    fn default() -> Self {
        NodeParser::new(None)
    }
}

impl NodeParser {
    /// Creates a parser.  When `max_size` is set, any declared payload or
    /// aggregate size above it fails with [`ErrorKind::ExceedsMaxSize`].
    pub fn new(max_size: Option<usize>) -> NodeParser {
        NodeParser {
            stack: Vec::new(),
            nodes: Vec::new(),
            max_size,
        }
    }

    /// Consumes as many complete elements from `buf` as possible and
    /// returns the next complete top-level tree, or `Ok(None)` when more
    /// bytes are needed.
    ///
    /// A top-level attribute element is returned as its own tree (root kind
    /// [`Resp3Type::Attribute`]); associating it with the element that
    /// follows is left to the caller.
    pub fn parse(&mut self, buf: &mut BytesMut) -> RedisResult<Option<NodeList>> {
        loop {
            if !self.step(buf)? {
                return Ok(None);
            }
            if self.stack.is_empty() {
                return Ok(Some(mem::take(&mut self.nodes)));
            }
        }
    }

    /// True while a tree is partially parsed.  Used to distinguish a clean
    /// end of stream from one that cuts an element in half.
    pub fn is_mid_tree(&self) -> bool {
        !self.nodes.is_empty() || !self.stack.is_empty()
    }

    fn check_cap(&self, size: usize) -> RedisResult<()> {
        if let Some(max) = self.max_size {
            if size > max {
                fail!((
                    ErrorKind::ExceedsMaxSize,
                    "Element exceeds the configured size cap",
                    format!("{size} > {max}")
                ));
            }
        }
        Ok(())
    }

    // Parses one element header (plus payload for bulks) from the front of
    // `buf`.  Returns false when the element is still incomplete; in that
    // case nothing was consumed.
    fn step(&mut self, buf: &mut BytesMut) -> RedisResult<bool> {
        if buf.is_empty() {
            return Ok(false);
        }
        let tag = buf[0];
        let eol = match find_crlf(&buf[1..])? {
            Some(i) => i,
            None => {
                self.check_cap(buf.len())?;
                return Ok(false);
            }
        };
        let line_len = 1 + eol + 2;
        let depth = self.stack.len();

        match tag {
            b'+' | b'-' | b':' | b',' | b'#' | b'(' | b'_' => {
                let kind = match tag {
                    b'+' => Resp3Type::SimpleString,
                    b'-' => Resp3Type::SimpleError,
                    b':' => Resp3Type::Number,
                    b',' => Resp3Type::Double,
                    b'#' => Resp3Type::Boolean,
                    b'(' => Resp3Type::BigNumber,
                    _ => Resp3Type::Null,
                };
                buf.advance(1);
                let payload = buf.split_to(eol).freeze();
                buf.advance(2);
                self.nodes.push(Node::leaf(kind, depth, payload));
                self.complete_child();
            }
            b'$' | b'!' | b'=' => {
                let kind = match tag {
                    b'$' => Resp3Type::BlobString,
                    b'!' => Resp3Type::BlobError,
                    _ => Resp3Type::VerbatimString,
                };
                if &buf[1..1 + eol] == b"?" {
                    if tag != b'$' {
                        fail!((
                            ErrorKind::NotANumber,
                            "Only blob strings support streaming"
                        ));
                    }
                    if depth >= MAX_NESTING_DEPTH {
                        fail!((ErrorKind::ExceedsMaxSize, "Maximum nesting depth exceeded"));
                    }
                    buf.advance(line_len);
                    self.nodes.push(Node::streamed(kind, depth));
                    self.stack.push(Frame {
                        kind,
                        remaining: None,
                        attribute: false,
                    });
                    return Ok(true);
                }
                let size = parse_size(&buf[1..1 + eol])?;
                if size < 0 {
                    // RESP2 null bulk, seen before the protocol upgrade.
                    buf.advance(line_len);
                    self.nodes.push(Node::leaf(Resp3Type::Null, depth, Bytes::new()));
                    self.complete_child();
                    return Ok(true);
                }
                let size = size as usize;
                self.check_cap(size)?;
                if buf.len() < line_len + size + 2 {
                    return Ok(false);
                }
                if &buf[line_len + size..line_len + size + 2] != b"\r\n" {
                    fail!((
                        ErrorKind::ExpectedNewline,
                        "Bulk payload not terminated by CRLF"
                    ));
                }
                buf.advance(line_len);
                let payload = buf.split_to(size).freeze();
                buf.advance(2);
                self.nodes.push(Node::leaf(kind, depth, payload));
                self.complete_child();
            }
            b';' => {
                let in_streamed_string = matches!(
                    self.stack.last(),
                    Some(Frame {
                        kind: Resp3Type::BlobString,
                        remaining: None,
                        ..
                    })
                );
                if !in_streamed_string {
                    fail!((
                        ErrorKind::InvalidTypeByte,
                        "Streamed segment outside a streamed string"
                    ));
                }
                let size = parse_size(&buf[1..1 + eol])?;
                if size < 0 {
                    fail!((ErrorKind::NotANumber, "Negative streamed segment size"));
                }
                let size = size as usize;
                self.check_cap(size)?;
                if size == 0 {
                    buf.advance(line_len);
                    self.nodes
                        .push(Node::leaf(Resp3Type::StreamedStringPart, depth, Bytes::new()));
                    self.stack.pop();
                    self.complete_child();
                    return Ok(true);
                }
                if buf.len() < line_len + size + 2 {
                    return Ok(false);
                }
                if &buf[line_len + size..line_len + size + 2] != b"\r\n" {
                    fail!((
                        ErrorKind::ExpectedNewline,
                        "Streamed segment not terminated by CRLF"
                    ));
                }
                buf.advance(line_len);
                let payload = buf.split_to(size).freeze();
                buf.advance(2);
                self.nodes
                    .push(Node::leaf(Resp3Type::StreamedStringPart, depth, payload));
                // Segments never count against a declared size.
            }
            b'*' | b'~' | b'%' | b'|' | b'>' => {
                let kind = match tag {
                    b'*' => Resp3Type::Array,
                    b'~' => Resp3Type::Set,
                    b'%' => Resp3Type::Map,
                    b'|' => Resp3Type::Attribute,
                    _ => Resp3Type::Push,
                };
                if depth >= MAX_NESTING_DEPTH {
                    fail!((ErrorKind::ExceedsMaxSize, "Maximum nesting depth exceeded"));
                }
                if &buf[1..1 + eol] == b"?" {
                    buf.advance(line_len);
                    self.nodes.push(Node::streamed(kind, depth));
                    self.stack.push(Frame {
                        kind,
                        remaining: None,
                        attribute: kind == Resp3Type::Attribute,
                    });
                    return Ok(true);
                }
                let size = parse_size(&buf[1..1 + eol])?;
                if size < 0 {
                    // RESP2 null array.
                    buf.advance(line_len);
                    self.nodes.push(Node::leaf(Resp3Type::Null, depth, Bytes::new()));
                    self.complete_child();
                    return Ok(true);
                }
                let size = size as usize;
                self.check_cap(size)?;
                buf.advance(line_len);
                self.nodes.push(Node::aggregate(kind, depth, size));
                let children = size * kind.children_per_unit();
                if children == 0 {
                    if kind != Resp3Type::Attribute {
                        self.complete_child();
                    }
                } else {
                    self.stack.push(Frame {
                        kind,
                        remaining: Some(children),
                        attribute: kind == Resp3Type::Attribute,
                    });
                }
            }
            b'.' => {
                let streamed_aggregate = matches!(
                    self.stack.last(),
                    Some(Frame { kind, remaining: None, .. }) if kind.is_aggregate()
                );
                if !streamed_aggregate {
                    fail!((
                        ErrorKind::InvalidTypeByte,
                        "Stream terminator outside a streamed aggregate"
                    ));
                }
                buf.advance(line_len);
                self.nodes
                    .push(Node::leaf(Resp3Type::StreamedStringPart, depth, Bytes::new()));
                let frame = self.stack.pop().expect("checked above");
                if !frame.attribute {
                    self.complete_child();
                }
            }
            _ => fail!((
                ErrorKind::InvalidTypeByte,
                "Invalid response type byte",
                format!("{:?}", char::from(tag))
            )),
        }
        Ok(true)
    }

    // A sub-tree just completed: account for it in the enclosing frames.
    // Attribute sub-trees are siblings of the element they annotate and do
    // not count toward the enclosing aggregate's size.
    fn complete_child(&mut self) {
        while let Some(top) = self.stack.last_mut() {
            match top.remaining {
                None => break,
                Some(ref mut remaining) => {
                    *remaining -= 1;
                    if *remaining > 0 {
                        break;
                    }
                    let frame = self.stack.pop().expect("non-empty stack");
                    if frame.attribute {
                        break;
                    }
                }
            }
        }
    }
}

// Returns the offset of the `\r` terminating the current line, or `None`
// when the line is still incomplete.  Headers never legally contain a bare
// line feed.
fn find_crlf(buf: &[u8]) -> RedisResult<Option<usize>> {
    match buf.iter().position(|&b| b == b'\r') {
        Some(i) => {
            if i + 1 >= buf.len() {
                return Ok(None);
            }
            if buf[i + 1] != b'\n' {
                fail!((ErrorKind::ExpectedNewline, "Expected CRLF line ending"));
            }
            Ok(Some(i))
        }
        None => {
            if buf.contains(&b'\n') {
                fail!((ErrorKind::ExpectedNewline, "Expected CRLF line ending"));
            }
            Ok(None)
        }
    }
}

fn parse_size(header: &[u8]) -> RedisResult<i64> {
    from_utf8(header)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RedisError::from((
                ErrorKind::NotANumber,
                "Malformed size header",
                String::from_utf8_lossy(header).into_owned(),
            ))
        })
}

/// Codec adapter so the parser can drive a
/// [`tokio_util::codec::FramedRead`].  Decoded items are complete top-level
/// trees; the encoder side passes already-encoded request bytes through
/// untouched.
pub struct NodeCodec {
    parser: NodeParser,
}

impl NodeCodec {
    /// Creates a codec with an optional element size cap.
    pub fn new(max_size: Option<usize>) -> NodeCodec {
        NodeCodec {
            parser: NodeParser::new(max_size),
        }
    }
}

impl Default for NodeCodec {
    fn default() -> Self {
        NodeCodec::new(None)
    }
}

impl Decoder for NodeCodec {
    type Item = NodeList;
    type Error = RedisError;

    fn decode(&mut self, src: &mut BytesMut) -> RedisResult<Option<NodeList>> {
        self.parser.parse(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> RedisResult<Option<NodeList>> {
        match self.parser.parse(src)? {
            Some(tree) => Ok(Some(tree)),
            None => {
                if !src.is_empty() || self.parser.is_mid_tree() {
                    fail!((
                        ErrorKind::UnexpectedEof,
                        "Stream ended in the middle of an element"
                    ));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for NodeCodec {
    type Error = RedisError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> RedisResult<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Parses a single complete tree out of a byte slice.
///
/// This is the most straightforward way to inspect a response without
/// setting up a whole parser; trailing bytes after the first tree are
/// ignored.
pub fn parse_nodes(bytes: &[u8]) -> RedisResult<NodeList> {
    let mut buf = BytesMut::from(bytes);
    match NodeParser::default().parse(&mut buf)? {
        Some(tree) => Ok(tree),
        None => fail!((
            ErrorKind::UnexpectedEof,
            "Incomplete element in input"
        )),
    }
}
