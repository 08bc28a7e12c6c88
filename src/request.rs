use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::BuildHasher;

use crate::types::ToBulk;

// Acknowledgements for these verbs arrive as push elements, so they never
// occupy a reply slot.
const NO_REPLY_VERBS: &[&str] = &["SUBSCRIBE", "PSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE"];

/// Per-request policies consulted by the connection on submission, on
/// connection loss and on reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestConfig {
    /// Fail the request with `ConnectionLost` when the connection drops
    /// before a reply instead of waiting for the next connection.
    pub cancel_on_connection_lost: bool,
    /// Fail immediately with `NotConnected` when no connection is
    /// established at submission time.
    pub cancel_if_not_connected: bool,
    /// When the request was already written but the connection dropped
    /// before its reply arrived, fail it rather than resend it.  Appropriate
    /// for commands that are not idempotent.
    pub cancel_if_unresponded: bool,
    /// When the first command is `HELLO`, move the request to the front of
    /// the queue so the handshake precedes everything that has no bytes on
    /// the wire yet.
    pub hello_with_priority: bool,
}

impl Default for RequestConfig {
    fn default() -> RequestConfig {
        RequestConfig {
            cancel_on_connection_lost: true,
            cancel_if_not_connected: false,
            cancel_if_unresponded: false,
            hello_with_priority: true,
        }
    }
}

/// A batch of commands, encoded eagerly into a single buffer.
///
/// A request owns its bytes until it is settled, which lets the connection
/// retransmit it after a reconnect.  Any number of commands can be packed
/// into one request; they are written to the socket together and their
/// replies are routed back in order.
///
/// ```rust
/// let mut req = redmux::Request::new();
/// req.push("SET", ("key", 42));
/// req.push("GET", "key");
/// assert_eq!(req.commands(), 2);
/// ```
#[derive(Clone)]
pub struct Request {
    buf: Vec<u8>,
    commands: usize,
    no_reply: usize,
    starts_with_hello: bool,
    config: RequestConfig,
}

impl Default for Request {
    fn default() -> Request {
        Request::new()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("commands", &self.commands)
            .field("bytes", &self.buf.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Request {
    /// Creates an empty request with the default [`RequestConfig`].
    pub fn new() -> Request {
        Request::with_config(RequestConfig::default())
    }

    /// Creates an empty request with the given config.
    pub fn with_config(config: RequestConfig) -> Request {
        Request {
            buf: Vec::new(),
            commands: 0,
            no_reply: 0,
            starts_with_hello: false,
            config,
        }
    }

    /// Appends one command.  `args` is anything serializable into bulk
    /// strings: a single [`ToBulk`] value, a tuple of them, or `()` for a
    /// bare command.
    ///
    /// ```rust
    /// let mut req = redmux::Request::new();
    /// req.push("PING", ());
    /// req.push("HELLO", 3);
    /// req.push("SET", ("key", "value"));
    /// ```
    pub fn push<A: BulkSeq>(&mut self, verb: &str, args: A) {
        self.begin_command(verb, 1 + args.count());
        args.write_bulks(&mut self.buf);
    }

    /// Appends one command whose arguments are the elements of a container:
    /// one bulk per element for sequences and sets, two bulks (field, value)
    /// per entry in iteration order for maps.  The optional `key` goes
    /// between the verb and the range.
    ///
    /// ```rust
    /// let mut req = redmux::Request::new();
    /// req.push_range("RPUSH", Some("mylist"), &["a", "b", "c"][..]);
    /// ```
    pub fn push_range<R: RangeArgs>(&mut self, verb: &str, key: Option<&str>, range: R) {
        let extra = usize::from(key.is_some());
        self.begin_command(verb, 1 + extra + range.count());
        if let Some(key) = key {
            write_bulk(&mut self.buf, key.as_bytes());
        }
        range.write_bulks(&mut self.buf);
    }

    fn begin_command(&mut self, verb: &str, bulks: usize) {
        if self.commands == 0 {
            self.starts_with_hello = verb.eq_ignore_ascii_case("HELLO");
        }
        if NO_REPLY_VERBS.iter().any(|v| verb.eq_ignore_ascii_case(v)) {
            self.no_reply += 1;
        }
        self.commands += 1;
        write_header(&mut self.buf, bulks);
        write_bulk(&mut self.buf, verb.as_bytes());
    }

    /// Number of commands encoded so far.
    pub fn commands(&self) -> usize {
        self.commands
    }

    /// Number of replies the server will produce for this request, i.e. the
    /// command count minus the subscribe-family commands whose
    /// acknowledgement arrives as a push.
    pub fn expected_replies(&self) -> usize {
        self.commands - self.no_reply
    }

    /// The encoded wire bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Read access to the request policies.
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Write access to the request policies.
    pub fn config_mut(&mut self) -> &mut RequestConfig {
        &mut self.config
    }

    /// Removes all commands, keeping the config and the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.commands = 0;
        self.no_reply = 0;
        self.starts_with_hello = false;
    }

    // Whether this request jumps ahead of queued requests on submission.
    pub(crate) fn has_priority_hello(&self) -> bool {
        self.starts_with_hello && self.config.hello_with_priority
    }
}

fn write_header(buf: &mut Vec<u8>, bulks: usize) {
    let mut itoa_buf = itoa::Buffer::new();
    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(bulks).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn write_bulk(buf: &mut Vec<u8>, payload: &[u8]) {
    let mut itoa_buf = itoa::Buffer::new();
    buf.push(b'$');
    buf.extend_from_slice(itoa_buf.format(payload.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
}

/// The argument list of one command: zero or more values serialized through
/// [`ToBulk`], each becoming one bulk string.
pub trait BulkSeq {
    /// Number of bulks this value contributes.
    fn count(&self) -> usize;
    /// Encodes every bulk in order.
    fn write_bulks(&self, buf: &mut Vec<u8>);
}

impl BulkSeq for () {
    fn count(&self) -> usize {
        0
    }

    fn write_bulks(&self, _: &mut Vec<u8>) {}
}

macro_rules! single_bulk_seq_impl {
    ($($t:ty),*) => {
        $(
            impl BulkSeq for $t {
                fn count(&self) -> usize {
                    1
                }

                fn write_bulks(&self, buf: &mut Vec<u8>) {
                    let mut scratch = Vec::new();
                    self.to_bulk(&mut scratch);
                    write_bulk(buf, &scratch);
                }
            }
        )*
    };
}

single_bulk_seq_impl!(
    &str, String, &String, &[u8], Vec<u8>, &Vec<u8>, i8, i16, i32, i64, isize, u8, u16, u32, u64,
    usize, f32, f64
);

macro_rules! tuple_bulk_seq_impl {
    ($($name:ident),+) => {
        impl<$($name: ToBulk),+> BulkSeq for ($($name,)+) {
            fn count(&self) -> usize {
                [$(stringify!($name)),+].len()
            }

            #[allow(non_snake_case)]
            fn write_bulks(&self, buf: &mut Vec<u8>) {
                let ($(ref $name,)+) = *self;
                let mut scratch = Vec::new();
                $(
                    scratch.clear();
                    $name.to_bulk(&mut scratch);
                    write_bulk(buf, &scratch);
                )+
            }
        }
    };
}

tuple_bulk_seq_impl!(A);
tuple_bulk_seq_impl!(A, B);
tuple_bulk_seq_impl!(A, B, C);
tuple_bulk_seq_impl!(A, B, C, D);
tuple_bulk_seq_impl!(A, B, C, D, E);
tuple_bulk_seq_impl!(A, B, C, D, E, F);
tuple_bulk_seq_impl!(A, B, C, D, E, F, G);
tuple_bulk_seq_impl!(A, B, C, D, E, F, G, H);

/// A container whose elements become the trailing arguments of one command.
///
/// Sequences and sets contribute one bulk per element; maps contribute two
/// bulks per entry in iteration order.
pub trait RangeArgs {
    /// Number of bulks the container contributes.
    fn count(&self) -> usize;
    /// Encodes every bulk in order.
    fn write_bulks(&self, buf: &mut Vec<u8>);
}

fn write_range_item<T: ToBulk>(buf: &mut Vec<u8>, scratch: &mut Vec<u8>, item: &T) {
    scratch.clear();
    item.to_bulk(scratch);
    write_bulk(buf, scratch);
}

impl<T: ToBulk> RangeArgs for &[T] {
    fn count(&self) -> usize {
        self.len()
    }

    fn write_bulks(&self, buf: &mut Vec<u8>) {
        let mut scratch = Vec::new();
        for item in *self {
            write_range_item(buf, &mut scratch, item);
        }
    }
}

impl<T: ToBulk> RangeArgs for &Vec<T> {
    fn count(&self) -> usize {
        self.len()
    }

    fn write_bulks(&self, buf: &mut Vec<u8>) {
        self.as_slice().write_bulks(buf)
    }
}

impl<T: ToBulk> RangeArgs for &BTreeSet<T> {
    fn count(&self) -> usize {
        self.len()
    }

    fn write_bulks(&self, buf: &mut Vec<u8>) {
        let mut scratch = Vec::new();
        for item in *self {
            write_range_item(buf, &mut scratch, item);
        }
    }
}

impl<K: ToBulk, V: ToBulk> RangeArgs for &BTreeMap<K, V> {
    fn count(&self) -> usize {
        self.len() * 2
    }

    fn write_bulks(&self, buf: &mut Vec<u8>) {
        let mut scratch = Vec::new();
        for (field, value) in *self {
            write_range_item(buf, &mut scratch, field);
            write_range_item(buf, &mut scratch, value);
        }
    }
}

impl<K: ToBulk, V: ToBulk, S: BuildHasher> RangeArgs for &HashMap<K, V, S> {
    fn count(&self) -> usize {
        self.len() * 2
    }

    fn write_bulks(&self, buf: &mut Vec<u8>) {
        let mut scratch = Vec::new();
        for (field, value) in *self {
            write_range_item(buf, &mut scratch, field);
            write_range_item(buf, &mut scratch, value);
        }
    }
}
