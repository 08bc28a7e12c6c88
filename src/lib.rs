//! redmux is a multiplexed, fully asynchronous connection engine for
//! servers speaking the RESP3 protocol.
//!
//! One [`Connection`] carries any number of concurrent callers: requests
//! are pipelined onto a single socket in submission order, replies and
//! out-of-band server pushes are separated as they arrive, and the
//! connection heals itself across TCP sessions with the request queue
//! intact.
//!
//! # Basic operation
//!
//! Build a [`Request`] (one or more commands packed into one buffer), pick
//! a response sink describing the shape you expect back, and execute:
//!
//! ```rust,no_run
//! use redmux::adapter::One;
//! use redmux::{Connection, ConnectionConfig};
//!
//! # async fn example() -> redmux::RedisResult<()> {
//! let conn = Connection::new(ConnectionConfig::new("127.0.0.1:6379"));
//! tokio::spawn({
//!     let conn = conn.clone();
//!     async move { conn.run().await }
//! });
//!
//! let mut req = conn.request();
//! req.push("SET", ("greeting", "hello"));
//! req.push("GET", "greeting");
//!
//! let mut sink = (One::<String>::new(), One::<String>::new());
//! conn.exec(req, &mut sink).await?;
//! assert_eq!(sink.1.into_result()?, "hello");
//! # Ok(())
//! # }
//! ```
//!
//! Response sinks are tuples of slots, one per command: scalars
//! ([`adapter::One`]), optionals ([`adapter::Opt`]), sequences
//! ([`adapter::Seq`]), maps ([`adapter::MapOf`]), sets
//! ([`adapter::SetOf`]), the raw node escape hatch ([`adapter::Nodes`]),
//! and [`adapter::Ignore`] for replies nobody cares about.  A nested tuple
//! adapts a transaction's `EXEC` reply positionally.  Server errors and
//! shape mismatches land in the slot they belong to without disturbing
//! their neighbours.
//!
//! # Pipelining
//!
//! Callers never wait for each other.  Submitting from many tasks
//! concurrently coalesces all queued request bytes into single socket
//! writes, and replies are matched back by wire order.  There is no
//! per-command future chain; one task owns the socket and everything else
//! talks to it through channels.
//!
//! # Server pushes
//!
//! After `SUBSCRIBE` (whose acknowledgement arrives as a push, not a
//! reply), out-of-band messages are consumed separately from replies:
//!
//! ```rust,no_run
//! # async fn example(conn: redmux::Connection) -> redmux::RedisResult<()> {
//! let mut req = conn.request();
//! req.push("SUBSCRIBE", "news");
//! conn.exec(req, &mut ()).await?;
//!
//! loop {
//!     let push = conn.receive().await?;
//!     println!("push: {push:?}");
//! }
//! # }
//! ```
//!
//! # Connection lifecycle
//!
//! [`Connection::run`] owns the socket: it connects, performs the `HELLO 3`
//! handshake (with `AUTH` when credentials are configured), verifies
//! liveness with periodic tagged `PING`s and reconnects with the
//! configured back-off when the transport fails.  Requests decide their
//! own fate across reconnects through [`RequestConfig`]: by default a
//! dropped connection fails them with `ConnectionLost`, but a request may
//! opt into surviving and being retransmitted.
//!
//! # Serialization hooks
//!
//! Two traits connect user types to the wire: [`ToBulk`] turns a value
//! into one bulk-string payload during encoding, [`FromBulk`] converts a
//! reply payload back.  The built-in implementations cover byte strings,
//! integers, floats, booleans and big numbers.

#![deny(non_ascii_idents)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adapter;
pub mod aio;
mod config;
mod parser;
mod queue;
mod request;
mod types;

pub use crate::aio::{CancelScope, Connection};
pub use crate::config::ConnectionConfig;
pub use crate::parser::{parse_nodes, NodeCodec, NodeParser};
pub use crate::queue::RequestState;
pub use crate::request::{BulkSeq, RangeArgs, Request, RequestConfig};
pub use crate::types::{
    ErrorKind, FromBulk, Node, NodeList, NodeValue, RedisError, RedisResult, Resp3Type, ToBulk,
};
