//! The asynchronous connection engine.
//!
//! [`Connection`] is the public face: callers build [`crate::Request`]
//! values, submit them with [`Connection::exec`] and drive the socket with
//! [`Connection::run`].  All socket, parser and queue state is owned by the
//! single task inside `run`; the other operations communicate with it over
//! channels, which keeps the engine free of locks on its hot path.

mod connection;
mod driver;
mod health;

pub use connection::{CancelScope, Connection};
