use std::io;

use bytes::BytesMut;
use futures_util::StreamExt;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;

use super::connection::{CancelScope, Command, DriverState, Shared};
use crate::parser::NodeCodec;
use crate::queue::{AbortOutcome, RequestQueue};
use crate::types::{ErrorKind, NodeList, RedisError, RedisResult, Resp3Type};

/// One TCP session of the multiplexer: pumps request bytes out and replies
/// in until something fails.  Returns the error that ended the session
/// after applying the per-request disconnect policies to the queue.
///
/// The loop prefers, in order: commands from the facade, writes, reads.
/// Before blocking it drains every command already sent and coalesces all
/// queued request bytes into one buffer, so submissions that arrive
/// together leave in a single socket write.  Writes never wait for
/// replies, which is what pipelines concurrent callers.
pub(crate) async fn run_session<S>(
    shared: &Shared,
    state: &mut DriverState,
    stream: S,
) -> RedisError
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let DriverState { rx, queue } = state;
    let (rd, mut wr) = tokio::io::split(stream);
    let mut frames = FramedRead::new(rd, NodeCodec::new(shared.read_buffer_max()));
    let mut wbuf = BytesMut::new();
    let mut pending_attr: Option<NodeList> = None;

    shared.set_connected(true);
    debug!("session established");

    let err = 'session: loop {
        while let Ok(cmd) = rx.try_recv() {
            if let Some(err) = apply_command(queue, Some(cmd)) {
                break 'session err;
            }
        }
        if wbuf.is_empty() {
            queue.coalesce_into(&mut wbuf);
        }
        let want_write = !wbuf.is_empty();

        tokio::select! {
            biased;

            cmd = rx.recv() => {
                if let Some(err) = apply_command(queue, cmd) {
                    break 'session err;
                }
            }

            res = wr.write_buf(&mut wbuf), if want_write => match res {
                Ok(0) => break 'session io::Error::from(io::ErrorKind::WriteZero).into(),
                Ok(n) => queue.advance_write(n),
                Err(err) => break 'session err.into(),
            },

            item = frames.next() => match item {
                Some(Ok(tree)) => {
                    if let Err(err) = dispatch(shared, queue, &mut pending_attr, tree) {
                        break 'session err;
                    }
                }
                Some(Err(err)) => break 'session err,
                None => break 'session RedisError::from((
                    ErrorKind::ConnectionLost,
                    "Server closed the connection",
                )),
            },
        }
    };

    shared.set_connected(false);
    debug!("session ended: {err}");
    queue.disconnect();
    err
}

// Applies one facade command to the queue.  A returned error ends the
// session.
fn apply_command(queue: &mut RequestQueue, cmd: Option<Command>) -> Option<RedisError> {
    match cmd {
        Some(Command::Submit(entry)) => {
            if entry.has_priority_hello() {
                queue.enqueue_priority(entry);
            } else {
                queue.enqueue(entry);
            }
            None
        }
        Some(Command::Abort { id }) => match queue.abort(id) {
            // Recalling written bytes is impossible; realign replies by
            // starting over on a fresh socket.
            AbortOutcome::TearDown => Some(RedisError::from((
                ErrorKind::ConnectionLost,
                "Connection reset to abort an in-flight request",
            ))),
            AbortOutcome::Removed | AbortOutcome::NotFound => None,
        },
        Some(Command::Cancel(scope)) => match scope {
            CancelScope::Exec => {
                queue.fail_pending(&cancelled());
                None
            }
            CancelScope::Run => Some(RedisError::from((
                ErrorKind::OperationAborted,
                "run was cancelled",
            ))),
            CancelScope::All => {
                queue.fail_all(&cancelled());
                Some(RedisError::from((
                    ErrorKind::OperationAborted,
                    "connection was cancelled",
                )))
            }
            CancelScope::Receive => None,
        },
        Some(Command::Fail(err)) => Some(err),
        None => Some(RedisError::from((
            ErrorKind::OperationAborted,
            "connection handle dropped",
        ))),
    }
}

// The top-level routing decision for every completed tree: pushes go to
// the push channel, attributes stick to the element that follows them,
// everything else is a reply for the oldest request still waiting.
fn dispatch(
    shared: &Shared,
    queue: &mut RequestQueue,
    pending_attr: &mut Option<NodeList>,
    tree: NodeList,
) -> RedisResult<()> {
    match tree.first().map(|node| node.kind) {
        Some(Resp3Type::Attribute) => {
            match pending_attr {
                Some(attr) => attr.extend(tree),
                None => *pending_attr = Some(tree),
            }
            Ok(())
        }
        Some(Resp3Type::Push) => {
            shared.deliver_push(with_attr(pending_attr, tree));
            Ok(())
        }
        _ => queue.deliver_reply(with_attr(pending_attr, tree)),
    }
}

fn with_attr(pending_attr: &mut Option<NodeList>, tree: NodeList) -> NodeList {
    match pending_attr.take() {
        Some(mut attr) => {
            attr.extend(tree);
            attr
        }
        None => tree,
    }
}

fn cancelled() -> RedisError {
    RedisError::from((ErrorKind::Cancelled, "Operation cancelled"))
}
