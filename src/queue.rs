use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::sync::oneshot;

use crate::request::{Request, RequestConfig};
use crate::types::{fail, ErrorKind, NodeList, RedisError, RedisResult};

pub(crate) type ReplySender = oneshot::Sender<RedisResult<Vec<NodeList>>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<RedisResult<Vec<NodeList>>>;

/// Lifecycle of a request inside the connection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestState {
    /// Built but not yet handed to the connection.
    Staged,
    /// Enqueued; none of its bytes have been written.
    Queued,
    /// All bytes written, awaiting replies.
    InFlight,
    /// All replies delivered.
    Settled,
    /// Failed or aborted before settling.
    Cancelled,
}

// One submitted request together with its reply bookkeeping.
pub(crate) struct Entry {
    pub(crate) id: u64,
    req: Request,
    expected: usize,
    replies: Vec<NodeList>,
    acked: usize,
    state: RequestState,
    reply_tx: Option<ReplySender>,
}

impl Entry {
    pub(crate) fn new(id: u64, req: Request, reply_tx: ReplySender) -> Entry {
        let expected = req.expected_replies();
        Entry {
            id,
            req,
            expected,
            replies: Vec::new(),
            acked: 0,
            state: RequestState::Staged,
            reply_tx: Some(reply_tx),
        }
    }

    pub(crate) fn has_priority_hello(&self) -> bool {
        self.req.has_priority_hello()
    }

    fn config(&self) -> &RequestConfig {
        self.req.config()
    }

    fn len(&self) -> usize {
        self.req.bytes().len()
    }

    fn is_complete(&self) -> bool {
        self.replies.len() == self.expected
    }

    fn settle(mut self) {
        self.state = RequestState::Settled;
        if let Some(tx) = self.reply_tx.take() {
            let _ = tx.send(Ok(std::mem::take(&mut self.replies)));
        }
    }

    fn fail(mut self, err: &RedisError) {
        self.state = RequestState::Cancelled;
        if let Some(tx) = self.reply_tx.take() {
            let _ = tx.send(Err(err.clone_mostly()));
        }
    }

    // Forget any wire progress so the request can be retransmitted from its
    // buffer on a fresh socket.
    fn rewind(&mut self) {
        self.acked = 0;
        self.replies.clear();
        self.state = RequestState::Queued;
    }
}

pub(crate) enum AbortOutcome {
    /// The request had no bytes on the wire and was dequeued.
    Removed,
    /// Bytes were already written; the connection must go down to keep the
    /// reply sequence aligned.
    TearDown,
    NotFound,
}

/// The ordered set of submitted requests.
///
/// `pending` holds requests none of whose bytes have been handed to the
/// socket; `written` holds requests in wire order from the moment their
/// bytes enter the write buffer.  A request never moves backwards, which
/// preserves the positional correspondence between commands and replies.
pub(crate) struct RequestQueue {
    pending: VecDeque<Entry>,
    written: VecDeque<Entry>,
}

impl RequestQueue {
    pub(crate) fn new() -> RequestQueue {
        RequestQueue {
            pending: VecDeque::new(),
            written: VecDeque::new(),
        }
    }

    /// Places a request at the tail.
    pub(crate) fn enqueue(&mut self, mut entry: Entry) {
        entry.state = RequestState::Queued;
        self.pending.push_back(entry);
    }

    /// Places a request as early as possible: ahead of everything that has
    /// no bytes on the wire, behind everything that has.
    pub(crate) fn enqueue_priority(&mut self, mut entry: Entry) {
        entry.state = RequestState::Queued;
        self.pending.push_front(entry);
    }

    pub(crate) fn has_unwritten(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Moves the bytes of every queued request into the write buffer in one
    /// go, so concurrent submitters share a single socket write.
    pub(crate) fn coalesce_into(&mut self, wbuf: &mut BytesMut) {
        while let Some(entry) = self.pending.pop_front() {
            wbuf.extend_from_slice(entry.req.bytes());
            self.written.push_back(entry);
        }
    }

    /// Accounts for `n` bytes drained from the write buffer to the socket.
    pub(crate) fn advance_write(&mut self, mut n: usize) {
        for entry in self.written.iter_mut() {
            if n == 0 {
                break;
            }
            let room = entry.len() - entry.acked;
            let take = room.min(n);
            entry.acked += take;
            n -= take;
            if entry.acked == entry.len() {
                entry.state = RequestState::InFlight;
            }
        }
        self.settle_ready();
    }

    /// Routes one completed tree into the earliest request that still
    /// expects replies.
    pub(crate) fn deliver_reply(&mut self, tree: NodeList) -> RedisResult<()> {
        let Some(entry) = self.written.iter_mut().find(|e| !e.is_complete()) else {
            fail!((
                ErrorKind::ClientError,
                "Response without a matching request"
            ));
        };
        entry.replies.push(tree);
        self.settle_ready();
        Ok(())
    }

    // Settles fully-written requests whose replies are all in.  Requests
    // without reply slots settle as soon as their bytes are out, even while
    // an older request is still waiting.
    fn settle_ready(&mut self) {
        let mut index = 0;
        while index < self.written.len() {
            let entry = &self.written[index];
            if entry.state == RequestState::InFlight && entry.is_complete() {
                let entry = self.written.remove(index).expect("index in range");
                entry.settle();
            } else {
                index += 1;
            }
        }
    }

    /// Handles a caller dropping its `exec` before completion.
    pub(crate) fn abort(&mut self, id: u64) -> AbortOutcome {
        if let Some(pos) = self.pending.iter().position(|e| e.id == id) {
            let mut entry = self.pending.remove(pos).expect("position just found");
            entry.state = RequestState::Cancelled;
            return AbortOutcome::Removed;
        }
        if let Some(pos) = self.written.iter().position(|e| e.id == id) {
            let mut entry = self.written.remove(pos).expect("position just found");
            entry.state = RequestState::Cancelled;
            return AbortOutcome::TearDown;
        }
        AbortOutcome::NotFound
    }

    /// Fails every request with no bytes on the wire.  In-flight writes are
    /// already committed and cannot be recalled.
    pub(crate) fn fail_pending(&mut self, err: &RedisError) {
        for entry in self.pending.drain(..) {
            entry.fail(err);
        }
    }

    /// Fails everything, written or not.
    pub(crate) fn fail_all(&mut self, err: &RedisError) {
        for entry in self.written.drain(..).chain(self.pending.drain(..)) {
            entry.fail(err);
        }
    }

    /// Applies the per-request policies after the socket died: requests
    /// that opted in are failed with `ConnectionLost`, the rest rewind and
    /// queue up for retransmission on the next connection, wire order
    /// preserved.
    pub(crate) fn disconnect(&mut self) {
        let lost = RedisError::from((
            ErrorKind::ConnectionLost,
            "Connection lost before a reply arrived",
        ));
        let mut survivors = VecDeque::new();
        for mut entry in std::mem::take(&mut self.written) {
            if entry.config().cancel_on_connection_lost || entry.config().cancel_if_unresponded {
                entry.fail(&lost);
            } else {
                entry.rewind();
                survivors.push_back(entry);
            }
        }
        for entry in std::mem::take(&mut self.pending) {
            if entry.config().cancel_on_connection_lost {
                entry.fail(&lost);
            } else {
                survivors.push_back(entry);
            }
        }
        self.pending = survivors;
    }

    #[cfg(test)]
    fn wire_order(&self) -> Vec<u64> {
        self.written
            .iter()
            .chain(self.pending.iter())
            .map(|e| e.id)
            .collect()
    }
}
