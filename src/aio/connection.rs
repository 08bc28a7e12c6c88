use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use backon::BackoffBuilder;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use super::{driver, health};
use crate::adapter::{ResponseSink, TreeRef};
use crate::config::ConnectionConfig;
use crate::queue::{Entry, ReplyReceiver, RequestQueue};
use crate::request::Request;
use crate::types::{fail, ErrorKind, NodeList, RedisError, RedisResult};

// Everything the facade can ask of the connection task.
pub(crate) enum Command {
    Submit(Entry),
    Abort { id: u64 },
    Cancel(CancelScope),
    Fail(RedisError),
}

/// Selects which outstanding operations a [`Connection::cancel`] call
/// fails.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CancelScope {
    /// Fail requests that have no bytes on the wire yet.  Requests whose
    /// bytes are already written cannot be recalled without tearing the
    /// connection down.
    Exec,
    /// Wake pending [`Connection::receive`] calls with `Cancelled`.
    Receive,
    /// Close the socket and end [`Connection::run`].
    Run,
    /// All of the above, failing written requests too.
    All,
}

// Owned by whichever `run` call is active; survives between connections so
// the request queue outlives any single socket.
pub(crate) struct DriverState {
    pub(crate) rx: mpsc::UnboundedReceiver<Command>,
    pub(crate) queue: RequestQueue,
}

pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    connected: AtomicBool,
    next_id: AtomicU64,
    endpoint: ArcSwap<String>,
    push_tx: mpsc::UnboundedSender<NodeList>,
    push_rx: Mutex<mpsc::UnboundedReceiver<NodeList>>,
    receive_cancel: Notify,
    driver: Mutex<DriverState>,
}

impl Shared {
    pub(crate) fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn read_buffer_max(&self) -> Option<usize> {
        self.config.read_buffer_max
    }

    pub(crate) fn deliver_push(&self, tree: NodeList) {
        let _ = self.push_tx.send(tree);
    }

    pub(crate) fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub(crate) fn submit(&self, req: Request) -> (u64, ReplyReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit(Entry::new(id, req, tx)));
        (id, rx)
    }

    // Submission without the abort-on-drop linkage; dropping the returned
    // future leaves the request in the queue.  The health checker uses this
    // so a missed ping does not take the connection down by itself.
    pub(crate) async fn submit_and_wait(&self, req: Request) -> RedisResult<Vec<NodeList>> {
        let (_, rx) = self.submit(req);
        rx.await.map_err(|_| {
            RedisError::from((
                ErrorKind::OperationAborted,
                "The connection task dropped the request",
            ))
        })?
    }
}

// Re-arms on every exec; a drop before the reply arrives tells the
// connection task to abort the request.
struct AbortGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.send(Command::Abort { id: self.id });
        }
    }
}

/// A multiplexed connection to a RESP3 server.
///
/// The connection is cheap to clone; all clones share one socket, one
/// request queue and one push channel.  Requests submitted concurrently
/// from any number of tasks are pipelined onto the socket in submission
/// order and their replies routed back individually.
///
/// The object performs no I/O until [`Connection::run`] is awaited
/// somewhere; `run` owns the socket, reconnects according to the
/// configured back-off and spans as many TCP sessions as needed.
///
/// ```rust,no_run
/// # async fn example() -> redmux::RedisResult<()> {
/// use redmux::{adapter::One, ConnectionConfig, Connection};
///
/// let conn = Connection::new(ConnectionConfig::new("127.0.0.1:6379"));
/// tokio::spawn({
///     let conn = conn.clone();
///     async move { conn.run().await }
/// });
///
/// let mut req = conn.request();
/// req.push("PING", ());
/// let mut pong = One::<String>::new();
/// conn.exec(req, &mut pong).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.endpoint.load())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Creates a connection object.  No I/O happens here.
    pub fn new(config: ConnectionConfig) -> Connection {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let endpoint = ArcSwap::from_pointee(config.addr.clone());
        Connection {
            shared: Arc::new(Shared {
                config,
                cmd_tx,
                connected: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                endpoint,
                push_tx,
                push_rx: Mutex::new(push_rx),
                receive_cancel: Notify::new(),
                driver: Mutex::new(DriverState {
                    rx: cmd_rx,
                    queue: RequestQueue::new(),
                }),
            }),
        }
    }

    /// An empty request carrying the configured request defaults.
    pub fn request(&self) -> Request {
        Request::with_config(self.shared.config.request_defaults)
    }

    /// Whether a socket is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Replaces the endpoint used by the next reconnect attempt.  The
    /// current connection, if any, is left untouched.
    pub fn set_endpoint(&self, addr: impl Into<String>) {
        self.shared.endpoint.store(Arc::new(addr.into()));
    }

    /// Executes a request and adapts its replies into `sink`.
    ///
    /// Completes once every reply arrived or the request failed per its
    /// [`crate::RequestConfig`].  On success the command count is
    /// returned.  When a slot rejects its reply, the remaining replies are
    /// still adapted and the first slot-level error becomes the return
    /// value, so one failing command never destroys its neighbours'
    /// results.
    ///
    /// Dropping the returned future aborts the request: a request with no
    /// bytes on the wire is dequeued, one that was already written tears
    /// the connection down to keep replies aligned with commands.
    pub async fn exec<S: ResponseSink>(&self, req: Request, sink: &mut S) -> RedisResult<usize> {
        if req.commands() == 0 {
            fail!((ErrorKind::ClientError, "Cannot execute an empty request"));
        }
        if req.config().cancel_if_not_connected && !self.is_connected() {
            fail!((ErrorKind::NotConnected, "No connection is established"));
        }
        let expected = req.expected_replies();
        if let Some(slots) = sink.slot_count() {
            if slots != expected {
                fail!((
                    ErrorKind::ClientError,
                    "Sink shape does not match the request",
                    format!("{slots} slots for {expected} replies"),
                ));
            }
        }

        let commands = req.commands();
        let (id, rx) = self.shared.submit(req);
        let mut guard = AbortGuard {
            shared: &self.shared,
            id,
            armed: true,
        };
        let outcome = rx.await;
        guard.armed = false;
        let trees = outcome.map_err(|_| {
            RedisError::from((
                ErrorKind::OperationAborted,
                "The connection task dropped the request",
            ))
        })??;

        let mut first_err = None;
        for (index, tree) in trees.iter().enumerate() {
            if let Err(err) = sink.slot_mut(index).fill(TreeRef::new(tree)) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(commands),
        }
    }

    /// Waits for the next server push and returns its node sequence.
    ///
    /// Pushes are delivered in arrival order, exactly once, independently
    /// of any in-flight requests.  They are buffered while nobody is
    /// receiving, across reconnects included.
    pub async fn receive(&self) -> RedisResult<NodeList> {
        let mut rx = self.shared.push_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.receive_cancel.notified() => {
                fail!((ErrorKind::Cancelled, "receive was cancelled"))
            }
            tree = rx.recv() => tree.ok_or_else(|| {
                RedisError::from((ErrorKind::OperationAborted, "Push channel closed"))
            }),
        }
    }

    /// Fails the outstanding operations in `scope`.
    ///
    /// Scopes that touch the queue take effect on the connection task; a
    /// `Run` or `Exec` cancel issued while no `run` is active applies when
    /// the next one starts.
    pub fn cancel(&self, scope: CancelScope) {
        match scope {
            CancelScope::Receive => self.shared.receive_cancel.notify_waiters(),
            CancelScope::Exec | CancelScope::Run => self.shared.send(Command::Cancel(scope)),
            CancelScope::All => {
                self.shared.receive_cancel.notify_waiters();
                self.shared.send(Command::Cancel(scope));
            }
        }
    }

    /// Connects to the configured endpoint and drives the connection until
    /// a fatal error or a `Run` cancel.
    ///
    /// Recoverable failures (connection loss, missed pings, parse errors)
    /// trigger a reconnect according to the configured back-off; the
    /// request queue survives, minus the requests failed by their own
    /// config.  A rejected handshake and cancellation are terminal.
    pub async fn run(&self) -> RedisResult<()> {
        let mut state = self.try_lock_driver()?;
        let mut backoff = self.shared.config.reconnect.clone().build();
        loop {
            let addr = self.shared.endpoint.load_full();
            let err = match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    backoff = self.shared.config.reconnect.clone().build();
                    self.drive_session(&mut state, stream).await
                }
                Err(err) => {
                    warn!("failed to connect to {addr}: {err}");
                    RedisError::from(err)
                }
            };
            if !err.is_recoverable() {
                return Err(err);
            }
            match backoff.next() {
                Some(delay) => {
                    debug!("reconnecting in {delay:?} after: {err}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("exhausted reconnect attempts: {err}");
                    return Err(err);
                }
            }
        }
    }

    /// Drives a single session over a caller-supplied stream, without
    /// reconnecting.  Useful for tests and for transports the connection
    /// does not know how to open itself.
    pub async fn run_on<S>(&self, stream: S) -> RedisResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut state = self.try_lock_driver()?;
        Err(self.drive_session(&mut state, stream).await)
    }

    fn try_lock_driver(&self) -> RedisResult<tokio::sync::MutexGuard<'_, DriverState>> {
        self.shared.driver.try_lock().map_err(|_| {
            RedisError::from((
                ErrorKind::ClientError,
                "run is already active on this connection",
            ))
        })
    }

    async fn drive_session<S>(&self, state: &mut DriverState, stream: S) -> RedisError
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        // Submitted before the first queue poll so the handshake precedes
        // any request retransmitted from the previous session.
        let handshake = health::start_handshake(&self.shared);
        let session = driver::run_session(&self.shared, state, stream);
        let supervisor = health::supervise(&self.shared, handshake);
        tokio::select! {
            err = session => err,
            err = supervisor => err,
        }
    }
}
