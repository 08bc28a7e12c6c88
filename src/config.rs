use std::time::Duration;

use backon::ExponentialBuilder;

use crate::request::RequestConfig;

/// Configuration for a [`crate::aio::Connection`].
///
/// ```rust
/// use std::time::Duration;
///
/// let config = redmux::ConnectionConfig::new("127.0.0.1:6379")
///     .set_auth("user", "secret")
///     .set_health_check_interval(Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub(crate) addr: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) hello_on_connect: bool,
    pub(crate) reconnect: ExponentialBuilder,
    pub(crate) health_check_interval: Duration,
    pub(crate) resp3_handshake_timeout: Duration,
    pub(crate) read_buffer_max: Option<usize>,
    pub(crate) request_defaults: RequestConfig,
}

impl ConnectionConfig {
    const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
    const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
    const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(1);
    const DEFAULT_RECONNECT_RETRIES: usize = 6;

    /// Creates a configuration for the given `host:port` endpoint with
    /// defaults for everything else.
    pub fn new(addr: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig {
            addr: addr.into(),
            username: None,
            password: None,
            hello_on_connect: true,
            reconnect: ExponentialBuilder::default()
                .with_min_delay(Self::DEFAULT_RECONNECT_WAIT)
                .with_max_times(Self::DEFAULT_RECONNECT_RETRIES)
                .with_jitter(),
            health_check_interval: Self::DEFAULT_HEALTH_CHECK_INTERVAL,
            resp3_handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            read_buffer_max: None,
            request_defaults: RequestConfig::default(),
        }
    }

    /// The configured endpoint.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Authenticate during the protocol handshake: `HELLO 3 AUTH <username>
    /// <password>` is sent as one command, making authentication atomic
    /// with the protocol upgrade.
    pub fn set_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Whether `run` performs the `HELLO 3` handshake on every fresh
    /// socket.  Enabled by default; disable it when talking to a server
    /// that already speaks RESP3 without negotiation, or to drive the
    /// handshake yourself.
    pub fn set_hello_on_connect(mut self, value: bool) -> Self {
        self.hello_on_connect = value;
        self
    }

    /// Replaces the reconnect back-off schedule.
    pub fn set_reconnect(mut self, backoff: ExponentialBuilder) -> Self {
        self.reconnect = backoff;
        self
    }

    /// Waits a fixed duration between reconnect attempts, forever.  A
    /// shorthand for a constant [`ConnectionConfig::set_reconnect`]
    /// schedule.
    pub fn set_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect = ExponentialBuilder::default()
            .with_min_delay(wait)
            .with_max_delay(wait)
            .without_max_times();
        self
    }

    /// Interval of the PING-based liveness probe.  `Duration::ZERO`
    /// disables health checking.  Defaults to two seconds.
    pub fn set_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// How long the `HELLO 3` handshake may take before the connection is
    /// failed with `HandshakeFailed`.
    pub fn set_resp3_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.resp3_handshake_timeout = timeout;
        self
    }

    /// Caps the size of any single response element.  Elements above the
    /// cap fail the connection with `ExceedsMaxSize`.  Unlimited by
    /// default.
    pub fn set_read_buffer_max(mut self, max: usize) -> Self {
        self.read_buffer_max = Some(max);
        self
    }

    /// The [`RequestConfig`] given to requests created through
    /// [`crate::aio::Connection::request`].
    pub fn set_request_defaults(mut self, defaults: RequestConfig) -> Self {
        self.request_defaults = defaults;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConnectionConfig::new("localhost:6379");
        assert_eq!(config.addr(), "localhost:6379");
        assert!(config.hello_on_connect);
        assert_eq!(config.health_check_interval, Duration::from_secs(2));
        assert!(config.read_buffer_max.is_none());
        assert!(config.username.is_none());
    }
}
