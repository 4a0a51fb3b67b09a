//! Public types for the pubsub-client crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with the decoded tokens of every inbound message.
///
/// Runs on the subscriber task; the next receive does not start until it
/// returns, so it must not block for long. Invalid UTF-8 in a payload is
/// replaced with U+FFFD before decoding.
pub type MessageHandler = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Callback invoked once when the subscriber loop stops on a fatal error.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which of the two backend connections an operation or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound commands: publish, get, set.
    Publish,
    /// Subscription delivery.
    Receive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("publish-path"),
            Self::Receive => f.write_str("receive-path"),
        }
    }
}

/// Subscriber loop state.
///
/// `Idle → Subscribing → Listening → Stopped`; a new `start()` re-enters
/// `Subscribing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    Idle = 0,
    Subscribing = 1,
    Listening = 2,
    Stopped = 3,
}

impl SubscriberState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Subscribing,
            2 => Self::Listening,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Timeouts applied to backend I/O.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// TCP connect plus `PING` handshake, per connection.
    pub connect_timeout: Duration,
    /// Reply to a single command (including each subscribe acknowledgement).
    pub command_timeout: Duration,
    /// Receive-path silence after which the loop probes the connection with
    /// `PING`. `None` disables the probe.
    pub idle_timeout: Option<Duration>,
    /// Time allowed for the `UNSUBSCRIBE` sent when the loop is stopped.
    pub shutdown_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Configuration for [`Client::connect`](crate::Client::connect).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timing: TimingConfig::default(),
        }
    }

    /// `host:port` as passed to the TCP connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Errors returned by this crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{role} connection to {addr} failed: {reason}")]
    Connection {
        role: Role,
        addr: String,
        reason: String,
    },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe to {channel:?} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("{command} rejected by server: {message}")]
    Command { command: String, message: String },

    #[error("{0} connection is not established")]
    Disconnected(Role),

    #[error("subscriber is running")]
    SubscriberRunning,

    #[error("subscriber not configured: {0}")]
    NotConfigured(&'static str),
}
