//! Public types for the pubsub-session crate.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A boxed error type for transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) const DEFAULT_ORIGIN: &str = "pubsub.pubnub.com";
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(310);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Server-assigned cursor into a channel's message stream.
///
/// A long-poll starts at `Timetoken::ZERO`; every successful poll returns the
/// timetoken to poll from next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timetoken(pub u64);

impl Timetoken {
    pub const ZERO: Timetoken = Timetoken(0);
}

impl fmt::Display for Timetoken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Channel the message was published to.
    pub channel: String,
    /// Decoded (and, with a cipher key, decrypted) payload.
    pub data: serde_json::Value,
}

/// Server acknowledgement of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Timetoken the message was stored under.
    pub timetoken: Timetoken,
    /// Server status text (e.g. `"Sent"`).
    pub info: String,
}

/// Subscription state of a channel, as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Connecting,
    Connected,
}

pub(crate) type MessageCallback = Box<dyn FnMut(Message) + Send>;
pub(crate) type ConnectCallback = Box<dyn FnMut() + Send>;
pub(crate) type DisconnectCallback = Box<dyn FnMut(&Error) + Send>;

/// Completion callback for [`Session::publish`](crate::Session::publish).
pub type PublishCallback = Box<dyn FnOnce(Result<PublishAck, Error>) + Send>;
/// Completion callback for [`Session::history`](crate::Session::history).
pub type HistoryCallback = Box<dyn FnOnce(Result<Vec<serde_json::Value>, Error>) + Send>;
/// Completion callback for [`Session::time`](crate::Session::time).
pub type TimeCallback = Box<dyn FnOnce(Result<Timetoken, Error>) + Send>;

/// Callbacks bound to a subscribed channel.
///
/// Every callback runs on the session's event-loop task. Callbacks may call
/// back into the [`Session`](crate::Session); such calls are queued and take
/// effect before the next callback is dispatched.
pub struct Listener {
    pub(crate) on_message: MessageCallback,
    pub(crate) on_connect: Option<ConnectCallback>,
    pub(crate) on_disconnect: Option<DisconnectCallback>,
}

impl Listener {
    /// Create a listener that receives each message published to the channel.
    pub fn new(on_message: impl FnMut(Message) + Send + 'static) -> Self {
        Self {
            on_message: Box::new(on_message),
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Called once per successful (re)connection, before any message is delivered.
    pub fn on_connect(mut self, on_connect: impl FnMut() + Send + 'static) -> Self {
        self.on_connect = Some(Box::new(on_connect));
        self
    }

    /// Called once when a connected channel loses its long-poll.
    pub fn on_disconnect(mut self, on_disconnect: impl FnMut(&Error) + Send + 'static) -> Self {
        self.on_disconnect = Some(Box::new(on_disconnect));
        self
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish_non_exhaustive()
    }
}

/// Timeouts and retry intervals.
///
/// Durations are read as milliseconds when deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Upper bound on one long-poll request.
    #[serde(with = "millis", rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    /// Upper bound on publish, history and time requests.
    #[serde(with = "millis", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Delay before the first retry after a poll failure.
    #[serde(with = "millis", rename = "min_retry_interval_ms")]
    pub min_retry_interval: Duration,
    /// Cap on the retry delay.
    #[serde(with = "millis", rename = "max_retry_interval_ms")]
    pub max_retry_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            min_retry_interval: DEFAULT_MIN_RETRY_INTERVAL,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Configuration for [`Session::new`](crate::Session::new).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Key used to publish. May be empty for subscribe-only sessions.
    #[serde(default)]
    pub publish_key: String,
    /// Key used to subscribe and read history. Required.
    pub subscribe_key: String,
    /// Key used to sign publishes. Empty disables signing.
    #[serde(default)]
    pub secret_key: String,
    /// Enables payload encryption when set to a non-empty key.
    #[serde(default)]
    pub cipher_key: Option<String>,
    /// Use TLS for the transport.
    #[serde(default)]
    pub ssl: bool,
    /// Service host (and optional port). Defaults to `"pubsub.pubnub.com"`.
    #[serde(default)]
    pub origin: Option<String>,
    /// Timeouts and retry intervals; defaults apply when `None`.
    #[serde(default)]
    pub timing: Option<TimingConfig>,
}

impl SessionConfig {
    pub fn new(publish_key: impl Into<String>, subscribe_key: impl Into<String>) -> Self {
        Self {
            publish_key: publish_key.into(),
            subscribe_key: subscribe_key.into(),
            secret_key: String::new(),
            cipher_key: None,
            ssl: false,
            origin: None,
            timing: None,
        }
    }

    /// Check the credentials and timing values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.subscribe_key.trim().is_empty() {
            return Err(Error::Configuration("subscribe key is required".into()));
        }
        let timing = self.timing();
        if timing.min_retry_interval.is_zero() {
            return Err(Error::Configuration(
                "min_retry_interval must be greater than zero".into(),
            ));
        }
        if timing.max_retry_interval < timing.min_retry_interval {
            return Err(Error::Configuration(
                "max_retry_interval must not be less than min_retry_interval".into(),
            ));
        }
        if self.origin.as_deref().is_some_and(|o| o.trim().is_empty()) {
            return Err(Error::Configuration("origin must not be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn timing(&self) -> TimingConfig {
        self.timing.unwrap_or_default()
    }

    /// The cipher key, if payload encryption is enabled.
    pub(crate) fn cipher_key(&self) -> Option<&str> {
        self.cipher_key.as_deref().filter(|k| !k.is_empty())
    }

    pub(crate) fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(DEFAULT_ORIGIN)
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport timed out")]
    TransportTimeout,

    #[error("transport error: {0}")]
    Transport(BoxError),

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("session stopped")]
    Stopped,
}

impl Error {
    /// Whether the error comes from the network or the remote service rather
    /// than from the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout | Error::Transport(_) | Error::Server { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::TransportTimeout
        } else if let Some(status) = e.status() {
            Error::Server {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Error::Transport(Box::new(e))
        }
    }
}

/// Reject names that cannot stand as a URL path segment.
pub(crate) fn validate_channel(channel: &str) -> Result<(), Error> {
    if matches!(channel, "" | "." | "..") {
        return Err(Error::InvalidChannel(channel.to_string()));
    }
    Ok(())
}
