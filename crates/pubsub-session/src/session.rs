//! Public entry point: [`Session`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::PayloadCipher;
use crate::event_loop::{Command, EventLoop};
use crate::transport::{HttpTransport, Transport};
use crate::types::{
    Error, Listener, PublishAck, SessionConfig, Timetoken, validate_channel,
};

/// Handle to a running publish/subscribe session.
///
/// The session's state lives on an event-loop task spawned on the current
/// tokio runtime. Handles are cheap to clone and every method returns
/// immediately; results arrive through callbacks that run on the event-loop
/// task. Methods may be called from inside those callbacks.
///
/// Call [`stop`](Session::stop) to end the session. The loop also ends once
/// every handle is dropped, but a handle captured by a channel's own callback
/// keeps it alive.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
    finished: CancellationToken,
    can_publish: bool,
}

impl Session {
    /// Start a session over the bundled HTTP transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SessionConfig) -> Result<Self, Error> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, transport)
    }

    /// Start a session over a caller-supplied transport.
    pub fn with_transport(config: SessionConfig, transport: impl Transport) -> Result<Self, Error> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Configuration(format!("no tokio runtime: {e}")))?;
        let cipher = config
            .cipher_key()
            .map(PayloadCipher::new)
            .transpose()?
            .map(Arc::new);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let finished = CancellationToken::new();
        let event_loop = EventLoop::new(
            Arc::new(transport),
            cipher,
            &config.timing(),
            command_rx,
            stop.clone(),
            finished.clone(),
        );
        runtime.spawn(event_loop.run());

        Ok(Self {
            commands: command_tx,
            stop,
            finished,
            can_publish: !config.publish_key.is_empty(),
        })
    }

    /// Subscribe to `channel`, replacing any listener already bound to it.
    pub fn subscribe(&self, channel: impl Into<String>, listener: Listener) -> Result<(), Error> {
        let channel = channel.into();
        validate_channel(&channel)?;
        self.send(Command::Subscribe { channel, listener })
    }

    /// Remove the binding for `channel`. Unknown channels are ignored.
    pub fn unsubscribe(&self, channel: impl Into<String>) -> Result<(), Error> {
        let channel = channel.into();
        validate_channel(&channel)?;
        self.send(Command::Unsubscribe { channel })
    }

    /// Publish `message` to `channel`.
    ///
    /// `callback` runs exactly once with the server acknowledgement or the
    /// error, unless this returns `Err` or the session is stopped first.
    pub fn publish<T>(
        &self,
        channel: impl Into<String>,
        message: &T,
        callback: impl FnOnce(Result<PublishAck, Error>) + Send + 'static,
    ) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        if !self.can_publish {
            return Err(Error::Configuration("publish key is required".into()));
        }
        let channel = channel.into();
        validate_channel(&channel)?;
        let message = serde_json::to_value(message).map_err(Error::from);
        self.send(Command::Publish {
            channel,
            message,
            callback: Box::new(callback),
        })
    }

    /// Fetch up to `limit` of the most recent messages on `channel`.
    pub fn history(
        &self,
        channel: impl Into<String>,
        limit: u32,
        callback: impl FnOnce(Result<Vec<serde_json::Value>, Error>) + Send + 'static,
    ) -> Result<(), Error> {
        let channel = channel.into();
        validate_channel(&channel)?;
        self.send(Command::History {
            channel,
            limit,
            callback: Box::new(callback),
        })
    }

    /// Fetch the server's current timetoken.
    pub fn time(
        &self,
        callback: impl FnOnce(Result<Timetoken, Error>) + Send + 'static,
    ) -> Result<(), Error> {
        self.send(Command::Time {
            callback: Box::new(callback),
        })
    }

    /// Stop the session.
    ///
    /// No callback starts after this returns; a callback already running on
    /// another thread finishes normally. The in-flight poll and pending
    /// requests are cancelled, and their callbacks are never invoked.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.finished.is_cancelled()
    }

    /// Wait until the event loop has exited and released its tasks.
    pub async fn stopped(&self) {
        self.finished.cancelled().await;
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        self.commands.send(command).map_err(|_| Error::Stopped)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("stopped", &self.is_stopped())
            .field("can_publish", &self.can_publish)
            .finish_non_exhaustive()
    }
}
