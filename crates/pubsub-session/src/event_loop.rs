//! The session's event loop.
//!
//! One task owns the registry, the poll engine, the reconnect controller and
//! the pending requests. Handles reach it through [`Command`]s; network work
//! runs in child tasks whose [`Completion`]s come back here. Every user
//! callback runs on this task.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::crypto::{PayloadCipher, decode_payload};
use crate::dispatch::{Dispatcher, RequestId, RequestOutcome};
use crate::poll::{InFlight, PollEngine, PollId, PollPlan};
use crate::reconnect::ReconnectController;
use crate::registry::{Binding, ChannelRegistry};
use crate::transport::{PollBatch, Transport};
use crate::types::{
    Error, HistoryCallback, Listener, Message, PublishCallback, TimeCallback, TimingConfig,
};

pub(crate) enum Command {
    Subscribe {
        channel: String,
        listener: Listener,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        message: Result<Value, Error>,
        callback: PublishCallback,
    },
    History {
        channel: String,
        limit: u32,
        callback: HistoryCallback,
    },
    Time {
        callback: TimeCallback,
    },
}

pub(crate) enum Completion {
    Poll {
        id: PollId,
        result: Result<PollBatch, Error>,
    },
    Request {
        id: RequestId,
        outcome: RequestOutcome,
    },
}

pub(crate) struct EventLoop {
    registry: ChannelRegistry,
    engine: PollEngine,
    reconnect: ReconnectController,
    dispatcher: Dispatcher,
    tasks: JoinSet<Completion>,
    transport: Arc<dyn Transport>,
    cipher: Option<Arc<PayloadCipher>>,
    commands: mpsc::UnboundedReceiver<Command>,
    stop: CancellationToken,
    _finished: DropGuard,
}

impl EventLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        cipher: Option<Arc<PayloadCipher>>,
        timing: &TimingConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        stop: CancellationToken,
        finished: CancellationToken,
    ) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            engine: PollEngine::new(),
            reconnect: ReconnectController::new(timing),
            dispatcher: Dispatcher::new(Arc::clone(&transport), cipher.clone()),
            tasks: JoinSet::new(),
            transport,
            cipher,
            commands,
            stop,
            _finished: finished.drop_guard(),
        }
    }

    pub async fn run(mut self) {
        tracing::debug!("Session event loop started");
        loop {
            if !self.halted() {
                self.reconcile();
            }
            let retry_at = self.engine.retry_at();

            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    tracing::info!("Stop requested");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("All session handles dropped");
                        break;
                    }
                },

                Some(joined) = self.tasks.join_next_with_id() => self.handle_joined(joined),

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    tracing::debug!("Retry timer fired");
                    self.engine.retry_due();
                }
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let dropped = self.dispatcher.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarding pending requests");
        }
        self.engine.suspend();
        self.tasks.shutdown().await;
        tracing::info!("Session stopped");
    }

    fn halted(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Bring the poll engine in line with the current channel set.
    fn reconcile(&mut self) {
        let version = self.registry.version();
        match self.engine.plan(version, !self.registry.is_empty()) {
            PollPlan::Hold => {}
            PollPlan::Issue => self.issue_poll(version),
            PollPlan::Supersede => {
                tracing::debug!(channels = self.registry.len(), "Channel set changed; reissuing poll");
                self.issue_poll(version);
            }
            PollPlan::Suspend => {
                tracing::info!("No channels subscribed; polling suspended");
                self.engine.suspend();
            }
        }
    }

    fn issue_poll(&mut self, version: u64) {
        let channels = self.registry.names();
        self.reconnect.on_attempt();
        let transport = Arc::clone(&self.transport);
        let tasks = &mut self.tasks;
        let id = self.engine.issue(channels, version, |id, request| {
            tasks.spawn(async move {
                let result = transport.subscribe(request).await;
                Completion::Poll { id, result }
            })
        });
        tracing::trace!(?id, cursor = %self.engine.cursor(), "Poll issued");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { channel, listener } => {
                match self.registry.subscribe(channel.clone(), listener) {
                    Binding::Added => tracing::debug!(%channel, "Subscribed"),
                    Binding::Replaced => tracing::debug!(%channel, "Replaced channel listener"),
                }
            }
            Command::Unsubscribe { channel } => {
                if self.registry.unsubscribe(&channel) {
                    tracing::debug!(%channel, "Unsubscribed");
                } else {
                    tracing::debug!(%channel, "Unsubscribe for unknown channel ignored");
                }
            }
            Command::Publish {
                channel,
                message,
                callback,
            } => {
                self.dispatcher
                    .publish(&mut self.tasks, channel, message, callback);
            }
            Command::History {
                channel,
                limit,
                callback,
            } => {
                self.dispatcher
                    .history(&mut self.tasks, channel, limit, callback);
            }
            Command::Time { callback } => {
                self.dispatcher.time(&mut self.tasks, callback);
            }
        }
    }

    /// Apply commands queued by the callback that just returned.
    fn drain_commands(&mut self) {
        while !self.halted() {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(_) => break,
            }
        }
    }

    fn handle_joined(&mut self, joined: Result<(TaskId, Completion), JoinError>) {
        match joined {
            Ok((_, Completion::Poll { id, result })) => self.on_poll(id, result),
            Ok((_, Completion::Request { id, outcome })) => {
                if !self.halted() && self.dispatcher.resolve(id, outcome) {
                    self.drain_commands();
                }
            }
            Err(e) if e.is_cancelled() => {
                tracing::trace!("Cancelled task reaped");
            }
            Err(e) => {
                tracing::warn!("Session task failed: {e}");
                let error = Error::Transport(format!("task failed: {e}").into());
                if let Some(id) = self.engine.owner_of(e.id()) {
                    self.on_poll(id, Err(error));
                } else if !self.halted() && self.dispatcher.fail_task(e.id(), error) {
                    self.drain_commands();
                }
            }
        }
    }

    fn on_poll(&mut self, id: PollId, result: Result<PollBatch, Error>) {
        let Some(flight) = self.engine.accept(id) else {
            tracing::debug!(?id, "Discarding stale poll completion");
            return;
        };
        match result {
            Ok(batch) => self.deliver(flight, batch),
            Err(e) => self.on_poll_failure(e),
        }
    }

    fn deliver(&mut self, flight: InFlight, batch: PollBatch) {
        if self.reconnect.on_success() {
            tracing::info!(channels = flight.channels.len(), "Connected");
        }
        tracing::trace!(messages = batch.messages.len(), cursor = %batch.cursor, "Poll batch received");

        for channel in &flight.channels {
            if self.halted() {
                return;
            }
            if self.registry.connect(channel) {
                self.drain_commands();
            }
        }

        for envelope in batch.messages {
            if self.halted() {
                return;
            }
            if !flight.channels.contains(&envelope.channel) {
                tracing::debug!(channel = %envelope.channel, "Dropping message for channel outside poll");
                continue;
            }
            if !self.registry.contains(&envelope.channel) {
                tracing::debug!(channel = %envelope.channel, "Dropping message for unsubscribed channel");
                continue;
            }
            // A binding replaced mid-batch has not seen its connect yet.
            if self.registry.connect(&envelope.channel) {
                self.drain_commands();
                if self.halted() || !self.registry.contains(&envelope.channel) {
                    continue;
                }
            }
            let data = decode_payload(self.cipher.as_deref(), envelope.payload);
            self.registry.deliver(Message {
                channel: envelope.channel,
                data,
            });
            self.drain_commands();
        }

        self.engine.finish(batch.cursor);
    }

    fn on_poll_failure(&mut self, error: Error) {
        let (delay, was_connected) = self.reconnect.on_failure();
        tracing::warn!(
            attempt = self.reconnect.failures(),
            delay_ms = delay.as_millis() as u64,
            "Poll failed: {error}"
        );
        self.engine.fail(Instant::now() + delay);
        if was_connected {
            tracing::info!("Disconnected");
        }
        for channel in self.registry.drop_connections() {
            if self.halted() {
                return;
            }
            self.registry.notify_disconnect(&channel, &error);
            self.drain_commands();
        }
    }
}
