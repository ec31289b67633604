//! Shared helpers for the session integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pubsub_session::{
    Envelope, Error, Listener, PollBatch, PollRequest, PublishAck, PublishRequest, Session,
    SessionConfig, Timetoken, Transport,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub const SERVER_TIME: Timetoken = Timetoken(13_410_000_000_000_000);

/// Generous bound so paused-clock tests can sit through the longest backoff.
const WAIT: Duration = Duration::from_secs(60);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A long-poll the session issued and is waiting on.
pub struct PollCall {
    pub request: PollRequest,
    respond: oneshot::Sender<Result<PollBatch, Error>>,
}

impl PollCall {
    /// Returns `false` if the session already abandoned this poll.
    pub fn respond(self, result: Result<PollBatch, Error>) -> bool {
        self.respond.send(result).is_ok()
    }

    pub fn ok(self, cursor: u64, messages: &[(&str, Value)]) -> bool {
        self.respond(Ok(batch(cursor, messages)))
    }

    pub fn fail(self) -> bool {
        self.respond(Err(Error::Transport("connection reset".into())))
    }

    pub fn is_abandoned(&self) -> bool {
        self.respond.is_closed()
    }
}

pub fn batch(cursor: u64, messages: &[(&str, Value)]) -> PollBatch {
    PollBatch {
        messages: messages
            .iter()
            .map(|(channel, payload)| Envelope {
                channel: channel.to_string(),
                payload: payload.clone(),
            })
            .collect(),
        cursor: Timetoken(cursor),
    }
}

/// In-memory transport: polls are handed to the test to answer, publishes
/// are stored and served back by history.
#[derive(Clone)]
pub struct ScriptedTransport {
    polls: mpsc::UnboundedSender<PollCall>,
    store: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    next_timetoken: Arc<Mutex<u64>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn subscribe(&self, request: PollRequest) -> Result<PollBatch, Error> {
        let (respond, response) = oneshot::channel();
        self.polls
            .send(PollCall { request, respond })
            .map_err(|_| Error::Transport("script finished".into()))?;
        response
            .await
            .map_err(|_| Error::Transport("poll dropped by test".into()))?
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishAck, Error> {
        let payload: Value = serde_json::from_str(&request.payload)?;
        self.store
            .lock()
            .unwrap()
            .entry(request.channel)
            .or_default()
            .push(payload);
        let mut next = self.next_timetoken.lock().unwrap();
        *next += 1;
        Ok(PublishAck {
            timetoken: Timetoken(*next),
            info: "Sent".into(),
        })
    }

    async fn history(&self, channel: &str, limit: u32) -> Result<Vec<Value>, Error> {
        let store = self.store.lock().unwrap();
        let items = store.get(channel).cloned().unwrap_or_default();
        let skip = items.len().saturating_sub(limit as usize);
        Ok(items.into_iter().skip(skip).collect())
    }

    async fn time(&self) -> Result<Timetoken, Error> {
        Ok(SERVER_TIME)
    }
}

impl ScriptedTransport {
    pub fn stored(&self, channel: &str) -> Vec<Value> {
        self.store
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

/// Something a channel callback observed, tagged with the listener's label.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Connect(String),
    Message(String, Value),
    Disconnect(String),
}

pub struct Harness {
    pub session: Session,
    pub transport: ScriptedTransport,
    polls: mpsc::UnboundedReceiver<PollCall>,
    seen_tx: mpsc::UnboundedSender<Seen>,
    seen_rx: mpsc::UnboundedReceiver<Seen>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        init_tracing();
        let (polls_tx, polls) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            polls: polls_tx,
            store: Arc::default(),
            next_timetoken: Arc::new(Mutex::new(SERVER_TIME.0)),
        };
        let session = Session::with_transport(config, transport.clone()).unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        Self {
            session,
            transport,
            polls,
            seen_tx,
            seen_rx,
        }
    }

    /// A listener that reports everything it sees under `label`.
    pub fn listener(&self, label: &str) -> Listener {
        let (on_message, on_connect, on_disconnect) = (
            self.seen_tx.clone(),
            self.seen_tx.clone(),
            self.seen_tx.clone(),
        );
        let (l1, l2, l3) = (label.to_string(), label.to_string(), label.to_string());
        Listener::new(move |msg| {
            let _ = on_message.send(Seen::Message(l1.clone(), msg.data));
        })
        .on_connect(move || {
            let _ = on_connect.send(Seen::Connect(l2.clone()));
        })
        .on_disconnect(move |_| {
            let _ = on_disconnect.send(Seen::Disconnect(l3.clone()));
        })
    }

    pub fn seen_sender(&self) -> mpsc::UnboundedSender<Seen> {
        self.seen_tx.clone()
    }

    pub async fn next_poll(&mut self) -> PollCall {
        tokio::time::timeout(WAIT, self.polls.recv())
            .await
            .expect("session did not poll")
            .expect("transport dropped")
    }

    /// Assert that no poll is issued within `window`.
    pub async fn no_poll_within(&mut self, window: Duration) {
        if let Ok(Some(call)) = tokio::time::timeout(window, self.polls.recv()).await {
            panic!("unexpected poll for {:?}", call.request.channels);
        }
    }

    pub async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(WAIT, self.seen_rx.recv())
            .await
            .expect("no callback fired")
            .expect("listener channel closed")
    }

    /// Assert that no channel callback fires within `window`.
    pub async fn quiet_for(&mut self, window: Duration) {
        if let Ok(Some(seen)) = tokio::time::timeout(window, self.seen_rx.recv()).await {
            panic!("unexpected callback: {seen:?}");
        }
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig::new("pub-key", "sub-key")
}

pub fn connect(label: &str) -> Seen {
    Seen::Connect(label.to_string())
}

pub fn message(label: &str, data: Value) -> Seen {
    Seen::Message(label.to_string(), data)
}

pub fn disconnect(label: &str) -> Seen {
    Seen::Disconnect(label.to_string())
}

/// Wait for a one-shot request's callback.
pub async fn reply<T>(rx: oneshot::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx)
        .await
        .expect("callback did not fire")
        .expect("callback dropped without firing")
}
