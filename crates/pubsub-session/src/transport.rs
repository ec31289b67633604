//! Transport abstraction used by the session engine.
//!
//! The engine only needs four round-trips: a long-poll fetch for a set of
//! channels, and three one-shot requests. [`HttpTransport`] implements them
//! over HTTP; tests and embedders can supply their own.

use async_trait::async_trait;

use crate::types::{Error, PublishAck, Timetoken};

mod http;

pub use http::HttpTransport;

/// One long-poll fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    /// Channels to fetch, in a stable order.
    pub channels: Vec<String>,
    /// Cursor to fetch from.
    pub cursor: Timetoken,
}

/// A message addressed to one channel within a poll batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub payload: serde_json::Value,
}

/// Result of a long-poll fetch: messages in server order and the cursor to
/// poll from next.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PollBatch {
    pub messages: Vec<Envelope>,
    pub cursor: Timetoken,
}

/// An encoded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub channel: String,
    /// Payload as JSON text (already encrypted when a cipher key is set).
    pub payload: String,
}

/// Network collaborator for a [`Session`](crate::Session).
///
/// Implementations should map timeouts to [`Error::TransportTimeout`],
/// connection failures to [`Error::Transport`], and bad or refused responses
/// to [`Error::Server`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Long-poll for messages on `request.channels` after `request.cursor`.
    async fn subscribe(&self, request: PollRequest) -> Result<PollBatch, Error>;

    async fn publish(&self, request: PublishRequest) -> Result<PublishAck, Error>;

    /// Up to `limit` most recent payloads on `channel`, oldest first.
    async fn history(&self, channel: &str, limit: u32) -> Result<Vec<serde_json::Value>, Error>;

    async fn time(&self) -> Result<Timetoken, Error>;
}
