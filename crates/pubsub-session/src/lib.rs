//! Long-poll publish/subscribe client session.
//!
//! A [`Session`] keeps one long-poll open over every subscribed channel,
//! delivers each batch to per-channel callbacks, and reissues the poll as soon
//! as a batch is handled. Publish, history and time are one-shot requests that
//! complete through a callback.
//!
//! # Features
//! - One multiplexed long-poll for any number of channels
//! - Automatic reconnect with capped exponential backoff
//! - Optional AES-256 payload encryption and HMAC-signed publishes
//! - Pluggable [`Transport`]; [`HttpTransport`] is the default
//!
//! All callbacks run on the session's event-loop task, so they never run
//! concurrently with each other.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubsub_session::Error> {
//! use pubsub_session::{Listener, Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig::new("demo", "demo"))?;
//!
//! let publisher = session.clone();
//! session.subscribe(
//!     "hello_world",
//!     Listener::new(|msg| println!("got: {}", msg.data)).on_connect(move || {
//!         let _ = publisher.publish("hello_world", "hi", |ack| println!("publish: {ack:?}"));
//!     }),
//! )?;
//!
//! session.time(|tt| println!("server time: {tt:?}"))?;
//! session.stopped().await;
//! # Ok(())
//! # }
//! ```

mod crypto;
mod dispatch;
mod event_loop;
mod poll;
mod reconnect;
mod registry;
mod session;
mod transport;
mod types;

pub use crypto::PayloadCipher;
pub use session::Session;
pub use transport::{
    Envelope, HttpTransport, PollBatch, PollRequest, PublishRequest, Transport,
};
pub use types::{
    BoxError, Error, HistoryCallback, Listener, Message, PublishAck,
    PublishCallback, SessionConfig, TimeCallback, Timetoken, TimingConfig,
};
