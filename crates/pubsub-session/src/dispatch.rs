//! One-shot requests: publish, history and time.
//!
//! Each request runs as its own task in the event loop's `JoinSet`. The
//! completion callback stays here, keyed by [`RequestId`], until the task's
//! result comes back to the loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::{Id as TaskId, JoinSet};

use crate::crypto::{PayloadCipher, decode_payload};
use crate::event_loop::Completion;
use crate::transport::{PublishRequest, Transport};
use crate::types::{
    Error, HistoryCallback, PublishAck, PublishCallback, TimeCallback, Timetoken,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestId(u64);

pub(crate) enum PendingCallback {
    Publish(PublishCallback),
    History(HistoryCallback),
    Time(TimeCallback),
}

impl PendingCallback {
    fn resolve(self, outcome: RequestOutcome) {
        match (self, outcome) {
            (Self::Publish(cb), RequestOutcome::Publish(result)) => cb(result),
            (Self::History(cb), RequestOutcome::History(result)) => cb(result),
            (Self::Time(cb), RequestOutcome::Time(result)) => cb(result),
            (cb, _) => cb.fail(Error::Transport("mismatched request outcome".into())),
        }
    }

    fn fail(self, error: Error) {
        match self {
            Self::Publish(cb) => cb(Err(error)),
            Self::History(cb) => cb(Err(error)),
            Self::Time(cb) => cb(Err(error)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum RequestOutcome {
    Publish(Result<PublishAck, Error>),
    History(Result<Vec<Value>, Error>),
    Time(Result<Timetoken, Error>),
}

struct PendingRequest {
    callback: PendingCallback,
    task: TaskId,
}

pub(crate) struct Dispatcher {
    transport: Arc<dyn Transport>,
    cipher: Option<Arc<PayloadCipher>>,
    pending: HashMap<RequestId, PendingRequest>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, cipher: Option<Arc<PayloadCipher>>) -> Self {
        Self {
            transport,
            cipher,
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// `message` carries the caller-side serialization result so that an
    /// encoding failure reaches `callback` the same way a network failure does.
    pub fn publish(
        &mut self,
        tasks: &mut JoinSet<Completion>,
        channel: String,
        message: Result<Value, Error>,
        callback: PublishCallback,
    ) -> RequestId {
        let transport = Arc::clone(&self.transport);
        let cipher = self.cipher.clone();
        self.spawn(tasks, PendingCallback::Publish(callback), async move {
            let result = async {
                let value = message?;
                let value = match cipher.as_deref() {
                    Some(cipher) => cipher.seal(&value)?,
                    None => value,
                };
                let payload = serde_json::to_string(&value)?;
                transport.publish(PublishRequest { channel, payload }).await
            }
            .await;
            RequestOutcome::Publish(result)
        })
    }

    pub fn history(
        &mut self,
        tasks: &mut JoinSet<Completion>,
        channel: String,
        limit: u32,
        callback: HistoryCallback,
    ) -> RequestId {
        let transport = Arc::clone(&self.transport);
        let cipher = self.cipher.clone();
        self.spawn(tasks, PendingCallback::History(callback), async move {
            let result = transport.history(&channel, limit).await.map(|items| {
                items
                    .into_iter()
                    .map(|item| decode_payload(cipher.as_deref(), item))
                    .collect()
            });
            RequestOutcome::History(result)
        })
    }

    pub fn time(&mut self, tasks: &mut JoinSet<Completion>, callback: TimeCallback) -> RequestId {
        let transport = Arc::clone(&self.transport);
        self.spawn(tasks, PendingCallback::Time(callback), async move {
            RequestOutcome::Time(transport.time().await)
        })
    }

    fn spawn<F>(
        &mut self,
        tasks: &mut JoinSet<Completion>,
        callback: PendingCallback,
        work: F,
    ) -> RequestId
    where
        F: Future<Output = RequestOutcome> + Send + 'static,
    {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        let handle = tasks.spawn(async move {
            Completion::Request {
                id,
                outcome: work.await,
            }
        });
        self.pending.insert(
            id,
            PendingRequest {
                callback,
                task: handle.id(),
            },
        );
        id
    }

    /// Invoke the callback for `id`. Returns `false` if nothing was pending.
    pub fn resolve(&mut self, id: RequestId, outcome: RequestOutcome) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                request.callback.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail the request whose task ended without producing an outcome.
    pub fn fail_task(&mut self, task: TaskId, error: Error) -> bool {
        let Some(id) = self
            .pending
            .iter()
            .find_map(|(id, request)| (request.task == task).then_some(*id))
        else {
            return false;
        };
        match self.pending.remove(&id) {
            Some(request) => {
                request.callback.fail(error);
                true
            }
            None => false,
        }
    }

    /// Forget every pending request without invoking its callback.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
