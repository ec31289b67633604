//! Long-poll state machine.
//!
//! ```text
//! Idle ──issue──► Polling ──accept──► Delivering ──finish──► Idle
//!   ▲                │                    │
//!   │                └──────fail──────────┴──► Failed ──retry_due──► Idle
//!   └───────────────────────suspend──────────────┘
//! ```
//!
//! The engine owns the cursor and the single in-flight fetch. It does not
//! spawn anything itself; the event loop passes a spawner to [`PollEngine::issue`].

use tokio::task::{AbortHandle, Id as TaskId};
use tokio::time::Instant;

use crate::transport::PollRequest;
use crate::types::Timetoken;

/// Identifies one issued fetch. Completions carrying an older id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollId(u64);

#[derive(Debug)]
pub(crate) struct InFlight {
    pub id: PollId,
    /// Registry version the fetch was issued for.
    pub version: u64,
    /// Channel set snapshot the fetch covers.
    pub channels: Vec<String>,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
pub(crate) enum PollState {
    #[default]
    Idle,
    Polling(InFlight),
    Delivering,
    Failed { retry_at: Instant },
}

/// What the event loop should do to bring the engine in line with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollPlan {
    Hold,
    Issue,
    /// The channel set changed under the in-flight fetch.
    Supersede,
    /// Nothing is subscribed; drop the pending retry.
    Suspend,
}

#[derive(Debug, Default)]
pub(crate) struct PollEngine {
    state: PollState,
    cursor: Timetoken,
    next_id: u64,
}

impl PollEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn cursor(&self) -> Timetoken {
        self.cursor
    }

    pub fn plan(&self, version: u64, has_channels: bool) -> PollPlan {
        match (&self.state, has_channels) {
            (PollState::Idle, true) => PollPlan::Issue,
            (PollState::Polling(flight), true) if flight.version != version => PollPlan::Supersede,
            // An emptied set keeps its in-flight fetch; the response is accepted
            // and the engine then idles.
            (PollState::Polling(_), _) => PollPlan::Hold,
            (PollState::Failed { .. }, false) => PollPlan::Suspend,
            _ => PollPlan::Hold,
        }
    }

    /// Start a fetch for `channels` from the current cursor. `spawn` runs the
    /// fetch and returns a handle used to cancel it.
    pub fn issue<F>(&mut self, channels: Vec<String>, version: u64, spawn: F) -> PollId
    where
        F: FnOnce(PollId, PollRequest) -> AbortHandle,
    {
        self.abort_in_flight();
        self.next_id += 1;
        let id = PollId(self.next_id);
        let request = PollRequest {
            channels: channels.clone(),
            cursor: self.cursor,
        };
        let abort = spawn(id, request);
        self.state = PollState::Polling(InFlight {
            id,
            version,
            channels,
            abort,
        });
        id
    }

    /// Take the in-flight fetch if `id` is current and enter `Delivering`.
    /// Returns `None` for a stale completion.
    pub fn accept(&mut self, id: PollId) -> Option<InFlight> {
        match &self.state {
            PollState::Polling(flight) if flight.id == id => {}
            _ => return None,
        }
        match std::mem::replace(&mut self.state, PollState::Delivering) {
            PollState::Polling(flight) => Some(flight),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// The current fetch's id, if `task` is the task running it.
    pub fn owner_of(&self, task: TaskId) -> Option<PollId> {
        match &self.state {
            PollState::Polling(flight) if flight.abort.id() == task => Some(flight.id),
            _ => None,
        }
    }

    /// Batch delivered; the next fetch starts from `cursor`.
    pub fn finish(&mut self, cursor: Timetoken) {
        self.cursor = cursor;
        self.state = PollState::Idle;
    }

    pub fn fail(&mut self, retry_at: Instant) {
        self.abort_in_flight();
        self.state = PollState::Failed { retry_at };
    }

    pub fn retry_at(&self) -> Option<Instant> {
        match self.state {
            PollState::Failed { retry_at } => Some(retry_at),
            _ => None,
        }
    }

    /// The backoff timer fired.
    pub fn retry_due(&mut self) {
        if matches!(self.state, PollState::Failed { .. }) {
            self.state = PollState::Idle;
        }
    }

    /// Cancel whatever is pending and go idle. The cursor is kept.
    pub fn suspend(&mut self) {
        self.abort_in_flight();
        self.state = PollState::Idle;
    }

    fn abort_in_flight(&mut self) {
        if let PollState::Polling(flight) = &self.state {
            flight.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinSet;

    use super::*;

    fn pending(tasks: &mut JoinSet<()>) -> impl FnOnce(PollId, PollRequest) -> AbortHandle + '_ {
        move |_, _| tasks.spawn(std::future::pending())
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn plan_follows_registry() {
        let mut tasks = JoinSet::new();
        let mut engine = PollEngine::new();
        assert_eq!(engine.plan(0, false), PollPlan::Hold);
        assert_eq!(engine.plan(1, true), PollPlan::Issue);

        engine.issue(names(&["a"]), 1, pending(&mut tasks));
        assert_eq!(engine.plan(1, true), PollPlan::Hold);
        assert_eq!(engine.plan(2, true), PollPlan::Supersede);
        assert_eq!(engine.plan(2, false), PollPlan::Hold);

        engine.fail(Instant::now() + Duration::from_secs(1));
        assert_eq!(engine.plan(2, true), PollPlan::Hold);
        assert_eq!(engine.plan(3, false), PollPlan::Suspend);
    }

    #[tokio::test]
    async fn stale_completion_is_rejected() {
        let mut tasks = JoinSet::new();
        let mut engine = PollEngine::new();
        let first = engine.issue(names(&["a"]), 1, pending(&mut tasks));
        let second = engine.issue(names(&["a", "b"]), 2, pending(&mut tasks));
        assert_ne!(first, second);

        assert!(engine.accept(first).is_none());
        let flight = engine.accept(second).unwrap();
        assert_eq!(flight.channels, names(&["a", "b"]));
        assert!(matches!(engine.state(), PollState::Delivering));
        assert!(engine.accept(second).is_none());
    }

    #[tokio::test]
    async fn superseded_fetch_is_aborted() {
        let mut tasks = JoinSet::new();
        let mut engine = PollEngine::new();
        engine.issue(names(&["a"]), 1, pending(&mut tasks));
        engine.issue(names(&["b"]), 2, pending(&mut tasks));

        let first = tasks.join_next().await.unwrap();
        assert!(first.unwrap_err().is_cancelled());
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn cursor_advances_only_on_finish() {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut engine = PollEngine::new();
        let mut seen = Vec::new();

        let id = engine.issue(names(&["a"]), 1, |_, request| {
            seen.push(request.cursor);
            tasks.spawn(std::future::pending())
        });
        engine.accept(id).unwrap();
        engine.finish(Timetoken(42));
        assert!(matches!(engine.state(), PollState::Idle));

        let id = engine.issue(names(&["a"]), 1, |_, request| {
            seen.push(request.cursor);
            tasks.spawn(std::future::pending())
        });
        engine.accept(id).unwrap();
        engine.fail(Instant::now());
        assert_eq!(engine.cursor(), Timetoken(42));

        engine.retry_due();
        engine.issue(names(&["a"]), 1, |_, request| {
            seen.push(request.cursor);
            tasks.spawn(std::future::pending())
        });
        assert_eq!(seen, vec![Timetoken::ZERO, Timetoken(42), Timetoken(42)]);
    }

    #[tokio::test]
    async fn owner_of_matches_running_task() {
        let mut tasks = JoinSet::new();
        let mut engine = PollEngine::new();
        let mut task = None;
        let id = engine.issue(names(&["a"]), 1, |_, _| {
            let handle = tasks.spawn(std::future::pending::<()>());
            task = Some(handle.id());
            handle
        });
        let other = tasks.spawn(std::future::pending::<()>()).id();

        assert_eq!(engine.owner_of(task.unwrap()), Some(id));
        assert_eq!(engine.owner_of(other), None);

        engine.suspend();
        assert_eq!(engine.owner_of(task.unwrap()), None);
        assert_eq!(engine.retry_at(), None);
    }
}
