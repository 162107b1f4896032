//! One-shot timeouts keyed by event id.
//!
//! A [`Timer`] remembers what each scheduled id stands for; the [`Scheduler`]
//! behind it is responsible for eventually delivering
//! [`Message::TimerFired`] into the controller inbox. Expiry therefore never
//! touches state directly: the controller looks the id up with
//! [`Timer::triggered`], and an id that was cancelled in the meantime yields
//! nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::event::Message;

#[derive(PartialEq, Eq, Hash, Debug, Copy, Clone, PartialOrd, Ord)]
pub struct EventId(pub u64);

pub trait Scheduler: Send {
    /// Requests a [`Message::TimerFired`] after `after`. Returns the id used
    /// to recognise or cancel it.
    fn schedule(&mut self, after: Duration) -> EventId;

    fn cancel(&mut self, id: EventId);
}

pub struct Timer<E, S> {
    events: HashMap<EventId, E>,
    scheduler: S,
}

impl<E, S: Scheduler> Timer<E, S> {
    pub fn new(scheduler: S) -> Self {
        Self { events: HashMap::default(), scheduler }
    }

    /// Claims a fired event. Returns `None` for cancelled or already
    /// claimed ids.
    pub fn triggered(&mut self, event_id: &EventId) -> Option<E> {
        self.events.remove(event_id)
    }

    pub fn schedule_event(&mut self, after: Duration, event: E) -> EventId {
        let event_id = self.scheduler.schedule(after);
        self.events.insert(event_id, event);
        event_id
    }

    pub fn cancel_event(&mut self, event_id: EventId) {
        self.events.remove(&event_id);
        self.scheduler.cancel(event_id);
    }

    pub fn cancel_all(&mut self) {
        for event_id in self.events.keys() {
            self.scheduler.cancel(*event_id);
        }
        self.events.clear();
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }
}

/// Schedules timeouts as tokio tasks that post into the controller inbox.
pub struct TokioScheduler {
    next_id: u64,
    runtime: Handle,
    inbox: UnboundedSender<Message>,
    tasks: HashMap<EventId, JoinHandle<()>>,
}

impl TokioScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(inbox: UnboundedSender<Message>) -> Self {
        TokioScheduler { next_id: 0, runtime: Handle::current(), inbox, tasks: HashMap::new() }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, after: Duration) -> EventId {
        self.tasks.retain(|_, task| !task.is_finished());
        self.next_id += 1;
        let id = EventId(self.next_id);
        let inbox = self.inbox.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            // The controller may already be gone during shutdown.
            let _ = inbox.send(Message::TimerFired(id));
        });
        self.tasks.insert(id, task);
        id
    }

    fn cancel(&mut self, id: EventId) {
        if let Some(task) = self.tasks.remove(&id) {
            debug!("Aborting timeout {:?}", id);
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
struct ManualState {
    next_id: u64,
    pending: Vec<(EventId, Duration)>,
    scheduled: usize,
    cancelled: Vec<EventId>,
}

/// A scheduler driven by hand: nothing fires until the owner takes the
/// pending timeouts and posts them itself. Clones share state, so a test or
/// simulation can keep a clone while the controller owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut ManualState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Timeouts scheduled and neither cancelled nor taken yet.
    pub fn pending(&self) -> Vec<(EventId, Duration)> {
        self.with(|s| s.pending.clone())
    }

    pub fn take_pending(&self) -> Vec<(EventId, Duration)> {
        self.with(|s| std::mem::take(&mut s.pending))
    }

    pub fn scheduled_count(&self) -> usize {
        self.with(|s| s.scheduled)
    }

    pub fn cancelled(&self) -> Vec<EventId> {
        self.with(|s| s.cancelled.clone())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, after: Duration) -> EventId {
        self.with(|s| {
            s.next_id += 1;
            s.scheduled += 1;
            let id = EventId(s.next_id);
            s.pending.push((id, after));
            id
        })
    }

    fn cancel(&mut self, id: EventId) {
        self.with(|s| {
            s.pending.retain(|(pending, _)| *pending != id);
            s.cancelled.push(id);
        })
    }
}
