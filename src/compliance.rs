//! The channel availability check (CAC) timer of a radio domain.
//!
//! There is exactly one per domain. Sessions that need to wait on the same
//! channel share it: starting it while it runs is a no-op, and a stop request
//! is ignored while any sibling session still waits on it.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::nol::Timestamp;
use crate::registry::{SessionId, SessionRegistry};
use crate::timer::{EventId, Scheduler, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watch {
    #[serde(skip)]
    pub id: EventId,
    pub channel: u8,
    pub deadline: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Already watching this channel.
    Joined,
    /// Already watching a different channel.
    Busy { channel: u8 },
}

pub struct ComplianceTimer<S> {
    timer: Timer<u8, S>,
    active: Option<Watch>,
    starts: usize,
    stops: usize,
}

impl<S: Scheduler> ComplianceTimer<S> {
    pub fn new(scheduler: S) -> Self {
        ComplianceTimer { timer: Timer::new(scheduler), active: None, starts: 0, stops: 0 }
    }

    pub fn start(&mut self, channel: u8, duration: Duration, now: Timestamp) -> StartOutcome {
        if let Some(watch) = &self.active {
            if watch.channel == channel {
                debug!("CAC on channel {} already running", channel);
                return StartOutcome::Joined;
            }
            return StartOutcome::Busy { channel: watch.channel };
        }
        let id = self.timer.schedule_event(duration, channel);
        self.active = Some(Watch { id, channel, deadline: now.after(duration) });
        self.starts += 1;
        info!("CAC started on channel {} for {:?}", channel, duration);
        StartOutcome::Started
    }

    /// Stops the timer on behalf of `requester` unless a sibling still
    /// needs it. Returns whether the timer was actually stopped.
    pub fn stop(&mut self, requester: SessionId, registry: &SessionRegistry) -> bool {
        if registry.others_need_monitoring(requester) {
            debug!("{} leaves CAC running for siblings", requester);
            return false;
        }
        self.cancel()
    }

    /// Stops the timer regardless of siblings.
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(watch) => {
                self.timer.cancel_event(watch.id);
                self.stops += 1;
                info!("CAC on channel {} stopped", watch.channel);
                true
            }
            None => false,
        }
    }

    /// Claims an expiry. Returns the watched channel, or `None` when the
    /// timeout was cancelled before it was delivered.
    pub fn expire(&mut self, id: EventId) -> Option<u8> {
        let channel = self.timer.triggered(&id)?;
        if self.active.map(|w| w.id) == Some(id) {
            self.active = None;
        }
        info!("CAC on channel {} completed", channel);
        Some(channel)
    }

    pub fn watch(&self) -> Option<Watch> {
        self.active
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// How many times the timer was started and stopped (not counting expiry).
    pub fn counts(&self) -> (usize, usize) {
        (self.starts, self.stops)
    }

    pub fn scheduler(&self) -> &S {
        self.timer.scheduler()
    }
}
