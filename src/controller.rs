//! The single-consumer event loop that owns every AP session of a radio.
//!
//! All inbound traffic (host requests, driver confirmations, radar reports,
//! timer expiries) is funnelled through one inbox and handled to completion
//! one message at a time, so sessions never observe each other mid-transition.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::{DomainPolicy, DomainStatus, RadioDomain};
use crate::error::DfsError;
use crate::event::{outbound, Event, HostStream, Message, RequestStream, StartParams};
use crate::nol::{MonotonicClock, Timestamp};
use crate::registry::SessionId;
use crate::session::{ApSession, State};
use crate::timer::{Scheduler, TokioScheduler};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

pub struct Controller<S> {
    sessions: BTreeMap<SessionId, ApSession>,
    domain: RadioDomain<S>,
}

impl<S: Scheduler> Controller<S> {
    pub fn new(domain: RadioDomain<S>) -> Self {
        Controller { sessions: BTreeMap::new(), domain }
    }

    pub fn domain(&self) -> &RadioDomain<S> {
        &self.domain
    }

    pub fn domain_mut(&mut self) -> &mut RadioDomain<S> {
        &mut self.domain
    }

    pub fn session(&self, id: SessionId) -> Option<&ApSession> {
        self.sessions.get(&id)
    }

    pub fn handle(&mut self, message: Message) -> Result<(), DfsError> {
        match message {
            Message::Session(id, event) => self.dispatch(id, event)?,
            Message::Radar { channels, at } => {
                let at = at.unwrap_or_else(|| self.domain.now());
                info!("Radar reported on {:?} at tick {}", channels, at.0);
                self.radar(channels, at);
            }
            Message::TimerFired(id) => match self.domain.cac.expire(id) {
                Some(channel) => self.broadcast(|| Event::ComplianceTimerExpired { channel }),
                None => debug!("Ignoring stale timeout {:?}", id),
            },
            Message::RefreshNol => self.domain.refresh_nol(),
            Message::Status(reply) => {
                if reply.send(self.domain.status()).is_err() {
                    debug!("Status requester went away");
                }
            }
            Message::Shutdown => debug!("Shutdown is handled by the run loop"),
        }
        Ok(())
    }

    fn dispatch(&mut self, id: SessionId, event: Event) -> Result<(), DfsError> {
        if !self.sessions.contains_key(&id) {
            if !matches!(event, Event::StartRequest(_)) {
                return Err(DfsError::UnknownSession(id));
            }
            self.sessions.insert(id, ApSession::new(id));
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.handle_event(event, &mut self.domain);
            if *session.state() == State::Disconnected {
                debug!("{} finished", id);
                self.sessions.remove(&id);
            }
        }
        Ok(())
    }

    /// Quarantines the channels once, then lets every session react.
    fn radar(&mut self, channels: Vec<u8>, at: Timestamp) {
        self.domain.report_radar(&channels, at);
        self.broadcast(|| Event::RadarDetected { channels: channels.clone(), at });
    }

    fn broadcast<F: Fn() -> Event>(&mut self, event: F) {
        for session in self.sessions.values_mut() {
            session.handle_event(event(), &mut self.domain);
        }
        self.sessions.retain(|_, s| *s.state() != State::Disconnected);
    }
}

/// Cloneable front door to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<Message>,
}

impl ControllerHandle {
    pub fn new(inbox: mpsc::UnboundedSender<Message>) -> Self {
        ControllerHandle { inbox }
    }

    /// A raw sender for collaborators that post events themselves.
    pub fn inbox(&self) -> mpsc::UnboundedSender<Message> {
        self.inbox.clone()
    }

    pub fn send(&self, message: Message) -> Result<(), DfsError> {
        self.inbox.send(message).map_err(|_| DfsError::ControllerGone)
    }

    pub fn deliver(&self, id: SessionId, event: Event) -> Result<(), DfsError> {
        self.send(Message::Session(id, event))
    }

    pub fn start(&self, id: SessionId, params: StartParams) -> Result<(), DfsError> {
        self.deliver(id, Event::StartRequest(params))
    }

    pub fn stop(&self, id: SessionId) -> Result<(), DfsError> {
        self.deliver(id, Event::StopRequest)
    }

    pub fn radar(&self, channels: Vec<u8>) -> Result<(), DfsError> {
        self.send(Message::Radar { channels, at: None })
    }

    pub async fn status(&self) -> Result<DomainStatus, DfsError> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::Status(tx))?;
        rx.await.map_err(|_| DfsError::ControllerGone)
    }

    pub fn shutdown(&self) -> Result<(), DfsError> {
        self.send(Message::Shutdown)
    }
}

/// A controller running on the tokio runtime, with the outbound streams a
/// driver and a host consume.
pub struct Runtime {
    pub handle: ControllerHandle,
    pub requests: RequestStream,
    pub host: HostStream,
    pub task: JoinHandle<()>,
}

/// Spawns a controller for `policy`. Must be called from within a tokio
/// runtime.
pub fn spawn(policy: DomainPolicy, refresh: Duration) -> Runtime {
    let (inbox, rx) = mpsc::unbounded_channel();
    let (requests, req_rx, host, host_rx) = outbound();
    let domain = RadioDomain::new(
        policy,
        TokioScheduler::new(inbox.clone()),
        Box::new(MonotonicClock::new()),
        requests,
        host,
    );
    let task = tokio::spawn(run(Controller::new(domain), rx, refresh));
    Runtime { handle: ControllerHandle::new(inbox), requests: req_rx, host: host_rx, task }
}

pub async fn run<S: Scheduler + 'static>(
    mut controller: Controller<S>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    refresh: Duration,
) {
    let mut ticker = tokio::time::interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Controller running, NOL refresh every {:?}", refresh);

    loop {
        let message = tokio::select! {
            message = inbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = ticker.tick() => Message::RefreshNol,
        };
        if let Message::Shutdown = message {
            break;
        }
        if let Err(e) = controller.handle(message) {
            warn!("{}", e);
        }
    }
    info!("Controller stopped");
}
