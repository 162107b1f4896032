//! A simulated radio driver and scan engine.
//!
//! Answers every [`Request`] the controller emits with the event a real
//! driver would eventually deliver. [`SimulatedDriver::run`] does this on the
//! tokio runtime for the HTTP surface; [`Simulation`] does it synchronously
//! under virtual time for scripted runs and tests.

use std::collections::HashSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::RegDomain;
use crate::controller::Controller;
use crate::domain::{DomainPolicy, DomainStatus, RadioDomain};
use crate::error::DfsError;
use crate::event::{
    outbound, Event, HostEvent, HostStream, Message, Request, RequestStream, SessionRequest,
};
use crate::nol::{ManualClock, Timestamp};
use crate::timer::{EventId, ManualScheduler};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverConfig {
    /// Every scan fails.
    pub scan_fails: bool,
    /// Channels the hardware refuses to open on.
    pub refuse: HashSet<u8>,
    /// Delay before each answer when running on the runtime.
    pub latency: Duration,
}

pub struct SimulatedDriver {
    domain: RegDomain,
    config: DriverConfig,
}

impl SimulatedDriver {
    pub fn new(domain: RegDomain, config: DriverConfig) -> Self {
        SimulatedDriver { domain, config }
    }

    /// The event answering `request`, if it has one.
    pub fn respond(&self, request: &Request) -> Option<Event> {
        let event = match request {
            Request::IssueScan { range } => {
                if self.config.scan_fails {
                    Event::ScanFailed
                } else {
                    let covered = self
                        .domain
                        .channels()
                        .into_iter()
                        .map(|c| c.number)
                        .filter(|n| range.contains(*n))
                        .collect();
                    Event::ScanComplete(covered)
                }
            }
            Request::OpenHardwareSession { channel, .. } => {
                if self.config.refuse.contains(channel) {
                    Event::HardwareStartFailed
                } else {
                    Event::HardwareStartConfirmed
                }
            }
            Request::CloseHardwareSession => Event::HardwareStopConfirmed,
            Request::RequestChannelSwitch { .. } => Event::ChannelSwitchComplete,
            Request::RequestBeaconStart { channel } => {
                debug!("Beaconing on channel {}", channel);
                return None;
            }
        };
        Some(event)
    }

    /// Answers requests until either side goes away.
    pub async fn run(self, mut requests: RequestStream, inbox: mpsc::UnboundedSender<Message>) {
        while let Some(SessionRequest { session, request }) = requests.recv().await {
            let Some(event) = self.respond(&request) else {
                continue;
            };
            if !self.config.latency.is_zero() {
                tokio::time::sleep(self.config.latency).await;
            }
            if inbox.send(Message::Session(session, event)).is_err() {
                break;
            }
        }
        info!("Simulated driver stopped");
    }
}

/// A controller, a simulated driver and a manual clock stepped together.
///
/// Every message is handled to quiescence: driver answers are fed back until
/// no request is outstanding. Time only moves through [`Simulation::advance`],
/// which fires compliance timeouts at their deadlines.
pub struct Simulation {
    controller: Controller<ManualScheduler>,
    driver: SimulatedDriver,
    scheduler: ManualScheduler,
    clock: ManualClock,
    requests: RequestStream,
    host: HostStream,
    elapsed: Duration,
    deadlines: Vec<(Duration, EventId)>,
    log: Vec<(Duration, HostEvent)>,
}

impl Simulation {
    pub fn new(policy: DomainPolicy, driver: DriverConfig, seed: u64) -> Self {
        let (requests, req_rx, host, host_rx) = outbound();
        let scheduler = ManualScheduler::new();
        let clock = ManualClock::new(0);
        let regulatory = policy.regulatory;
        let domain = RadioDomain::new(
            policy,
            scheduler.clone(),
            Box::new(clock.clone()),
            requests,
            host,
        )
        .with_rng(Box::new(StdRng::seed_from_u64(seed)));
        Simulation {
            controller: Controller::new(domain),
            driver: SimulatedDriver::new(regulatory, driver),
            scheduler,
            clock,
            requests: req_rx,
            host: host_rx,
            elapsed: Duration::ZERO,
            deadlines: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn controller(&self) -> &Controller<ManualScheduler> {
        &self.controller
    }

    pub fn scheduler(&self) -> &ManualScheduler {
        &self.scheduler
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn now(&self) -> Timestamp {
        self.controller.domain().now()
    }

    pub fn status(&self) -> DomainStatus {
        self.controller.domain().status()
    }

    pub fn send(&mut self, message: Message) -> Result<(), DfsError> {
        self.controller.handle(message)?;
        self.settle()
    }

    /// Reports radar on `channels` at the current instant.
    pub fn radar(&mut self, channels: &[u8]) -> Result<(), DfsError> {
        let at = Some(self.now());
        self.send(Message::Radar { channels: channels.to_vec(), at })
    }

    /// Moves virtual time forward by `by`, firing every timeout that falls
    /// due on the way, then refreshes the NOL.
    pub fn advance(&mut self, by: Duration) -> Result<(), DfsError> {
        let target = self.elapsed + by;
        loop {
            self.deadlines.sort();
            match self.deadlines.first().copied() {
                Some((deadline, id)) if deadline <= target => {
                    self.deadlines.remove(0);
                    self.move_to(deadline);
                    self.send(Message::TimerFired(id))?;
                }
                _ => break,
            }
        }
        self.move_to(target);
        self.send(Message::RefreshNol)
    }

    /// Host notifications collected since the last call, stamped with the
    /// virtual time they were emitted at.
    pub fn drain(&mut self) -> Vec<(Duration, HostEvent)> {
        std::mem::take(&mut self.log)
    }

    fn move_to(&mut self, at: Duration) {
        if at > self.elapsed {
            self.clock.advance(at - self.elapsed);
            self.elapsed = at;
        }
    }

    fn settle(&mut self) -> Result<(), DfsError> {
        loop {
            for (id, after) in self.scheduler.take_pending() {
                self.deadlines.push((self.elapsed + after, id));
            }
            let cancelled = self.scheduler.cancelled();
            self.deadlines.retain(|(_, id)| !cancelled.contains(id));
            while let Ok(event) = self.host.try_recv() {
                self.log.push((self.elapsed, event));
            }

            let Ok(SessionRequest { session, request }) = self.requests.try_recv() else {
                return Ok(());
            };
            if let Some(event) = self.driver.respond(&request) {
                self.controller.handle(Message::Session(session, event))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Bandwidth, ChannelRange};
    use crate::event::{Notification, StartParams};
    use crate::registry::{SessionId, StateName};

    #[test]
    fn scan_covers_requested_range() {
        let driver = SimulatedDriver::new(RegDomain::Fcc, DriverConfig::default());
        let range = ChannelRange { first: 40, last: 56 };
        assert_eq!(
            driver.respond(&Request::IssueScan { range }),
            Some(Event::ScanComplete(vec![40, 44, 48, 52, 56]))
        );
        assert_eq!(driver.respond(&Request::RequestBeaconStart { channel: 40 }), None);
    }

    #[test]
    fn refused_channel_fails_open() {
        let config = DriverConfig { refuse: [40].into_iter().collect(), ..Default::default() };
        let driver = SimulatedDriver::new(RegDomain::Fcc, config);
        let open = |channel| Request::OpenHardwareSession { channel, bandwidth: Bandwidth::Mhz20 };
        assert_eq!(driver.respond(&open(40)), Some(Event::HardwareStartFailed));
        assert_eq!(driver.respond(&open(36)), Some(Event::HardwareStartConfirmed));
    }

    #[test]
    fn simulation_runs_compliance_wait_to_completion() {
        let mut sim = Simulation::new(DomainPolicy::default(), DriverConfig::default(), 1);
        let params = StartParams {
            bandwidth: Some(Bandwidth::Mhz20),
            channels: Some(ChannelRange { first: 100, last: 100 }),
        };
        sim.send(Message::Session(SessionId(1), Event::StartRequest(params))).unwrap();
        assert_eq!(sim.status().sessions[0].state, StateName::DfsWait);

        sim.advance(Duration::from_secs(59)).unwrap();
        assert_eq!(sim.status().sessions[0].state, StateName::DfsWait);
        sim.advance(Duration::from_secs(1)).unwrap();
        assert_eq!(sim.status().sessions[0].state, StateName::Started);

        let log = sim.drain();
        let (at, last) = log.last().unwrap();
        assert_eq!(*at, Duration::from_secs(60));
        assert_eq!(
            last.notification,
            Notification::StartSucceeded { channel: 100, bandwidth: Bandwidth::Mhz20 }
        );
    }
}
