use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use dfs_ap::event::{outbound, HostStream, RequestStream};
use dfs_ap::leakage::DEFAULT_LEAKAGE;
use dfs_ap::nol::{ManualClock, NolStatus};
use dfs_ap::session::State;
use dfs_ap::timer::ManualScheduler;
use dfs_ap::{
    Bandwidth, ChannelInventory, ChannelRange, Constraints, Controller, DomainPolicy,
    DriverConfig, Event, FailureReason, Message, Notification, NolStore, RadioDomain, RegDomain, Request,
    SelectionEngine, SessionId, Simulation, StartParams, StateName, Timestamp,
};

const A: SessionId = SessionId(1);
const B: SessionId = SessionId(2);

struct Bench {
    controller: Controller<ManualScheduler>,
    scheduler: ManualScheduler,
    clock: ManualClock,
    requests: RequestStream,
    host: HostStream,
}

impl Bench {
    fn new() -> Self {
        let (requests, req_rx, host, host_rx) = outbound();
        let scheduler = ManualScheduler::new();
        let clock = ManualClock::new(0);
        let domain = RadioDomain::new(
            DomainPolicy::default(),
            scheduler.clone(),
            Box::new(clock.clone()),
            requests,
            host,
        )
        .with_rng(Box::new(StdRng::seed_from_u64(21)));
        Bench {
            controller: Controller::new(domain),
            scheduler,
            clock,
            requests: req_rx,
            host: host_rx,
        }
    }

    fn send(&mut self, id: SessionId, event: Event) {
        self.controller.handle(Message::Session(id, event)).unwrap();
    }

    fn state(&self, id: SessionId) -> StateName {
        self.controller
            .session(id)
            .map(|s| s.state().name())
            .unwrap_or(StateName::Disconnected)
    }

    fn requests(&mut self, id: SessionId) -> Vec<Request> {
        let mut out = Vec::new();
        while let Ok(r) = self.requests.try_recv() {
            if r.session == id {
                out.push(r.request);
            }
        }
        out
    }

    fn notifications(&mut self) -> Vec<(Option<SessionId>, Notification)> {
        let mut out = Vec::new();
        while let Ok(e) = self.host.try_recv() {
            out.push((e.session, e.notification));
        }
        out
    }

    /// Starts `id` on channel 52 at 20 MHz, up to the hardware confirmation.
    fn start_on_52(&mut self, id: SessionId) {
        let params = StartParams {
            bandwidth: Some(Bandwidth::Mhz20),
            channels: Some(ChannelRange { first: 52, last: 64 }),
        };
        self.send(id, Event::StartRequest(params));
        if self.state(id) == StateName::ChannelSelect {
            self.send(id, Event::ScanComplete(vec![52]));
        }
        self.send(id, Event::HardwareStartConfirmed);
    }
}

#[test]
fn selection_falls_back_to_20mhz_around_quarantined_channel() {
    let inventory = ChannelInventory::new(RegDomain::Fcc, Some(&[36, 40, 44, 48]));
    let mut nol = NolStore::with_channels(&[36, 40, 44, 48], Duration::from_secs(1800));
    nol.report_radar(&[36], Timestamp(0));
    let engine = SelectionEngine::new(RegDomain::Fcc, &DEFAULT_LEAKAGE);

    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let selection = engine
            .select(&inventory, &nol, &Constraints::default(), Bandwidth::Mhz40, &mut rng)
            .unwrap();
        assert_eq!(selection.bandwidth, Bandwidth::Mhz20);
        assert!([40, 44, 48].contains(&selection.channel), "picked {}", selection.channel);
    }
}

#[test]
fn radar_during_compliance_wait_quarantines_and_reselects() {
    let mut bench = Bench::new();
    bench.start_on_52(A);
    assert_eq!(bench.state(A), StateName::DfsWait);
    assert!(bench.controller.domain().cac.is_running());
    bench.notifications();
    bench.requests(A);

    bench.clock.advance(Duration::from_secs(20));
    bench.controller.handle(Message::Radar { channels: vec![52], at: None }).unwrap();

    let nol = &bench.controller.domain().nol;
    let entry = nol.entries().iter().find(|e| e.channel == 52).unwrap();
    assert_eq!(entry.status, NolStatus::Unavailable);
    assert_eq!(entry.quarantined_at, Some(Timestamp(20_000)));

    let notes = bench.notifications();
    assert!(notes.contains(&(Some(A), Notification::RadarDetected { channels: vec![52] })));
    assert!(notes.contains(&(None, Notification::NolChanged { unavailable: vec![52] })));

    // The timer was stopped exactly once and not restarted yet.
    assert!(!bench.controller.domain().cac.is_running());
    assert_eq!(bench.scheduler.cancelled().len(), 1);
    assert_eq!(bench.controller.domain().cac.counts(), (1, 1));
    assert_eq!(bench.requests(A), vec![Request::CloseHardwareSession]);

    bench.send(A, Event::HardwareStopConfirmed);
    let next = match bench.controller.session(A).unwrap().state() {
        State::Starting { selection, .. } => selection.channel,
        other => panic!("expected restart, got {:?}", other),
    };
    assert_ne!(next, 52);
    assert!(ChannelRange { first: 52, last: 64 }.contains(next));
    assert_eq!(
        bench.requests(A),
        vec![Request::OpenHardwareSession { channel: next, bandwidth: Bandwidth::Mhz20 }]
    );

    // A stale expiry of the cancelled timer changes nothing.
    let stale = bench.scheduler.cancelled()[0];
    bench.controller.handle(Message::TimerFired(stale)).unwrap();
    assert_eq!(bench.state(A), StateName::Starting);

    bench.send(A, Event::HardwareStartConfirmed);
    assert_eq!(bench.state(A), StateName::DfsWait);
    assert_eq!(bench.controller.domain().cac.watch().unwrap().channel, next);
    assert_eq!(bench.scheduler.cancelled().len(), 1);
}

#[test]
fn sibling_sessions_share_one_compliance_timer() {
    let mut bench = Bench::new();
    bench.start_on_52(A);
    assert_eq!(bench.scheduler.scheduled_count(), 1);

    bench.start_on_52(B);
    assert_eq!(bench.state(B), StateName::DfsWait);
    assert_eq!(bench.scheduler.scheduled_count(), 1);
    assert_eq!(bench.controller.domain().cac.counts(), (1, 0));

    bench.send(A, Event::StopRequest);
    bench.send(A, Event::HardwareStopConfirmed);
    assert_eq!(bench.state(A), StateName::Disconnected);
    assert!(bench.controller.domain().cac.is_running());
    assert!(bench.scheduler.cancelled().is_empty());

    bench.send(B, Event::StopRequest);
    assert!(!bench.controller.domain().cac.is_running());
    assert_eq!(bench.scheduler.cancelled().len(), 1);
    bench.send(B, Event::HardwareStopConfirmed);
    assert_eq!(bench.state(B), StateName::Disconnected);
    assert_eq!(bench.controller.domain().cac.counts(), (1, 1));
    assert!(bench.controller.domain().sessions.is_empty());
}

#[test]
fn one_expiry_releases_every_waiting_sibling() {
    let mut bench = Bench::new();
    bench.start_on_52(A);
    bench.start_on_52(B);
    bench.notifications();

    let (id, _) = bench.scheduler.take_pending()[0];
    bench.controller.handle(Message::TimerFired(id)).unwrap();
    assert_eq!(bench.state(A), StateName::Started);
    assert_eq!(bench.state(B), StateName::Started);

    let ended: Vec<_> = bench
        .notifications()
        .into_iter()
        .filter(|(_, n)| matches!(n, Notification::ComplianceMonitoringEnded { channel: 52 }))
        .map(|(s, _)| s)
        .collect();
    assert_eq!(ended, vec![Some(A), Some(B)]);
}

#[test]
fn radar_before_hardware_confirmation_never_transmits_on_quarantined_channel() {
    let mut bench = Bench::new();
    let params = StartParams {
        bandwidth: Some(Bandwidth::Mhz20),
        channels: Some(ChannelRange { first: 52, last: 64 }),
    };
    bench.send(A, Event::StartRequest(params));
    bench.send(A, Event::ScanComplete(vec![52]));
    assert_eq!(bench.state(A), StateName::Starting);
    bench.requests(A);

    bench.controller.handle(Message::Radar { channels: vec![52], at: None }).unwrap();
    assert_eq!(bench.state(A), StateName::Disconnecting);
    assert_eq!(bench.requests(A), vec![Request::CloseHardwareSession]);

    bench.send(A, Event::HardwareStartConfirmed);
    assert!(!bench.controller.domain().cac.is_running());
    bench.send(A, Event::HardwareStopConfirmed);
    let next = bench.controller.session(A).unwrap().state().selection().unwrap().channel;
    assert_ne!(next, 52);
    bench.send(A, Event::HardwareStartConfirmed);

    let (id, _) = bench.scheduler.take_pending()[0];
    bench.controller.handle(Message::TimerFired(id)).unwrap();
    assert_eq!(bench.state(A), StateName::Started);

    let notes = bench.notifications();
    assert!(!notes.iter().any(|(_, n)| matches!(
        n,
        Notification::ComplianceMonitoringStarted { channel: 52, .. }
            | Notification::StartSucceeded { channel: 52, .. }
    )));
    let terminal: Vec<_> = notes.iter().filter(|(_, n)| n.is_terminal()).collect();
    assert_eq!(
        terminal,
        vec![&(Some(A), Notification::StartSucceeded { channel: next, bandwidth: Bandwidth::Mhz20 })]
    );
}

#[test]
fn joining_session_whose_hardware_fails_does_not_start_with_sibling() {
    let mut bench = Bench::new();
    bench.start_on_52(A);
    let params = StartParams {
        bandwidth: Some(Bandwidth::Mhz20),
        channels: Some(ChannelRange { first: 52, last: 64 }),
    };
    bench.send(B, Event::StartRequest(params));
    assert_eq!(bench.state(B), StateName::Starting);
    assert_eq!(
        bench.requests(B),
        vec![Request::OpenHardwareSession { channel: 52, bandwidth: Bandwidth::Mhz20 }]
    );

    bench.send(B, Event::HardwareStartFailed);
    assert_eq!(bench.state(B), StateName::Starting);
    assert_eq!(
        bench.requests(B),
        vec![Request::OpenHardwareSession { channel: 36, bandwidth: Bandwidth::Mhz20 }]
    );
    assert!(bench.controller.domain().cac.is_running());
    bench.notifications();

    let (id, _) = bench.scheduler.take_pending()[0];
    bench.controller.handle(Message::TimerFired(id)).unwrap();
    assert_eq!(bench.state(A), StateName::Started);
    assert_eq!(bench.state(B), StateName::Starting);
    let notes = bench.notifications();
    assert!(!notes.iter().any(|(s, _)| *s == Some(B)));

    bench.send(B, Event::HardwareStartConfirmed);
    assert_eq!(
        bench.notifications(),
        vec![(Some(B), Notification::StartSucceeded { channel: 36, bandwidth: Bandwidth::Mhz20 })]
    );
}

#[test]
fn session_range_is_honoured_when_a_sibling_waits_elsewhere() {
    let mut bench = Bench::new();
    bench.start_on_52(A);
    bench.requests(B);

    let narrow = ChannelRange { first: 100, last: 100 };
    let params = StartParams { bandwidth: Some(Bandwidth::Mhz20), channels: Some(narrow) };
    bench.send(B, Event::StartRequest(params));
    assert_eq!(bench.state(B), StateName::ChannelSelect);
    assert_eq!(bench.requests(B), vec![Request::IssueScan { range: narrow }]);

    bench.send(B, Event::ScanComplete(vec![100]));
    assert_eq!(
        bench.requests(B),
        vec![Request::OpenHardwareSession { channel: 100, bandwidth: Bandwidth::Mhz20 }]
    );
    bench.notifications();

    // The radio already checks 52 for A, which B may not use.
    bench.send(B, Event::HardwareStartConfirmed);
    assert_eq!(bench.requests(B), vec![Request::CloseHardwareSession]);
    bench.send(B, Event::HardwareStopConfirmed);
    assert_eq!(bench.state(B), StateName::Disconnected);
    assert_eq!(
        bench.notifications(),
        vec![(Some(B), Notification::StartFailed { reason: FailureReason::NoChannelAvailable })]
    );
    assert_eq!(bench.controller.domain().cac.watch().unwrap().channel, 52);
}

#[test]
fn simulation_recovers_from_radar_on_both_sessions() {
    let policy = DomainPolicy {
        channels: Some(ChannelRange { first: 52, last: 64 }),
        bandwidth: Bandwidth::Mhz20,
        ..Default::default()
    };
    let mut sim = Simulation::new(policy, DriverConfig::default(), 5);
    for id in [A, B] {
        sim.send(Message::Session(id, Event::StartRequest(StartParams::default()))).unwrap();
    }
    let first = sim.status().cac.unwrap().channel;
    assert!(sim.status().sessions.iter().all(|s| s.channel == Some(first)));

    sim.advance(Duration::from_secs(10)).unwrap();
    sim.radar(&[first]).unwrap();
    assert_eq!(sim.scheduler().cancelled().len(), 1);

    sim.advance(Duration::from_secs(120)).unwrap();
    let status = sim.status();
    assert!(status.sessions.iter().all(|s| s.state == StateName::Started));
    let channel = status.sessions[0].channel.unwrap();
    assert_ne!(channel, first);
    assert_eq!(status.sessions[1].channel, Some(channel));
    assert!(status.nol.iter().any(|e| e.channel == first && e.status == NolStatus::Unavailable));
}

#[test]
fn simulation_retries_on_default_channel() {
    let policy = DomainPolicy {
        channels: Some(ChannelRange { first: 36, last: 48 }),
        bandwidth: Bandwidth::Mhz20,
        ..Default::default()
    };
    let driver = DriverConfig { refuse: [40, 44, 48].into_iter().collect(), ..Default::default() };
    let mut sim = Simulation::new(policy, driver, 9);
    sim.send(Message::Session(A, Event::StartRequest(StartParams::default()))).unwrap();

    let status = sim.status();
    assert_eq!(status.sessions[0].state, StateName::Started);
    assert_eq!(status.sessions[0].channel, Some(36));
}

#[test]
fn quarantine_expires_after_nol_duration() {
    let mut sim = Simulation::new(DomainPolicy::default(), DriverConfig::default(), 2);
    sim.radar(&[100]).unwrap();
    assert_eq!(sim.status().nol.iter().find(|e| e.channel == 100).unwrap().status, NolStatus::Unavailable);

    sim.advance(Duration::from_secs(1799)).unwrap();
    assert_eq!(sim.status().nol.iter().find(|e| e.channel == 100).unwrap().status, NolStatus::Unavailable);
    sim.advance(Duration::from_secs(1)).unwrap();
    assert_eq!(sim.status().nol.iter().find(|e| e.channel == 100).unwrap().status, NolStatus::Available);

    let changes: Vec<_> = sim
        .drain()
        .into_iter()
        .filter_map(|(at, e)| match e.notification {
            Notification::NolChanged { unavailable } => Some((at, unavailable)),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![(Duration::ZERO, vec![100]), (Duration::from_secs(1800), vec![])]);
}
