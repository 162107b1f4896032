//! The radio domain context.
//!
//! Everything AP sessions on one radio share lives here: the NOL, the
//! compliance timer, the session registry, the administrator policy and the
//! outbound sinks. The controller owns the single instance and lends it to
//! one session transition at a time.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::channel::{Bandwidth, ChannelInventory, ChannelRange, Location, RegDomain};
use crate::compliance::{ComplianceTimer, StartOutcome, Watch};
use crate::error::DfsError;
use crate::event::{HostEvent, HostSink, Notification, Request, RequestSink, SessionRequest};
use crate::leakage::{LeakageMatrix, DEFAULT_LEAKAGE, DEFAULT_LEAKAGE_THRESHOLD};
use crate::nol::{Clock, DfsTiming, NolEntry, NolStore, Timestamp};
use crate::registry::{SessionId, SessionInfo, SessionRegistry, StateName};
use crate::selection::{Constraints, Selection, SelectionEngine};
use crate::timer::Scheduler;

/// Administrator policy for a radio domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPolicy {
    pub regulatory: RegDomain,
    pub location: Location,
    pub channels: Option<ChannelRange>,
    pub excluded: Vec<ChannelRange>,
    pub bandwidth: Bandwidth,
    pub prefer_non_dfs: bool,
    pub leakage_threshold: u16,
    pub skip_cac: bool,
    pub timing: DfsTiming,
    pub default_channel: u8,
    pub concurrent: Vec<(u8, Bandwidth)>,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        DomainPolicy {
            regulatory: RegDomain::Fcc,
            location: Location::Any,
            channels: None,
            excluded: Vec::new(),
            bandwidth: Bandwidth::Mhz80,
            prefer_non_dfs: true,
            leakage_threshold: DEFAULT_LEAKAGE_THRESHOLD,
            skip_cac: false,
            timing: DfsTiming::default(),
            default_channel: 36,
            concurrent: Vec::new(),
        }
    }
}

/// Snapshot served to the host.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub regulatory: RegDomain,
    pub now: Timestamp,
    pub sessions: Vec<SessionInfo>,
    pub nol: Vec<NolEntry>,
    pub cac: Option<Watch>,
}

pub struct RadioDomain<S> {
    pub policy: DomainPolicy,
    pub nol: NolStore,
    pub cac: ComplianceTimer<S>,
    pub sessions: SessionRegistry,
    leakage: &'static LeakageMatrix,
    clock: Box<dyn Clock>,
    rng: Box<dyn RngCore + Send>,
    requests: RequestSink,
    host: HostSink,
}

impl<S: Scheduler> RadioDomain<S> {
    pub fn new(
        policy: DomainPolicy,
        scheduler: S,
        clock: Box<dyn Clock>,
        requests: RequestSink,
        host: HostSink,
    ) -> Self {
        let seed = rand::random::<u64>() ^ clock.now().0 as u64;
        RadioDomain {
            nol: NolStore::new(policy.regulatory, &policy.timing),
            cac: ComplianceTimer::new(scheduler),
            sessions: SessionRegistry::new(),
            leakage: &DEFAULT_LEAKAGE,
            clock,
            rng: Box::new(StdRng::seed_from_u64(seed)),
            requests,
            host,
            policy,
        }
    }

    /// Replaces the random source, for reproducible selection.
    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = rng;
        self
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn request(&self, session: SessionId, request: Request) {
        debug!("{} -> driver: {:?}", session, request);
        self.requests.send(SessionRequest { session, request });
    }

    pub fn notify(&self, session: Option<SessionId>, notification: Notification) {
        debug!("{:?} -> host: {:?}", session, notification);
        self.host.send(HostEvent { session, notification });
    }

    fn engine(&self) -> SelectionEngine<'static> {
        SelectionEngine::new(self.policy.regulatory, self.leakage)
    }

    /// The range a session scans and selects within.
    pub fn scan_range(&self, requested: Option<ChannelRange>) -> ChannelRange {
        requested.or(self.policy.channels).unwrap_or_else(|| {
            let channels = self.policy.regulatory.channels();
            let first = channels.first().map(|c| c.number).unwrap_or(1);
            let last = channels.last().map(|c| c.number).unwrap_or(first);
            ChannelRange { first, last }
        })
    }

    fn constraints(&self, range: Option<ChannelRange>, allow_monitored: bool) -> Constraints {
        Constraints {
            range: range.or(self.policy.channels),
            excluded: self.policy.excluded.clone(),
            location: self.policy.location,
            leakage_threshold: self.policy.leakage_threshold,
            concurrent: self.policy.concurrent.clone(),
            prefer_non_dfs: self.policy.prefer_non_dfs,
            allow_monitored,
        }
    }

    /// Whether transmission on `selection` must wait for a CAC.
    pub fn needs_monitoring(&self, selection: &Selection) -> bool {
        selection.requires_monitoring && !self.policy.skip_cac
    }

    /// Chooses a channel for `id`. A channel already used by a sibling
    /// session is preferred so the radio stays on one channel; otherwise the
    /// selection engine runs over a fresh inventory.
    pub fn pick_channel(
        &mut self,
        id: SessionId,
        scanned: Option<&[u8]>,
        range: Option<ChannelRange>,
        bandwidth: Bandwidth,
        allow_monitored: bool,
    ) -> Result<Selection, DfsError> {
        self.refresh_nol();
        let constraints = self.constraints(range, allow_monitored);

        let siblings: Vec<SessionInfo> = self.sessions.active().filter(|s| s.id != id).copied().collect();
        for sibling in siblings {
            let (Some(channel), Some(width)) = (sibling.channel, sibling.bandwidth) else {
                continue;
            };
            let Ok(selection) = self.engine().check(channel, width.min(bandwidth), &self.nol) else {
                continue;
            };
            if !self.permits(range, &selection) {
                continue;
            }
            let satisfied = sibling.state == StateName::Started;
            if allow_monitored || satisfied || !self.needs_monitoring(&selection) {
                info!("{} shares channel {} with {}", id, channel, sibling.id);
                return Ok(selection);
            }
        }

        let inventory = ChannelInventory::new(self.policy.regulatory, scanned);
        let engine = self.engine();
        engine.select(&inventory, &self.nol, &constraints, bandwidth, &mut self.rng)
    }

    /// The configured default channel, if it may be used right now.
    pub fn fallback_channel(&mut self, bandwidth: Bandwidth) -> Result<Selection, DfsError> {
        self.refresh_nol();
        self.engine().check(self.policy.default_channel, bandwidth, &self.nol)
    }

    /// Validates an explicit channel against the domain and the NOL.
    pub fn check_channel(&mut self, channel: u8, bandwidth: Bandwidth) -> Result<Selection, DfsError> {
        self.refresh_nol();
        self.engine().check(channel, bandwidth, &self.nol)
    }

    /// Whether every member of `selection` lies inside the session range
    /// (or the administrator range) and outside the excluded ranges.
    pub fn permits(&self, range: Option<ChannelRange>, selection: &Selection) -> bool {
        let constraints = self.constraints(range, true);
        selection.members.iter().all(|m| {
            constraints.range.map(|r| r.contains(*m)).unwrap_or(true)
                && !constraints.excluded.iter().any(|r| r.contains(*m))
        })
    }

    /// The compliance wait a new session limited to `range` can join: a
    /// sibling is waiting and the timer runs on the sibling's channel.
    pub fn joinable_wait(&mut self, id: SessionId, range: Option<ChannelRange>) -> Option<Selection> {
        let (channel, bandwidth) = self.sessions.sibling_monitoring(id)?;
        if self.cac.watch().map(|w| w.channel) != Some(channel) {
            return None;
        }
        let selection = self.check_channel(channel, bandwidth).ok()?;
        if !self.permits(range, &selection) {
            debug!("{} may not join the CAC on channel {}", id, channel);
            return None;
        }
        self.needs_monitoring(&selection).then_some(selection)
    }

    /// Re-validates a previously chosen channel.
    pub fn revalidate(&mut self, selection: &Selection) -> Result<Selection, DfsError> {
        self.refresh_nol();
        self.engine().check(selection.channel, selection.bandwidth, &self.nol)
    }

    pub fn report_radar(&mut self, channels: &[u8], at: Timestamp) {
        if !self.nol.report_radar(channels, at).is_empty() {
            self.notify(None, Notification::NolChanged { unavailable: self.nol.unavailable() });
        }
    }

    pub fn refresh_nol(&mut self) {
        let now = self.now();
        if !self.nol.refresh(now).is_empty() {
            self.notify(None, Notification::NolChanged { unavailable: self.nol.unavailable() });
        }
    }

    pub fn start_cac(&mut self, selection: &Selection) -> StartOutcome {
        let duration = self.policy.timing.cac_duration(self.policy.regulatory, &selection.members);
        let now = self.now();
        self.cac.start(selection.channel, duration, now)
    }

    /// Withdraws `id` from the compliance wait and stops the timer unless a
    /// sibling still waits on it.
    pub fn release_monitoring(&mut self, id: SessionId) -> bool {
        self.sessions.update(id, |s| s.needs_monitoring = false);
        self.cac.stop(id, &self.sessions)
    }

    /// Removes `id` from the registry. Closing the last session stops the
    /// timer and clears the NOL.
    pub fn session_closed(&mut self, id: SessionId) {
        self.sessions.unregister(id);
        if self.sessions.is_empty() {
            info!("Last AP session closed, resetting radio domain");
            self.cac.cancel();
            self.nol.reset();
        }
    }

    pub fn status(&self) -> DomainStatus {
        DomainStatus {
            regulatory: self.policy.regulatory,
            now: self.now(),
            sessions: self.sessions.active().copied().collect(),
            nol: self.nol.entries().to_vec(),
            cac: self.cac.watch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::outbound;
    use crate::nol::ManualClock;
    use crate::timer::ManualScheduler;

    fn domain(policy: DomainPolicy) -> RadioDomain<ManualScheduler> {
        let (requests, _req_rx, host, _host_rx) = outbound();
        RadioDomain::new(policy, ManualScheduler::new(), Box::new(ManualClock::new(0)), requests, host)
            .with_rng(Box::new(StdRng::seed_from_u64(5)))
    }

    #[test]
    fn pick_channel_prefers_sibling_channel() {
        let mut d = domain(DomainPolicy::default());
        d.sessions.register(SessionId(1));
        d.sessions.update(SessionId(1), |s| {
            s.state = StateName::Started;
            s.channel = Some(100);
            s.bandwidth = Some(Bandwidth::Mhz40);
        });
        let s = d.pick_channel(SessionId(2), None, None, Bandwidth::Mhz80, false).unwrap();
        assert_eq!(s.channel, 100);
        assert_eq!(s.bandwidth, Bandwidth::Mhz40);
    }

    #[test]
    fn pick_channel_skips_quarantined_sibling_channel() {
        let mut d = domain(DomainPolicy::default());
        d.sessions.register(SessionId(1));
        d.sessions.update(SessionId(1), |s| {
            s.state = StateName::DfsWait;
            s.channel = Some(52);
            s.bandwidth = Some(Bandwidth::Mhz20);
        });
        d.report_radar(&[52], Timestamp(0));
        let s = d.pick_channel(SessionId(2), None, None, Bandwidth::Mhz20, true).unwrap();
        assert_ne!(s.channel, 52);
    }

    #[test]
    fn sibling_channel_outside_range_is_not_shared() {
        let mut d = domain(DomainPolicy {
            excluded: vec![ChannelRange { first: 56, last: 56 }],
            ..Default::default()
        });
        d.sessions.register(SessionId(1));
        d.sessions.update(SessionId(1), |s| {
            s.state = StateName::DfsWait;
            s.channel = Some(52);
            s.bandwidth = Some(Bandwidth::Mhz20);
            s.needs_monitoring = true;
        });
        let selection = d.check_channel(52, Bandwidth::Mhz20).unwrap();
        d.start_cac(&selection);

        let narrow = Some(ChannelRange { first: 100, last: 100 });
        assert_eq!(d.joinable_wait(SessionId(2), narrow), None);
        assert_eq!(d.joinable_wait(SessionId(2), None).map(|s| s.channel), Some(52));

        let s = d.pick_channel(SessionId(2), None, narrow, Bandwidth::Mhz20, true).unwrap();
        assert_eq!(s.channel, 100);

        let wide = d.check_channel(52, Bandwidth::Mhz40).unwrap();
        assert_eq!(wide.members, vec![52, 56]);
        assert!(!d.permits(None, &wide));
        assert!(d.permits(None, &selection));
    }

    #[test]
    fn skip_cac_policy_disables_monitoring() {
        let d = domain(DomainPolicy { skip_cac: true, ..Default::default() });
        let selection = d.engine().check(52, Bandwidth::Mhz20, &d.nol).unwrap();
        assert!(selection.requires_monitoring);
        assert!(!d.needs_monitoring(&selection));
    }

    #[test]
    fn closing_last_session_resets_domain() {
        let mut d = domain(DomainPolicy::default());
        d.sessions.register(SessionId(1));
        d.report_radar(&[60], Timestamp(0));
        let selection = d.engine().check(100, Bandwidth::Mhz20, &d.nol).unwrap();
        d.start_cac(&selection);
        d.session_closed(SessionId(1));
        assert!(!d.cac.is_running());
        assert!(d.nol.unavailable().is_empty());
    }

    #[test]
    fn default_scan_range_spans_domain() {
        let d = domain(DomainPolicy { regulatory: RegDomain::Etsi, ..Default::default() });
        assert_eq!(d.scan_range(None), ChannelRange { first: 1, last: 140 });
        let r = ChannelRange { first: 36, last: 48 };
        assert_eq!(d.scan_range(Some(r)), r);
    }
}
