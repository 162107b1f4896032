//! Non-Occupancy List.
//!
//! One entry per radar-monitored channel of the active regulatory domain.
//! A radar report quarantines a channel (`Unavailable`) and stamps it with
//! the report time; a periodic refresh releases it (`Available`) once the
//! quarantine duration has elapsed.
//!
//! Timestamps come from a 32-bit millisecond tick that wraps roughly every
//! 49.7 days, so every elapsed-time computation uses wrapping arithmetic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{RegDomain, ChannelRange};

/// Default quarantine after a radar detection.
pub const DEFAULT_NOL_DURATION: Duration = Duration::from_secs(30 * 60);
/// Default channel availability check duration.
pub const DEFAULT_CAC_DURATION: Duration = Duration::from_secs(60);
/// CAC for the ETSI weather-radar sub-band.
pub const ETSI_WEATHER_CAC_DURATION: Duration = Duration::from_secs(600);
/// Quarantine for the ETSI weather-radar sub-band.
pub const ETSI_WEATHER_NOL_DURATION: Duration = Duration::from_secs(60 * 60);

/// A reading of the wrapping millisecond tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u32);

impl Timestamp {
    /// Time elapsed from `earlier` to `self`. A wrapped tick (`earlier`
    /// numerically above `self`) is accounted for by modular subtraction.
    pub fn since(self, earlier: Timestamp) -> Duration {
        if earlier.0 > self.0 {
            debug!("Tick wrapped between {} and {}", earlier.0, self.0);
        }
        Duration::from_millis(self.0.wrapping_sub(earlier.0) as u64)
    }

    pub fn after(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.wrapping_add(duration.as_millis() as u32))
    }
}

pub trait Clock: Send {
    fn now(&self) -> Timestamp;
}

/// Milliseconds since the clock was created, truncated to 32 bits.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed().as_millis() as u32)
    }
}

/// A clock that only moves when told to. Clones share the same tick.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    tick: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(start: u32) -> Self {
        ManualClock { tick: Arc::new(AtomicU32::new(start)) }
    }

    pub fn advance(&self, by: Duration) {
        let by = by.as_millis() as u32;
        let _ = self
            .tick
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(t.wrapping_add(by)));
    }

    pub fn set(&self, tick: u32) {
        self.tick.store(tick, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.tick.load(Ordering::SeqCst))
    }
}

/// A channel sub-band with its own monitoring and quarantine durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationException {
    pub domain: RegDomain,
    pub channels: ChannelRange,
    pub cac_secs: u64,
    pub nol_secs: u64,
}

/// Monitoring and quarantine durations for a radio domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfsTiming {
    pub cac: Duration,
    pub nol: Duration,
    pub exceptions: Vec<DurationException>,
}

impl Default for DfsTiming {
    fn default() -> Self {
        DfsTiming {
            cac: DEFAULT_CAC_DURATION,
            nol: DEFAULT_NOL_DURATION,
            exceptions: vec![etsi_weather_radar()],
        }
    }
}

pub fn etsi_weather_radar() -> DurationException {
    DurationException {
        domain: RegDomain::Etsi,
        channels: ChannelRange { first: 120, last: 128 },
        cac_secs: ETSI_WEATHER_CAC_DURATION.as_secs(),
        nol_secs: ETSI_WEATHER_NOL_DURATION.as_secs(),
    }
}

impl DfsTiming {
    fn exception(&self, domain: RegDomain, channel: u8) -> Option<&DurationException> {
        self.exceptions
            .iter()
            .find(|e| e.domain == domain && e.channels.contains(channel))
    }

    /// The longest CAC required by any of `channels`.
    pub fn cac_duration(&self, domain: RegDomain, channels: &[u8]) -> Duration {
        channels
            .iter()
            .map(|c| {
                self.exception(domain, *c)
                    .map(|e| Duration::from_secs(e.cac_secs))
                    .unwrap_or(self.cac)
            })
            .max()
            .unwrap_or(self.cac)
    }

    pub fn nol_duration(&self, domain: RegDomain, channel: u8) -> Duration {
        self.exception(domain, channel)
            .map(|e| Duration::from_secs(e.nol_secs))
            .unwrap_or(self.nol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NolStatus {
    /// Never quarantined since the domain was loaded.
    Usable,
    /// Quarantine has run out.
    Available,
    /// Quarantined after radar; must not be transmitted on.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NolEntry {
    pub channel: u8,
    pub status: NolStatus,
    pub quarantined_at: Option<Timestamp>,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct NolStore {
    entries: Vec<NolEntry>,
}

impl NolStore {
    /// Creates one entry per radar-monitored channel of `domain`.
    pub fn new(domain: RegDomain, timing: &DfsTiming) -> Self {
        let entries = domain
            .channels()
            .into_iter()
            .filter(|c| c.dfs)
            .map(|c| NolEntry {
                channel: c.number,
                status: NolStatus::Usable,
                quarantined_at: None,
                duration: timing.nol_duration(domain, c.number),
            })
            .collect();
        NolStore { entries }
    }

    /// Creates a store tracking exactly `channels`, all with `duration`.
    pub fn with_channels(channels: &[u8], duration: Duration) -> Self {
        let entries = channels
            .iter()
            .map(|c| NolEntry {
                channel: *c,
                status: NolStatus::Usable,
                quarantined_at: None,
                duration,
            })
            .collect();
        NolStore { entries }
    }

    pub fn entries(&self) -> &[NolEntry] {
        &self.entries
    }

    /// Status of `channel`. Channels without an entry are never quarantined.
    pub fn status(&self, channel: u8) -> NolStatus {
        self.entries
            .iter()
            .find(|e| e.channel == channel)
            .map(|e| e.status)
            .unwrap_or(NolStatus::Usable)
    }

    pub fn is_unavailable(&self, channel: u8) -> bool {
        self.status(channel) == NolStatus::Unavailable
    }

    pub fn unavailable(&self) -> Vec<u8> {
        self.entries
            .iter()
            .filter(|e| e.status == NolStatus::Unavailable)
            .map(|e| e.channel)
            .collect()
    }

    /// Quarantines every listed channel that is not already quarantined.
    /// Returns the channels whose status changed.
    pub fn report_radar(&mut self, channels: &[u8], now: Timestamp) -> Vec<u8> {
        let mut changed = Vec::new();
        for channel in channels {
            match self.entries.iter_mut().find(|e| e.channel == *channel) {
                Some(entry) if entry.status != NolStatus::Unavailable => {
                    entry.status = NolStatus::Unavailable;
                    entry.quarantined_at = Some(now);
                    changed.push(*channel);
                }
                Some(_) => {}
                None => warn!("Radar reported on unmonitored channel {}", channel),
            }
        }
        if !changed.is_empty() {
            info!("Channels {:?} quarantined at tick {}", changed, now.0);
        }
        changed
    }

    /// Releases every quarantined channel whose quarantine has elapsed.
    /// Returns the released channels.
    pub fn refresh(&mut self, now: Timestamp) -> Vec<u8> {
        let mut released = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.status == NolStatus::Unavailable) {
            let Some(at) = entry.quarantined_at else {
                continue;
            };
            if now.since(at) >= entry.duration {
                entry.status = NolStatus::Available;
                entry.quarantined_at = None;
                released.push(entry.channel);
            }
        }
        if !released.is_empty() {
            info!("Channels {:?} released from quarantine", released);
        }
        released
    }

    /// Forgets every quarantine. Used when the last session of the domain
    /// closes.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.status = NolStatus::Usable;
            entry.quarantined_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn store_tracks_only_dfs_channels() {
        let nol = NolStore::new(RegDomain::Fcc, &DfsTiming::default());
        assert!(nol.entries().iter().any(|e| e.channel == 52));
        assert!(!nol.entries().iter().any(|e| e.channel == 36));
        assert_eq!(nol.status(36), NolStatus::Usable);
    }

    #[test]
    fn quarantine_holds_for_full_duration() {
        let mut nol = NolStore::new(RegDomain::Fcc, &DfsTiming::default());
        let t = Timestamp(1_000);
        assert_eq!(nol.report_radar(&[52, 56], t), vec![52, 56]);

        assert!(nol.refresh(t.after(29 * MINUTE)).is_empty());
        assert!(nol.is_unavailable(52));
        assert!(nol.refresh(t.after(DEFAULT_NOL_DURATION - Duration::from_millis(1))).is_empty());

        assert_eq!(nol.refresh(t.after(DEFAULT_NOL_DURATION)), vec![52, 56]);
        assert_eq!(nol.status(52), NolStatus::Available);
        assert_eq!(nol.entries().iter().find(|e| e.channel == 52).unwrap().quarantined_at, None);
    }

    #[test]
    fn repeated_report_keeps_original_timestamp() {
        let mut nol = NolStore::new(RegDomain::Fcc, &DfsTiming::default());
        nol.report_radar(&[100], Timestamp(10));
        assert!(nol.report_radar(&[100], Timestamp(5_000)).is_empty());
        let entry = nol.entries().iter().find(|e| e.channel == 100).unwrap();
        assert_eq!(entry.quarantined_at, Some(Timestamp(10)));
    }

    #[test]
    fn refresh_survives_tick_wraparound() {
        let mut nol = NolStore::new(RegDomain::Fcc, &DfsTiming::default());
        let t = Timestamp(u32::MAX - 1_000);
        nol.report_radar(&[60], t);

        // 10 minutes later the tick has wrapped below the report time.
        let early = t.after(10 * MINUTE);
        assert!(early.0 < t.0);
        assert!(nol.refresh(early).is_empty());
        assert!(nol.is_unavailable(60));

        assert_eq!(nol.refresh(t.after(30 * MINUTE)), vec![60]);
    }

    #[test]
    fn released_channel_is_only_requarantined_by_radar() {
        let mut nol = NolStore::new(RegDomain::Fcc, &DfsTiming::default());
        nol.report_radar(&[64], Timestamp(0));
        nol.refresh(Timestamp(0).after(DEFAULT_NOL_DURATION));
        nol.refresh(Timestamp(0).after(3 * DEFAULT_NOL_DURATION));
        assert_eq!(nol.status(64), NolStatus::Available);
        nol.report_radar(&[64], Timestamp(7));
        assert!(nol.is_unavailable(64));
    }

    #[test]
    fn etsi_weather_band_uses_longer_durations() {
        let timing = DfsTiming::default();
        assert_eq!(timing.cac_duration(RegDomain::Etsi, &[120, 124]), ETSI_WEATHER_CAC_DURATION);
        assert_eq!(timing.cac_duration(RegDomain::Etsi, &[100, 104]), DEFAULT_CAC_DURATION);
        assert_eq!(timing.cac_duration(RegDomain::Fcc, &[120]), DEFAULT_CAC_DURATION);
        assert_eq!(timing.nol_duration(RegDomain::Etsi, 124), ETSI_WEATHER_NOL_DURATION);
        assert_eq!(timing.nol_duration(RegDomain::Etsi, 100), DEFAULT_NOL_DURATION);
    }

    #[test]
    fn weather_band_quarantine_outlasts_default() {
        let mut nol = NolStore::new(RegDomain::Etsi, &DfsTiming::default());
        nol.report_radar(&[100, 124], Timestamp(0));
        assert_eq!(nol.refresh(Timestamp(0).after(DEFAULT_NOL_DURATION)), vec![100]);
        assert!(nol.is_unavailable(124));
        assert_eq!(nol.refresh(Timestamp(0).after(ETSI_WEATHER_NOL_DURATION)), vec![124]);
    }

    #[test]
    fn reset_clears_quarantine() {
        let mut nol = NolStore::new(RegDomain::Etsi, &DfsTiming::default());
        nol.report_radar(&[52], Timestamp(3));
        nol.reset();
        assert!(nol.unavailable().is_empty());
    }
}
