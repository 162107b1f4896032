//! Channel selection.
//!
//! Narrows a [`ChannelInventory`] against the NOL, the leakage matrix,
//! administrator constraints and channels held by other radios, then picks
//! an operating channel at the widest bandwidth that still has a fully
//! usable bonding group. Each failed width falls back one step
//! (80 -> 40 -> 20 MHz); exhausting 20 MHz yields
//! [`DfsError::NoChannelAvailable`].

use rand::Rng;
use tracing::{debug, info, warn};

use crate::channel::{
    bonding_group, bonding_starts, Band, Bandwidth, Channel, ChannelInventory, ChannelRange,
    Location, RegDomain,
};
use crate::error::DfsError;
use crate::leakage::{LeakageMatrix, DEFAULT_LEAKAGE_THRESHOLD};
use crate::nol::NolStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub range: Option<ChannelRange>,
    pub excluded: Vec<ChannelRange>,
    pub location: Location,
    pub leakage_threshold: u16,
    /// Channels (and widths) other radios on the device operate on.
    pub concurrent: Vec<(u8, Bandwidth)>,
    pub prefer_non_dfs: bool,
    /// When false, channels that would need a CAC are rejected.
    pub allow_monitored: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            range: None,
            excluded: Vec::new(),
            location: Location::Any,
            leakage_threshold: DEFAULT_LEAKAGE_THRESHOLD,
            concurrent: Vec::new(),
            prefer_non_dfs: true,
            allow_monitored: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Primary channel.
    pub channel: u8,
    pub bandwidth: Bandwidth,
    /// Bonded 20 MHz sub-channels, primary included.
    pub members: Vec<u8>,
    pub requires_monitoring: bool,
}

pub struct SelectionEngine<'a> {
    domain: RegDomain,
    leakage: &'a LeakageMatrix,
}

impl<'a> SelectionEngine<'a> {
    pub fn new(domain: RegDomain, leakage: &'a LeakageMatrix) -> Self {
        SelectionEngine { domain, leakage }
    }

    pub fn select<R: Rng>(
        &self,
        inventory: &ChannelInventory,
        nol: &NolStore,
        constraints: &Constraints,
        requested: Bandwidth,
        rng: &mut R,
    ) -> Result<Selection, DfsError> {
        let mut bandwidth = requested;
        loop {
            let mut pass = inventory.clone();
            self.filter(&mut pass, nol, constraints, bandwidth);
            let sets = candidate_sets(&pass, bandwidth);
            debug!("{} candidate sets at {}", sets.len(), bandwidth);

            if !sets.is_empty() {
                return Ok(self.choose(sets, bandwidth, constraints, rng));
            }
            match bandwidth.fallback() {
                Some(narrower) => {
                    info!("No channel at {}, falling back to {}", bandwidth, narrower);
                    bandwidth = narrower;
                }
                None => {
                    warn!("No channel survives filtering at any bandwidth");
                    return Err(DfsError::NoChannelAvailable);
                }
            }
        }
    }

    /// Validates an explicitly chosen channel, narrowing the bandwidth when
    /// the channel cannot be bonded at the requested width. A quarantined
    /// member is always rejected.
    pub fn check(
        &self,
        channel: u8,
        requested: Bandwidth,
        nol: &NolStore,
    ) -> Result<Selection, DfsError> {
        if self.domain.channel(channel).is_none() {
            return Err(DfsError::UnsupportedChannel(channel));
        }
        let mut bandwidth = requested;
        let members = loop {
            match bonding_group(channel, bandwidth) {
                Some(members) if members.iter().all(|m| self.domain.channel(*m).is_some()) => {
                    break members;
                }
                _ => match bandwidth.fallback() {
                    Some(narrower) => bandwidth = narrower,
                    None => break vec![channel],
                },
            }
        };
        if let Some(blocked) = members.iter().find(|m| nol.is_unavailable(**m)) {
            warn!("Refusing quarantined channel {}", blocked);
            return Err(DfsError::ChannelQuarantined(*blocked));
        }
        Ok(Selection {
            channel,
            bandwidth,
            requires_monitoring: self.domain.requires_monitoring(channel, bandwidth),
            members,
        })
    }

    fn filter(
        &self,
        inventory: &mut ChannelInventory,
        nol: &NolStore,
        constraints: &Constraints,
        bandwidth: Bandwidth,
    ) {
        let quarantined = nol.unavailable();
        let dropped = inventory.invalidate(|c| {
            out_of_range(c, constraints)
                || (constraints.location == Location::Outdoor && c.indoor_only)
                || (!constraints.allow_monitored && c.dfs)
                || nol.is_unavailable(c.number)
                || quarantined.iter().any(|victim| {
                    self.leakage.exceeds(bandwidth, *victim, c.number, constraints.leakage_threshold)
                })
                || constraints
                    .concurrent
                    .iter()
                    .any(|(other, width)| overlaps(c, *other, *width))
        });
        debug!("Filtered {} channels at {}", dropped, bandwidth);
    }

    fn choose<R: Rng>(
        &self,
        sets: Vec<Vec<&Channel>>,
        bandwidth: Bandwidth,
        constraints: &Constraints,
        rng: &mut R,
    ) -> Selection {
        let clean: Vec<&Vec<&Channel>> =
            sets.iter().filter(|set| set.iter().all(|c| !c.dfs)).collect();
        let pool: Vec<&Vec<&Channel>> = if constraints.prefer_non_dfs && !clean.is_empty() {
            clean
        } else {
            sets.iter().collect()
        };
        // `sets` is non-empty, so `pool` is too.
        let set = pool[rng.gen_range(0..pool.len())];
        let primary = set[rng.gen_range(0..set.len())];
        let members: Vec<u8> = set.iter().map(|c| c.number).collect();
        let selection = Selection {
            channel: primary.number,
            bandwidth,
            requires_monitoring: set.iter().any(|c| c.dfs),
            members,
        };
        info!(
            "Selected channel {} at {} (members {:?})",
            selection.channel, selection.bandwidth, selection.members
        );
        selection
    }
}

fn out_of_range(channel: &Channel, constraints: &Constraints) -> bool {
    let outside = constraints
        .range
        .map(|r| !r.contains(channel.number))
        .unwrap_or(false);
    outside || constraints.excluded.iter().any(|r| r.contains(channel.number))
}

/// Whether `channel` overlaps a radio operating on `other` at `width`.
fn overlaps(channel: &Channel, other: u8, width: Bandwidth) -> bool {
    if channel.band != Band::of(other) {
        return false;
    }
    match channel.band {
        // 2.4 GHz channels are 5 MHz apart and 20 MHz wide.
        Band::Ghz2_4 => channel.number.abs_diff(other) < 5,
        Band::Ghz5 => bonding_group(other, width)
            .unwrap_or_else(|| vec![other])
            .contains(&channel.number),
    }
}

/// Groups the surviving channels into bonding sets at `bandwidth`. A set is
/// kept only when every member survived.
fn candidate_sets(inventory: &ChannelInventory, bandwidth: Bandwidth) -> Vec<Vec<&Channel>> {
    match bonding_starts(bandwidth) {
        None => inventory.valid_channels().map(|c| vec![c]).collect(),
        Some(starts) => starts
            .iter()
            .filter_map(|start| {
                let members = bonding_group(*start, bandwidth)?;
                members
                    .iter()
                    .map(|m| inventory.get(*m).filter(|e| e.valid).map(|e| &e.channel))
                    .collect::<Option<Vec<_>>>()
            })
            .collect(),
    }
}
