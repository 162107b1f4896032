//! Channels, regulatory domains and bonding groups.
//!
//! A regulatory domain is a static table of the 20 MHz channels it allows,
//! each tagged with whether radar monitoring (DFS) is mandatory on it and
//! whether it is restricted to indoor operation. Wider operating channels are
//! formed by bonding adjacent 20 MHz channels starting at fixed group starts.
//!
//! The [`ChannelInventory`] is the per-selection-pass working copy of that
//! table. It is rebuilt for every pass, narrowed by the selection engine, and
//! thrown away afterwards.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::DfsError;

/// Start channels of the 40 MHz bonding groups in the 5 GHz band.
const BONDING_STARTS_40: [u8; 12] = [36, 44, 52, 60, 100, 108, 116, 124, 132, 140, 149, 157];

/// Start channels of the 80 MHz bonding groups in the 5 GHz band.
const BONDING_STARTS_80: [u8; 6] = [36, 52, 100, 116, 132, 149];

/// Spacing between adjacent 20 MHz channel numbers in the 5 GHz band.
pub const CHANNEL_STEP: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    Ghz2_4,
    Ghz5,
}

impl Band {
    pub fn of(channel: u8) -> Band {
        if channel <= 14 { Band::Ghz2_4 } else { Band::Ghz5 }
    }
}

/// Operating bandwidth (bonding mode).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
pub enum Bandwidth {
    #[serde(rename = "20")]
    #[value(name = "20")]
    Mhz20,
    #[serde(rename = "40")]
    #[value(name = "40")]
    Mhz40,
    #[serde(rename = "80")]
    #[value(name = "80")]
    Mhz80,
}

impl Bandwidth {
    pub fn mhz(self) -> u16 {
        match self {
            Bandwidth::Mhz20 => 20,
            Bandwidth::Mhz40 => 40,
            Bandwidth::Mhz80 => 80,
        }
    }

    /// Number of 20 MHz sub-channels bonded together in this mode.
    pub fn span_len(self) -> usize {
        match self {
            Bandwidth::Mhz20 => 1,
            Bandwidth::Mhz40 => 2,
            Bandwidth::Mhz80 => 4,
        }
    }

    /// The next narrower mode, or `None` at 20 MHz.
    pub fn fallback(self) -> Option<Bandwidth> {
        match self {
            Bandwidth::Mhz80 => Some(Bandwidth::Mhz40),
            Bandwidth::Mhz40 => Some(Bandwidth::Mhz20),
            Bandwidth::Mhz20 => None,
        }
    }
}

impl Default for Bandwidth {
    fn default() -> Self {
        Bandwidth::Mhz80
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz", self.mhz())
    }
}

/// Where the access point is deployed. Some domains allow certain channels
/// indoors only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    #[default]
    Any,
    Indoor,
    Outdoor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RegDomain {
    #[default]
    #[value(name = "fcc")]
    Fcc,
    #[value(name = "etsi")]
    Etsi,
    #[value(name = "mkk")]
    Mkk,
    #[value(name = "world")]
    World,
}

impl fmt::Display for RegDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegDomain::Fcc => "FCC",
            RegDomain::Etsi => "ETSI",
            RegDomain::Mkk => "MKK",
            RegDomain::World => "World",
        };
        f.write_str(name)
    }
}

/// A contiguous block of channels as allowed by a regulatory domain.
struct Rule {
    first: u8,
    last: u8,
    dfs: bool,
    indoor_only: bool,
}

const fn rule(first: u8, last: u8, dfs: bool, indoor_only: bool) -> Rule {
    Rule { first, last, dfs, indoor_only }
}

const FCC_RULES: &[Rule] = &[
    rule(1, 11, false, false),
    rule(36, 48, false, false),
    rule(52, 64, true, false),
    rule(100, 144, true, false),
    rule(149, 165, false, false),
];

const ETSI_RULES: &[Rule] = &[
    rule(1, 13, false, false),
    rule(36, 48, false, true),
    rule(52, 64, true, true),
    rule(100, 140, true, false),
];

const MKK_RULES: &[Rule] = &[
    rule(1, 13, false, false),
    rule(36, 48, false, true),
    rule(52, 64, true, true),
    rule(100, 140, true, false),
];

const WORLD_RULES: &[Rule] = &[rule(1, 11, false, false), rule(36, 48, false, true)];

impl RegDomain {
    fn rules(self) -> &'static [Rule] {
        match self {
            RegDomain::Fcc => FCC_RULES,
            RegDomain::Etsi => ETSI_RULES,
            RegDomain::Mkk => MKK_RULES,
            RegDomain::World => WORLD_RULES,
        }
    }

    /// All channels legal in this domain, in ascending order.
    pub fn channels(self) -> Vec<Channel> {
        let mut channels = Vec::new();
        for rule in self.rules() {
            let step = if Band::of(rule.first) == Band::Ghz2_4 { 1 } else { CHANNEL_STEP };
            let mut number = rule.first;
            while number <= rule.last {
                channels.push(Channel {
                    number,
                    band: Band::of(number),
                    dfs: rule.dfs,
                    indoor_only: rule.indoor_only,
                });
                number += step;
            }
        }
        channels
    }

    pub fn channel(self, number: u8) -> Option<Channel> {
        self.channels().into_iter().find(|c| c.number == number)
    }

    /// Whether operating on `number` at `bandwidth` needs a CAC in this
    /// domain. True as soon as any bonded sub-channel is a DFS channel.
    pub fn requires_monitoring(self, number: u8, bandwidth: Bandwidth) -> bool {
        let members = bonding_group(number, bandwidth).unwrap_or_else(|| vec![number]);
        members
            .iter()
            .any(|m| self.channel(*m).map(|c| c.dfs).unwrap_or(false))
    }

    /// Whether the domain has a 5 GHz allocation at all.
    pub fn has_5ghz(self) -> bool {
        self.rules().iter().any(|r| Band::of(r.first) == Band::Ghz5)
    }
}

/// A single 20 MHz channel under a regulatory domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub number: u8,
    pub band: Band,
    /// Radar monitoring is mandatory before and during transmission.
    pub dfs: bool,
    pub indoor_only: bool,
}

impl Channel {
    pub fn frequency_mhz(&self) -> u16 {
        match self.band {
            Band::Ghz2_4 => 2407 + 5 * self.number as u16,
            Band::Ghz5 => 5000 + 5 * self.number as u16,
        }
    }
}

/// Members of the bonding group that `channel` belongs to at `bandwidth`.
///
/// Returns `None` when the channel cannot be bonded at that width (any 2.4 GHz
/// channel above 20 MHz, or a 5 GHz channel outside every group).
pub fn bonding_group(channel: u8, bandwidth: Bandwidth) -> Option<Vec<u8>> {
    let starts: &[u8] = match bandwidth {
        Bandwidth::Mhz20 => return Some(vec![channel]),
        Bandwidth::Mhz40 => &BONDING_STARTS_40,
        Bandwidth::Mhz80 => &BONDING_STARTS_80,
    };
    if Band::of(channel) != Band::Ghz5 {
        return None;
    }
    let width = CHANNEL_STEP as usize * bandwidth.span_len();
    starts
        .iter()
        .find(|start| channel >= **start && (channel as usize) < **start as usize + width)
        .map(|start| {
            (0..bandwidth.span_len())
                .map(|i| start + CHANNEL_STEP * i as u8)
                .collect()
        })
}

/// Start channels of every bonding group at `bandwidth`, or `None` for 20 MHz.
pub fn bonding_starts(bandwidth: Bandwidth) -> Option<&'static [u8]> {
    match bandwidth {
        Bandwidth::Mhz20 => None,
        Bandwidth::Mhz40 => Some(&BONDING_STARTS_40),
        Bandwidth::Mhz80 => Some(&BONDING_STARTS_80),
    }
}

/// Inclusive range of channel numbers, as configured by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub first: u8,
    pub last: u8,
}

impl ChannelRange {
    pub fn new(first: u8, last: u8) -> Result<Self, DfsError> {
        if first > last || first == 0 {
            return Err(DfsError::InvalidRange { first, last });
        }
        Ok(ChannelRange { first, last })
    }

    pub fn contains(&self, channel: u8) -> bool {
        (self.first..=self.last).contains(&channel)
    }
}

impl fmt::Display for ChannelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryEntry {
    pub channel: Channel,
    pub valid: bool,
}

/// The channel list for one selection pass.
#[derive(Debug, Clone)]
pub struct ChannelInventory {
    entries: Vec<InventoryEntry>,
}

impl ChannelInventory {
    /// Builds the inventory for `domain`. When `scanned` is given, only the
    /// channels the scan covered start out valid.
    pub fn new(domain: RegDomain, scanned: Option<&[u8]>) -> Self {
        let entries = domain
            .channels()
            .into_iter()
            .map(|channel| InventoryEntry {
                channel,
                valid: scanned.map(|s| s.contains(&channel.number)).unwrap_or(true),
            })
            .collect();
        ChannelInventory { entries }
    }

    pub fn entries(&self) -> &[InventoryEntry] {
        &self.entries
    }

    pub fn get(&self, number: u8) -> Option<&InventoryEntry> {
        self.entries.iter().find(|e| e.channel.number == number)
    }

    pub fn is_valid(&self, number: u8) -> bool {
        self.get(number).map(|e| e.valid).unwrap_or(false)
    }

    /// Marks every entry matching `reject` as invalid. Returns how many
    /// entries were newly invalidated.
    pub fn invalidate<F>(&mut self, mut reject: F) -> usize
    where
        F: FnMut(&Channel) -> bool,
    {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|e| e.valid) {
            if reject(&entry.channel) {
                entry.valid = false;
                count += 1;
            }
        }
        count
    }

    pub fn valid_channels(&self) -> impl Iterator<Item = &Channel> + '_ {
        self.entries.iter().filter(|e| e.valid).map(|e| &e.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcc_table_marks_dfs_channels() {
        let channels = RegDomain::Fcc.channels();
        let ch36 = channels.iter().find(|c| c.number == 36).unwrap();
        let ch52 = channels.iter().find(|c| c.number == 52).unwrap();
        assert!(!ch36.dfs);
        assert!(ch52.dfs);
        assert_eq!(ch52.frequency_mhz(), 5260);
        assert!(channels.iter().any(|c| c.number == 165));
        assert!(!channels.iter().any(|c| c.number == 12));
    }

    #[test]
    fn bonding_groups_follow_fixed_starts() {
        assert_eq!(bonding_group(40, Bandwidth::Mhz40), Some(vec![36, 40]));
        assert_eq!(bonding_group(48, Bandwidth::Mhz40), Some(vec![44, 48]));
        assert_eq!(bonding_group(60, Bandwidth::Mhz80), Some(vec![52, 56, 60, 64]));
        assert_eq!(bonding_group(144, Bandwidth::Mhz40), Some(vec![140, 144]));
        assert_eq!(bonding_group(165, Bandwidth::Mhz40), None);
        assert_eq!(bonding_group(6, Bandwidth::Mhz40), None);
        assert_eq!(bonding_group(6, Bandwidth::Mhz20), Some(vec![6]));
    }

    #[test]
    fn monitoring_requirement_spans_bonded_members() {
        assert!(!RegDomain::Fcc.requires_monitoring(48, Bandwidth::Mhz80));
        assert!(RegDomain::Fcc.requires_monitoring(52, Bandwidth::Mhz20));
        assert!(!RegDomain::Fcc.requires_monitoring(149, Bandwidth::Mhz80));
    }

    #[test]
    fn bandwidth_fallback_stops_at_20() {
        assert_eq!(Bandwidth::Mhz80.fallback(), Some(Bandwidth::Mhz40));
        assert_eq!(Bandwidth::Mhz40.fallback(), Some(Bandwidth::Mhz20));
        assert_eq!(Bandwidth::Mhz20.fallback(), None);
    }

    #[test]
    fn inventory_respects_scan_list() {
        let mut inv = ChannelInventory::new(RegDomain::Fcc, Some(&[36, 40]));
        assert!(inv.is_valid(36));
        assert!(!inv.is_valid(44));
        assert_eq!(inv.invalidate(|c| c.number == 36), 1);
        assert_eq!(inv.valid_channels().map(|c| c.number).collect::<Vec<_>>(), vec![40]);
    }

    #[test]
    fn channel_range_rejects_inverted_bounds() {
        assert!(ChannelRange::new(64, 36).is_err());
        let range = ChannelRange::new(36, 64).unwrap();
        assert!(range.contains(52));
        assert!(!range.contains(100));
    }
}
