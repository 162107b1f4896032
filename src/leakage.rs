//! Transmit leakage between channels.
//!
//! For every bonding mode and every radar-monitored "victim" channel the
//! matrix holds an ordered list of candidate transmit channels together with
//! how much energy a transmitter on that candidate bleeds into the victim.
//! Candidates whose level exceeds the configured threshold must not be used
//! while the victim is quarantined. The built-in matrix covers every 5 GHz
//! channel as a victim so that custom NOL channel sets are handled too.

use std::collections::HashMap;

use lazy_static::lazy_static;
use tracing::warn;

use crate::channel::{bonding_group, Bandwidth, CHANNEL_STEP};

/// Leakage level of a candidate whose operating span covers the victim.
pub const LEAKAGE_MAX: u16 = 999;
/// Level reported for candidates far enough away to never matter.
pub const LEAKAGE_MIN: u16 = 200;
/// Default rejection threshold.
pub const DEFAULT_LEAKAGE_THRESHOLD: u16 = 310;

/// Every 5 GHz channel number any supported domain can transmit on.
const CANDIDATES_5GHZ: [u8; 25] = [
    36, 40, 44, 48, 52, 56, 60, 64, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144,
    149, 153, 157, 161, 165,
];

/// Levels indexed by the distance, in 20 MHz steps, between the nearest
/// member of the candidate's span and the victim. Index 0 means overlap.
fn falloff(bandwidth: Bandwidth) -> &'static [u16] {
    match bandwidth {
        Bandwidth::Mhz20 => &[LEAKAGE_MAX, 300, 250],
        Bandwidth::Mhz40 => &[LEAKAGE_MAX, 400, 350, 250],
        Bandwidth::Mhz80 => &[LEAKAGE_MAX, 450, 400, 350, 300],
    }
}

lazy_static! {
    /// The leakage matrix shipped with the crate.
    pub static ref DEFAULT_LEAKAGE: LeakageMatrix = LeakageMatrix::builtin();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakageEntry {
    pub channel: u8,
    pub level: u16,
}

type VictimTable = HashMap<u8, Vec<LeakageEntry>>;

#[derive(Debug, Clone, Default)]
pub struct LeakageMatrix {
    tables: HashMap<Bandwidth, VictimTable>,
}

impl LeakageMatrix {
    fn builtin() -> Self {
        let mut matrix = LeakageMatrix::default();
        for bandwidth in [Bandwidth::Mhz20, Bandwidth::Mhz40, Bandwidth::Mhz80] {
            let levels = falloff(bandwidth);
            for victim in CANDIDATES_5GHZ {
                let rows = CANDIDATES_5GHZ
                    .iter()
                    .filter_map(|candidate| {
                        let span = bonding_group(*candidate, bandwidth)?;
                        let distance = span
                            .iter()
                            .map(|m| (*m as i16 - victim as i16).unsigned_abs() / CHANNEL_STEP as u16)
                            .min()?;
                        let level = levels.get(distance as usize).copied().unwrap_or(LEAKAGE_MIN);
                        Some(LeakageEntry { channel: *candidate, level })
                    })
                    .collect();
                matrix.insert(bandwidth, victim, rows);
            }
        }
        matrix
    }

    /// Replaces the row list for `victim` under `bandwidth`.
    pub fn insert(&mut self, bandwidth: Bandwidth, victim: u8, rows: Vec<LeakageEntry>) {
        self.tables.entry(bandwidth).or_default().insert(victim, rows);
    }

    pub fn has_table(&self, bandwidth: Bandwidth) -> bool {
        self.tables.contains_key(&bandwidth)
    }

    /// Leakage from transmitting on `candidate` into `victim`.
    ///
    /// A missing table for `bandwidth` falls back to the 20 MHz table. A
    /// victim or candidate without a row leaks [`LEAKAGE_MIN`], except the
    /// victim itself.
    pub fn level(&self, bandwidth: Bandwidth, victim: u8, candidate: u8) -> u16 {
        let table = match self.tables.get(&bandwidth) {
            Some(table) => table,
            None => {
                warn!("No leakage table for {}, using 20 MHz table", bandwidth);
                match self.tables.get(&Bandwidth::Mhz20) {
                    Some(table) => table,
                    None => return if victim == candidate { LEAKAGE_MAX } else { LEAKAGE_MIN },
                }
            }
        };
        table
            .get(&victim)
            .and_then(|rows| rows.iter().find(|r| r.channel == candidate))
            .map(|r| r.level)
            .unwrap_or(if victim == candidate { LEAKAGE_MAX } else { LEAKAGE_MIN })
    }

    pub fn exceeds(&self, bandwidth: Bandwidth, victim: u8, candidate: u8, threshold: u16) -> bool {
        self.level(bandwidth, victim, candidate) > threshold
    }
}
