use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{Bandwidth, ChannelRange, Location, RegDomain};
use crate::domain::DomainPolicy;
use crate::error::DfsError;
use crate::leakage::DEFAULT_LEAKAGE_THRESHOLD;
use crate::nol::{
    etsi_weather_radar, DfsTiming, DurationException, DEFAULT_CAC_DURATION, DEFAULT_NOL_DURATION,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub regulatory_domain: RegDomain,
    pub location: Location,
    pub channels: Option<ChannelRange>,
    pub excluded: Vec<ChannelRange>,
    pub bandwidth: Bandwidth,
    pub prefer_non_dfs: bool,
    pub leakage_threshold: u16,
    pub cac: CacConfig,
    pub nol_duration_secs: u64,
    pub duration_exceptions: Vec<DurationException>,
    /// Falls back to 36, or 6 when the domain has no 5 GHz channels.
    pub default_channel: Option<u8>,
    pub concurrent_channels: Vec<ConcurrentChannel>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            regulatory_domain: RegDomain::default(),
            location: Location::default(),
            channels: None,
            excluded: Vec::new(),
            bandwidth: Bandwidth::default(),
            prefer_non_dfs: true,
            leakage_threshold: DEFAULT_LEAKAGE_THRESHOLD,
            cac: CacConfig::default(),
            nol_duration_secs: DEFAULT_NOL_DURATION.as_secs(),
            duration_exceptions: vec![etsi_weather_radar()],
            default_channel: None,
            concurrent_channels: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CacConfig {
    /// Never wait before transmitting. Test setups only.
    pub skip: bool,
    pub duration_secs: u64,
}

impl Default for CacConfig {
    fn default() -> Self {
        CacConfig { skip: false, duration_secs: DEFAULT_CAC_DURATION.as_secs() }
    }
}

/// A channel held by another radio on the same device.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentChannel {
    pub channel: u8,
    #[serde(default)]
    pub bandwidth: Bandwidth,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn default_channel(&self) -> u8 {
        self.default_channel
            .unwrap_or(if self.regulatory_domain.has_5ghz() { 36 } else { 6 })
    }

    /// Validates the file contents and turns them into a domain policy.
    pub fn policy(&self) -> Result<DomainPolicy, DfsError> {
        for range in self.channels.iter().chain(&self.excluded) {
            ChannelRange::new(range.first, range.last)?;
        }
        for exception in &self.duration_exceptions {
            ChannelRange::new(exception.channels.first, exception.channels.last)?;
        }
        let default_channel = self.default_channel();
        if self.regulatory_domain.channel(default_channel).is_none() {
            return Err(DfsError::UnsupportedChannel(default_channel));
        }
        if self.cac.duration_secs == 0 && !self.cac.skip {
            return Err(DfsError::Config("cac.duration_secs must be positive".to_string()));
        }

        Ok(DomainPolicy {
            regulatory: self.regulatory_domain,
            location: self.location,
            channels: self.channels,
            excluded: self.excluded.clone(),
            bandwidth: self.bandwidth,
            prefer_non_dfs: self.prefer_non_dfs,
            leakage_threshold: self.leakage_threshold,
            skip_cac: self.cac.skip,
            timing: DfsTiming {
                cac: Duration::from_secs(self.cac.duration_secs),
                nol: Duration::from_secs(self.nol_duration_secs),
                exceptions: self.duration_exceptions.clone(),
            },
            default_channel,
            concurrent: self
                .concurrent_channels
                .iter()
                .map(|c| (c.channel, c.bandwidth))
                .collect(),
        })
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?;
    Ok(config_dir.join("dfs-ap").join("config.toml"))
}
