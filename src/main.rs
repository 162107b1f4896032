use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dfs_ap::{
    channel::bonding_group,
    config::{self, Config},
    controller::{self, DEFAULT_REFRESH_INTERVAL},
    leakage::DEFAULT_LEAKAGE,
    server, Bandwidth, ChannelInventory, ChannelRange, Constraints, DomainPolicy, DriverConfig,
    Event, Location, Message, NolStore, RegDomain, SelectionEngine, SessionId, SimulatedDriver,
    Simulation, StartParams, Timestamp,
};

#[derive(Parser)]
#[command(name = "dfs-ap")]
#[command(about = "Run AP sessions on DFS channels with radar quarantine and CAC handling")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the channels of a regulatory domain
    Channels {
        /// Regulatory domain (defaults to the configured one)
        #[arg(short, long)]
        domain: Option<RegDomain>,

        /// Show bonding groups for this bandwidth
        #[arg(short, long, default_value = "80")]
        bandwidth: Bandwidth,
    },

    /// Run one channel selection against the configured policy
    Select {
        /// Requested bandwidth (defaults to the configured one)
        #[arg(short, long)]
        bandwidth: Option<Bandwidth>,

        /// First channel of the allowed range
        #[arg(long)]
        first: Option<u8>,

        /// Last channel of the allowed range
        #[arg(long)]
        last: Option<u8>,

        /// Channels to treat as quarantined, comma separated
        #[arg(short, long, value_delimiter = ',')]
        quarantined: Vec<u8>,

        /// Seed for the random choice
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Run a scripted session against the simulated driver in virtual time
    Simulate {
        /// Number of AP sessions to start
        #[arg(short = 'n', long, default_value = "1")]
        sessions: u32,

        /// Requested bandwidth (defaults to the configured one)
        #[arg(short, long)]
        bandwidth: Option<Bandwidth>,

        /// Inject radar on these channels, comma separated
        #[arg(short, long, value_delimiter = ',')]
        radar: Vec<u8>,

        /// Seconds after start at which radar is injected
        #[arg(long, default_value = "30")]
        radar_at: u64,

        /// Total simulated seconds
        #[arg(short, long, default_value = "120")]
        duration: u64,

        /// Channels the simulated hardware refuses to open on
        #[arg(long, value_delimiter = ',')]
        refuse: Vec<u8>,

        /// Make every scan fail
        #[arg(long)]
        scan_fails: bool,

        /// Seed for channel selection
        #[arg(short, long, default_value = "1")]
        seed: u64,

        /// Print notifications as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP control API backed by the simulated driver
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Simulated driver latency in milliseconds
        #[arg(long, default_value = "50")]
        latency_ms: u64,
    },

    /// Write settings to the config file
    SaveConfig {
        #[arg(short, long)]
        domain: Option<RegDomain>,

        #[arg(short, long)]
        bandwidth: Option<Bandwidth>,

        #[arg(short, long)]
        location: Option<Location>,

        /// First channel of the allowed range
        #[arg(long)]
        first: Option<u8>,

        /// Last channel of the allowed range
        #[arg(long)]
        last: Option<u8>,

        /// Fallback channel when selection fails
        #[arg(long)]
        default_channel: Option<u8>,

        /// Skip the channel availability check (test setups only)
        #[arg(long)]
        skip_cac: Option<bool>,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Channels { domain, bandwidth } => cmd_channels(config_path, domain, bandwidth),
        Commands::Select {
            bandwidth,
            first,
            last,
            quarantined,
            seed,
        } => cmd_select(config_path, bandwidth, range(first, last)?, &quarantined, seed),
        Commands::Simulate {
            sessions,
            bandwidth,
            radar,
            radar_at,
            duration,
            refuse,
            scan_fails,
            seed,
            json,
        } => {
            let driver = DriverConfig {
                scan_fails,
                refuse: refuse.into_iter().collect(),
                latency: Duration::ZERO,
            };
            let script = Script { sessions, bandwidth, radar, radar_at, duration, json };
            cmd_simulate(config_path, driver, script, seed)
        }
        Commands::Serve { port, latency_ms } => cmd_serve(config_path, port, latency_ms).await,
        Commands::SaveConfig {
            domain,
            bandwidth,
            location,
            first,
            last,
            default_channel,
            skip_cac,
        } => {
            let mut cfg = load_config(config_path)?;
            if let Some(domain) = domain {
                cfg.regulatory_domain = domain;
            }
            if let Some(bandwidth) = bandwidth {
                cfg.bandwidth = bandwidth;
            }
            if let Some(location) = location {
                cfg.location = location;
            }
            if let Some(range) = range(first, last)? {
                cfg.channels = Some(range);
            }
            if default_channel.is_some() {
                cfg.default_channel = default_channel;
            }
            if let Some(skip) = skip_cac {
                cfg.cac.skip = skip;
            }
            cmd_save_config(config_path, &cfg)
        }
        Commands::ShowConfig => cmd_show_config(config_path),
    }
}

fn range(first: Option<u8>, last: Option<u8>) -> Result<Option<ChannelRange>> {
    match (first, last) {
        (None, None) => Ok(None),
        (first, last) => {
            let first = first.or(last).unwrap_or_default();
            Ok(Some(ChannelRange::new(first, last.unwrap_or(first))?))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn load_policy(path: Option<&Path>) -> Result<DomainPolicy> {
    let cfg = load_config(path)?;
    cfg.policy().context("Invalid configuration")
}

fn cmd_channels(path: Option<&Path>, domain: Option<RegDomain>, bandwidth: Bandwidth) -> Result<()> {
    let domain = match domain {
        Some(domain) => domain,
        None => load_config(path)?.regulatory_domain,
    };
    let channels = domain.channels();

    println!("Regulatory domain: {}", domain);
    println!();
    println!("{:<8} {:<10} {:<6} {:<8} {}", "CHANNEL", "FREQ", "DFS", "INDOOR", format!("GROUP @ {}", bandwidth));
    println!("{}", "-".repeat(56));

    for channel in channels {
        let group = bonding_group(channel.number, bandwidth)
            .map(|g| g.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(","))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<10} {:<6} {:<8} {}",
            channel.number,
            format!("{} MHz", channel.frequency_mhz()),
            if channel.dfs { "yes" } else { "no" },
            if channel.indoor_only { "yes" } else { "no" },
            group
        );
    }

    Ok(())
}

fn cmd_select(
    path: Option<&Path>,
    bandwidth: Option<Bandwidth>,
    range: Option<ChannelRange>,
    quarantined: &[u8],
    seed: Option<u64>,
) -> Result<()> {
    let policy = load_policy(path)?;
    let mut nol = NolStore::new(policy.regulatory, &policy.timing);
    nol.report_radar(quarantined, Timestamp(0));

    let constraints = Constraints {
        range: range.or(policy.channels),
        excluded: policy.excluded.clone(),
        location: policy.location,
        leakage_threshold: policy.leakage_threshold,
        concurrent: policy.concurrent.clone(),
        prefer_non_dfs: policy.prefer_non_dfs,
        allow_monitored: true,
    };
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or_else(rand::random));
    let inventory = ChannelInventory::new(policy.regulatory, None);
    let engine = SelectionEngine::new(policy.regulatory, &DEFAULT_LEAKAGE);
    let requested = bandwidth.unwrap_or(policy.bandwidth);

    let selection = engine.select(&inventory, &nol, &constraints, requested, &mut rng)?;
    let cac = policy.timing.cac_duration(policy.regulatory, &selection.members);

    println!("Channel:   {}", selection.channel);
    println!("Bandwidth: {}", selection.bandwidth);
    println!("Members:   {:?}", selection.members);
    if selection.requires_monitoring && !policy.skip_cac {
        println!("CAC:       {}s", cac.as_secs());
    } else {
        println!("CAC:       not required");
    }

    Ok(())
}

struct Script {
    sessions: u32,
    bandwidth: Option<Bandwidth>,
    radar: Vec<u8>,
    radar_at: u64,
    duration: u64,
    json: bool,
}

fn cmd_simulate(path: Option<&Path>, driver: DriverConfig, script: Script, seed: u64) -> Result<()> {
    let policy = load_policy(path)?;
    let mut sim = Simulation::new(policy, driver, seed);
    let params = StartParams { bandwidth: script.bandwidth, channels: None };

    for n in 1..=script.sessions {
        sim.send(Message::Session(SessionId(n), Event::StartRequest(params)))?;
    }

    let total = Duration::from_secs(script.duration);
    if !script.radar.is_empty() {
        let at = Duration::from_secs(script.radar_at).min(total);
        sim.advance(at)?;
        sim.radar(&script.radar)?;
    }
    sim.advance(total.saturating_sub(sim.elapsed()))?;

    for (at, event) in sim.drain() {
        if script.json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        let session = event.session.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:>7.1}s  {:<6} {:?}", at.as_secs_f64(), session, event.notification);
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&sim.status())?);

    Ok(())
}

async fn cmd_serve(path: Option<&Path>, port: u16, latency_ms: u64) -> Result<()> {
    let policy = load_policy(path)?;
    info!("Regulatory domain {}, bandwidth {}", policy.regulatory, policy.bandwidth);
    let driver = SimulatedDriver::new(
        policy.regulatory,
        DriverConfig { latency: Duration::from_millis(latency_ms), ..Default::default() },
    );

    let controller::Runtime { handle, requests, mut host, task } =
        controller::spawn(policy, DEFAULT_REFRESH_INTERVAL);

    tokio::spawn(driver.run(requests, handle.inbox()));
    tokio::spawn(async move {
        while let Some(event) = host.recv().await {
            let session = event.session.map(|s| s.to_string()).unwrap_or_else(|| "domain".to_string());
            info!("{}: {}", session, serde_json::to_string(&event.notification).unwrap_or_default());
        }
    });

    server::run_server(server::ServerConfig { port }, handle).await?;
    task.abort();

    Ok(())
}

fn cmd_save_config(path: Option<&Path>, cfg: &Config) -> Result<()> {
    cfg.policy().context("Refusing to save an invalid configuration")?;
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::config_path()?,
    };
    cfg.save_to(&path)?;
    println!("Saved configuration to {}", path.display());

    Ok(())
}

fn cmd_show_config(path: Option<&Path>) -> Result<()> {
    let shown = match path {
        Some(path) => path.to_path_buf(),
        None => config::config_path()?,
    };
    println!("Config file: {}", shown.display());
    println!();

    let cfg = load_config(path)?;
    let policy = cfg.policy().context("Invalid configuration")?;

    println!("{:<22} {}", "Regulatory domain", policy.regulatory);
    println!("{:<22} {:?}", "Location", policy.location);
    println!("{:<22} {}", "Bandwidth", policy.bandwidth);
    match policy.channels {
        Some(range) => println!("{:<22} {}", "Channels", range),
        None => println!("{:<22} all", "Channels"),
    }
    if !policy.excluded.is_empty() {
        let excluded: Vec<String> = policy.excluded.iter().map(|r| r.to_string()).collect();
        println!("{:<22} {}", "Excluded", excluded.join(" "));
    }
    println!("{:<22} {}", "Prefer non-DFS", policy.prefer_non_dfs);
    println!("{:<22} {}", "Leakage threshold", policy.leakage_threshold);
    if policy.skip_cac {
        println!("{:<22} skipped", "CAC");
    } else {
        println!("{:<22} {}s", "CAC", policy.timing.cac.as_secs());
    }
    println!("{:<22} {}s", "NOL", policy.timing.nol.as_secs());
    println!("{:<22} {}", "Default channel", policy.default_channel);
    for e in &policy.timing.exceptions {
        println!(
            "{:<22} {} {}: CAC {}s, NOL {}s",
            "Duration exception", e.domain, e.channels, e.cac_secs, e.nol_secs
        );
    }

    Ok(())
}
