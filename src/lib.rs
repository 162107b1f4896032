//! Access point control plane for DFS radios
//!
//! This library drives AP sessions on a 5 GHz radio through channel
//! selection, the radar channel availability check (CAC) and transmission,
//! and quarantines channels on which radar was reported.
//!
//! # Modules
//!
//! - [`channel`] - Regulatory channel tables, bonding groups and the channel inventory
//! - [`leakage`] - Adjacent-channel radar leakage matrix
//! - [`nol`] - Non-occupancy list and DFS durations
//! - [`timer`] - One-shot timeouts over a pluggable scheduler
//! - [`compliance`] - The shared CAC timer of a radio domain
//! - [`registry`] - Lookup table of sibling AP sessions
//! - [`selection`] - Channel selection with bandwidth fallback
//! - [`session`] - The AP session state machine
//! - [`controller`] - Single-consumer event loop owning every session
//! - [`driver`] - Simulated driver, scan engine and virtual-time simulation
//! - [`server`] - HTTP control API
//!
//! # Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use dfs_ap::{DomainPolicy, DriverConfig, Event, Message, SessionId, Simulation, StartParams};
//!
//! let mut sim = Simulation::new(DomainPolicy::default(), DriverConfig::default(), 7);
//! sim.send(Message::Session(SessionId(1), Event::StartRequest(StartParams::default())))
//!     .expect("start");
//! sim.advance(Duration::from_secs(60)).expect("advance");
//! println!("{:?}", sim.status().sessions);
//! ```

/// Regulatory domains, channels and bonding groups.
pub mod channel;

/// Administrator configuration stored as TOML.
pub mod config;

pub mod compliance;

/// Single-consumer event loop and its tokio runtime glue.
pub mod controller;

/// Shared per-radio context lent to session transitions.
pub mod domain;

pub mod driver;

/// Error type for the library, built on `thiserror`.
pub mod error;

/// Inbound events, outbound requests and host notifications.
pub mod event;

pub mod leakage;

pub mod nol;

pub mod registry;

pub mod selection;

pub mod server;

pub mod session;

pub mod timer;

pub use channel::{Bandwidth, Channel, ChannelInventory, ChannelRange, Location, RegDomain};

pub use controller::{spawn, Controller, ControllerHandle, Runtime};

pub use domain::{DomainPolicy, DomainStatus, RadioDomain};

pub use driver::{DriverConfig, SimulatedDriver, Simulation};

pub use error::DfsError;

pub use event::{Event, FailureReason, HostEvent, Message, Notification, Request, StartParams};

pub use nol::{NolStatus, NolStore, Timestamp};

pub use registry::{SessionId, StateName};

pub use selection::{Constraints, Selection, SelectionEngine};
