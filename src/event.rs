//! Messages in and out of the controller.
//!
//! Everything that can change an AP session arrives as a [`Message`] on a
//! single inbox and is processed one at a time. Work for collaborators goes
//! out as [`SessionRequest`]s; lifecycle news for the host goes out as
//! [`HostEvent`]s.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::{Bandwidth, ChannelRange};
use crate::domain::DomainStatus;
use crate::nol::Timestamp;
use crate::registry::SessionId;
use crate::timer::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartParams {
    pub bandwidth: Option<Bandwidth>,
    /// Overrides the administrator channel range for this session.
    pub channels: Option<ChannelRange>,
}

/// Inbound events for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StartRequest(StartParams),
    StopRequest,
    /// Channels the scan engine covered.
    ScanComplete(Vec<u8>),
    ScanFailed,
    HardwareStartConfirmed,
    HardwareStartFailed,
    HardwareStopConfirmed,
    ChannelSwitchComplete,
    RadarDetected { channels: Vec<u8>, at: Timestamp },
    ComplianceTimerExpired { channel: u8 },
}

/// Everything the controller inbox accepts.
#[derive(Debug)]
pub enum Message {
    Session(SessionId, Event),
    /// Radar seen by the radio; fanned out to every session. Without a
    /// timestamp the controller clock is read on arrival.
    Radar { channels: Vec<u8>, at: Option<Timestamp> },
    TimerFired(EventId),
    RefreshNol,
    Status(oneshot::Sender<DomainStatus>),
    Shutdown,
}

/// Work requested from the driver or scan engine on behalf of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    IssueScan { range: ChannelRange },
    OpenHardwareSession { channel: u8, bandwidth: Bandwidth },
    CloseHardwareSession,
    RequestChannelSwitch { channel: u8, bandwidth: Bandwidth },
    RequestBeaconStart { channel: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub session: SessionId,
    pub request: Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HardwareStartFailed,
    NoChannelAvailable,
    Cancelled,
    RadarDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    StartSucceeded { channel: u8, bandwidth: Bandwidth },
    StartFailed { reason: FailureReason },
    StopSucceeded,
    ComplianceMonitoringStarted { channel: u8, duration: Duration },
    ComplianceMonitoringEnded { channel: u8 },
    RadarDetected { channels: Vec<u8> },
    NoChannelAvailable,
    ChannelChanged { channel: u8, bandwidth: Bandwidth },
    /// The quarantined channel set changed.
    NolChanged { unavailable: Vec<u8> },
}

impl Notification {
    /// Whether this notification finishes a host start or stop operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notification::StartSucceeded { .. }
                | Notification::StartFailed { .. }
                | Notification::StopSucceeded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEvent {
    /// `None` for domain-wide notifications.
    pub session: Option<SessionId>,
    pub notification: Notification,
}

pub struct UnboundedSink<T> {
    sink: mpsc::UnboundedSender<T>,
}

impl<T: std::fmt::Debug> UnboundedSink<T> {
    pub fn new(sink: mpsc::UnboundedSender<T>) -> Self {
        UnboundedSink { sink }
    }

    pub fn send(&self, msg: T) {
        // A departed receiver does not stop the state machine.
        if let Err(e) = self.sink.send(msg) {
            debug!("Dropping message for closed receiver: {:?}", e.0);
        }
    }
}

impl<T> Clone for UnboundedSink<T> {
    fn clone(&self) -> Self {
        UnboundedSink { sink: self.sink.clone() }
    }
}

pub type RequestSink = UnboundedSink<SessionRequest>;
pub type HostSink = UnboundedSink<HostEvent>;
pub type RequestStream = mpsc::UnboundedReceiver<SessionRequest>;
pub type HostStream = mpsc::UnboundedReceiver<HostEvent>;

/// Creates the two outbound channels the controller writes to.
pub fn outbound() -> (RequestSink, RequestStream, HostSink, HostStream) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    (UnboundedSink::new(req_tx), req_rx, UnboundedSink::new(host_tx), host_rx)
}
