//! The AP session state machine.
//!
//! `Disconnected -> ChannelSelect -> [DfsWait] -> Starting -> Started ->
//! Disconnecting -> Disconnected`, with a radar detection before
//! transmission looping back through `Disconnecting` and `Starting` on a
//! new channel.
//!
//! Every (state, event) pair is one match arm. Pairs that are not part of
//! the lifecycle return the state unchanged and touch nothing in the domain.

use tracing::{debug, error, info, warn};

use crate::channel::Bandwidth;
use crate::compliance::StartOutcome;
use crate::domain::RadioDomain;
use crate::event::{Event, FailureReason, Notification, Request, StartParams};
use crate::nol::Timestamp;
use crate::registry::{SessionId, StateName};
use crate::selection::Selection;
use crate::timer::Scheduler;

/// What to do once the hardware confirms it has stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closing {
    /// Host asked to stop (or the AP lost its channel): report stop.
    Stop,
    /// The start never completed: report start failure.
    Fail(FailureReason),
    /// Come back up on a new channel.
    Restart(Selection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Disconnected,
    ChannelSelect {
        params: StartParams,
    },
    Starting {
        params: StartParams,
        selection: Selection,
        retried: bool,
    },
    DfsWait {
        params: StartParams,
        selection: Selection,
    },
    Started {
        params: StartParams,
        selection: Selection,
        pending_switch: Option<Selection>,
    },
    Disconnecting {
        params: StartParams,
        closing: Closing,
    },
}

impl State {
    pub fn name(&self) -> StateName {
        match self {
            State::Disconnected => StateName::Disconnected,
            State::ChannelSelect { .. } => StateName::ChannelSelect,
            State::Starting { .. } => StateName::Starting,
            State::DfsWait { .. } => StateName::DfsWait,
            State::Started { .. } => StateName::Started,
            State::Disconnecting { .. } => StateName::Disconnecting,
        }
    }

    /// The channel the session occupies or is about to occupy.
    pub fn selection(&self) -> Option<&Selection> {
        match self {
            State::Starting { selection, .. }
            | State::DfsWait { selection, .. }
            | State::Started { selection, .. } => Some(selection),
            State::Disconnecting { closing: Closing::Restart(selection), .. } => Some(selection),
            _ => None,
        }
    }
}

/// Per-session bookkeeping carried across transitions.
#[derive(Debug)]
struct Flags {
    notified_cac_start: bool,
    notified_cac_end: bool,
}

pub struct ApSession {
    id: SessionId,
    state: Option<State>,
    flags: Flags,
}

impl ApSession {
    pub fn new(id: SessionId) -> Self {
        ApSession {
            id,
            state: Some(State::Disconnected),
            flags: Flags { notified_cac_start: false, notified_cac_end: false },
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &State {
        self.state.as_ref().expect("session state is only taken during a transition")
    }

    pub fn has_notified_compliance_start(&self) -> bool {
        self.flags.notified_cac_start
    }

    pub fn has_notified_compliance_end(&self) -> bool {
        self.flags.notified_cac_end
    }

    pub fn handle_event<S: Scheduler>(&mut self, event: Event, domain: &mut RadioDomain<S>) {
        let state = self.state.take().expect("session state is only taken during a transition");
        let before = state.name();
        let mut cx = Cx { id: self.id, domain: &mut *domain, flags: &mut self.flags };
        let after = state.on_event(event, &mut cx);
        if after.name() != before {
            info!("{}: {:?} -> {:?}", self.id, before, after.name());
        }
        if after.name() != StateName::Disconnected {
            let selection = after.selection();
            let (channel, bandwidth) = (selection.map(|s| s.channel), selection.map(|s| s.bandwidth));
            let waiting = after.name() == StateName::DfsWait;
            domain.sessions.update(self.id, |info| {
                info.state = after.name();
                info.channel = channel;
                info.bandwidth = bandwidth;
                info.needs_monitoring = waiting;
            });
        }
        self.state = Some(after);
    }
}

/// What a transition may touch.
struct Cx<'a, S> {
    id: SessionId,
    domain: &'a mut RadioDomain<S>,
    flags: &'a mut Flags,
}

impl<S: Scheduler> Cx<'_, S> {
    fn request(&self, request: Request) {
        self.domain.request(self.id, request);
    }

    fn notify(&self, notification: Notification) {
        self.domain.notify(Some(self.id), notification);
    }

    fn requested_bandwidth(&self, params: &StartParams) -> Bandwidth {
        params.bandwidth.unwrap_or(self.domain.policy.bandwidth)
    }

    fn close(&mut self) -> State {
        self.domain.session_closed(self.id);
        State::Disconnected
    }

    fn fail(&mut self, reason: FailureReason) -> State {
        self.notify(Notification::StartFailed { reason });
        self.close()
    }

    fn open(&mut self, params: StartParams, selection: Selection, retried: bool) -> State {
        self.flags.notified_cac_start = false;
        self.flags.notified_cac_end = false;
        self.request(Request::OpenHardwareSession {
            channel: selection.channel,
            bandwidth: selection.bandwidth,
        });
        State::Starting { params, selection, retried }
    }

    fn enter_wait(&mut self, params: StartParams, selection: Selection) -> State {
        if !self.flags.notified_cac_start {
            self.flags.notified_cac_start = true;
            let duration = self
                .domain
                .policy
                .timing
                .cac_duration(self.domain.policy.regulatory, &selection.members);
            self.notify(Notification::ComplianceMonitoringStarted {
                channel: selection.channel,
                duration,
            });
        }
        State::DfsWait { params, selection }
    }

    fn begin_transmit(&mut self, params: StartParams, selection: Selection) -> State {
        self.request(Request::RequestBeaconStart { channel: selection.channel });
        self.notify(Notification::StartSucceeded {
            channel: selection.channel,
            bandwidth: selection.bandwidth,
        });
        State::Started { params, selection, pending_switch: None }
    }

    /// Falls back to the configured default channel, or gives up with
    /// `reason`.
    fn start_on_default(&mut self, params: StartParams, reason: FailureReason) -> State {
        let bandwidth = self.requested_bandwidth(&params);
        match self.domain.fallback_channel(bandwidth) {
            Ok(selection) => {
                info!("{} falling back to default channel {}", self.id, selection.channel);
                self.open(params, selection, true)
            }
            Err(e) => {
                warn!("{} default channel unusable: {}", self.id, e);
                self.fail(reason)
            }
        }
    }

    fn stop_hardware(&self) {
        self.request(Request::CloseHardwareSession);
    }

    /// Closes the hardware and heads for another channel, or for a start
    /// failure with `reason` when none is left.
    fn relocate(&mut self, params: StartParams, reason: FailureReason) -> State {
        self.stop_hardware();
        let bandwidth = self.requested_bandwidth(&params);
        let closing = match self.domain.pick_channel(self.id, None, params.channels, bandwidth, true) {
            Ok(target) => Closing::Restart(target),
            Err(e) => {
                warn!("{} no channel to move to: {}", self.id, e);
                self.notify(Notification::NoChannelAvailable);
                Closing::Fail(reason)
            }
        };
        State::Disconnecting { params, closing }
    }

    fn radar_before_start(&mut self, params: StartParams, channels: Vec<u8>, at: Timestamp) -> State {
        self.domain.report_radar(&channels, at);
        self.notify(Notification::RadarDetected { channels });
        self.relocate(params, FailureReason::RadarDetected)
    }

    /// Abandons a start the host cancelled. The start ends with
    /// `StartFailed(Cancelled)`; the stop ends with `StopSucceeded` once no
    /// hardware is left open.
    fn cancel_start(&mut self, params: StartParams, hardware_open: bool) -> State {
        self.notify(Notification::StartFailed { reason: FailureReason::Cancelled });
        if hardware_open {
            self.stop_hardware();
            State::Disconnecting { params, closing: Closing::Stop }
        } else {
            self.notify(Notification::StopSucceeded);
            self.close()
        }
    }
}

fn affected(selection: &Selection, channels: &[u8]) -> bool {
    selection.members.iter().any(|m| channels.contains(m))
}

impl State {
    fn on_event<S: Scheduler>(self, event: Event, cx: &mut Cx<'_, S>) -> State {
        match self {
            State::Disconnected => match event {
                Event::StartRequest(params) => {
                    cx.domain.sessions.register(cx.id);
                    if let Some(selection) = cx.domain.joinable_wait(cx.id, params.channels) {
                        info!("{} joins the CAC in progress on channel {}", cx.id, selection.channel);
                        return cx.open(params, selection, false);
                    }
                    let range = cx.domain.scan_range(params.channels);
                    cx.request(Request::IssueScan { range });
                    State::ChannelSelect { params }
                }
                other => {
                    debug!("{} ignoring {:?} while disconnected", cx.id, other);
                    State::Disconnected
                }
            },

            State::ChannelSelect { params } => match event {
                Event::ScanComplete(scanned) => {
                    let bandwidth = cx.requested_bandwidth(&params);
                    match cx.domain.pick_channel(cx.id, Some(&scanned), params.channels, bandwidth, true) {
                        Ok(selection) => cx.open(params, selection, false),
                        Err(e) => {
                            warn!("{} channel selection failed: {}", cx.id, e);
                            cx.notify(Notification::NoChannelAvailable);
                            cx.start_on_default(params, FailureReason::NoChannelAvailable)
                        }
                    }
                }
                Event::ScanFailed => {
                    warn!("{} scan failed", cx.id);
                    cx.start_on_default(params, FailureReason::NoChannelAvailable)
                }
                Event::StopRequest => cx.cancel_start(params, false),
                _ => State::ChannelSelect { params },
            },

            State::Starting { params, selection, retried } => match event {
                Event::HardwareStartConfirmed => {
                    let selection = match cx.domain.revalidate(&selection) {
                        Ok(selection) => selection,
                        Err(e) => {
                            warn!("{} channel {} lost before start: {}", cx.id, selection.channel, e);
                            return cx.relocate(params, FailureReason::NoChannelAvailable);
                        }
                    };
                    let satisfied = cx.domain.sessions.sibling_started_on(cx.id, selection.channel);
                    if !cx.domain.needs_monitoring(&selection) || satisfied {
                        return cx.begin_transmit(params, selection);
                    }
                    match cx.domain.start_cac(&selection) {
                        StartOutcome::Started | StartOutcome::Joined => {
                            cx.enter_wait(params, selection)
                        }
                        StartOutcome::Busy { channel } => {
                            info!("{} moving to channel {} where CAC already runs", cx.id, channel);
                            cx.stop_hardware();
                            let closing = match cx.domain.check_channel(channel, selection.bandwidth) {
                                Ok(target) if cx.domain.permits(params.channels, &target) => {
                                    Closing::Restart(target)
                                }
                                _ => Closing::Fail(FailureReason::NoChannelAvailable),
                            };
                            State::Disconnecting { params, closing }
                        }
                    }
                }
                Event::RadarDetected { channels, at } if affected(&selection, &channels) => {
                    warn!("{} radar on {:?} while starting", cx.id, channels);
                    cx.radar_before_start(params, channels, at)
                }
                Event::HardwareStartFailed => {
                    error!("{} hardware failed to start on channel {}", cx.id, selection.channel);
                    let default = cx.domain.policy.default_channel;
                    if !retried && default != selection.channel {
                        cx.start_on_default(params, FailureReason::HardwareStartFailed)
                    } else {
                        cx.fail(FailureReason::HardwareStartFailed)
                    }
                }
                Event::StopRequest => cx.cancel_start(params, true),
                _ => State::Starting { params, selection, retried },
            },

            State::DfsWait { params, selection } => match event {
                Event::ComplianceTimerExpired { channel } if channel == selection.channel => {
                    cx.domain.sessions.update(cx.id, |s| s.needs_monitoring = false);
                    if let Err(e) = cx.domain.revalidate(&selection) {
                        warn!("{} CAC on {} ended on a lost channel: {}", cx.id, channel, e);
                        cx.domain.release_monitoring(cx.id);
                        return cx.relocate(params, FailureReason::RadarDetected);
                    }
                    if !cx.flags.notified_cac_end {
                        cx.flags.notified_cac_end = true;
                        cx.notify(Notification::ComplianceMonitoringEnded { channel });
                    }
                    cx.begin_transmit(params, selection)
                }
                Event::RadarDetected { channels, at } if affected(&selection, &channels) => {
                    warn!("{} radar on {:?} during CAC", cx.id, channels);
                    cx.domain.release_monitoring(cx.id);
                    cx.radar_before_start(params, channels, at)
                }
                Event::StopRequest => {
                    cx.domain.release_monitoring(cx.id);
                    cx.cancel_start(params, true)
                }
                _ => State::DfsWait { params, selection },
            },

            State::Started { params, selection, pending_switch } => match event {
                Event::StopRequest => {
                    cx.stop_hardware();
                    State::Disconnecting { params, closing: Closing::Stop }
                }
                Event::RadarDetected { channels, at }
                    if affected(&selection, &channels)
                        || pending_switch.as_ref().map(|p| affected(p, &channels)).unwrap_or(false) =>
                {
                    warn!("{} radar on {:?} while started", cx.id, channels);
                    cx.domain.report_radar(&channels, at);
                    cx.notify(Notification::RadarDetected { channels });
                    let bandwidth = cx.requested_bandwidth(&params);
                    match cx.domain.pick_channel(cx.id, None, params.channels, bandwidth, false) {
                        Ok(target) => {
                            cx.request(Request::RequestChannelSwitch {
                                channel: target.channel,
                                bandwidth: target.bandwidth,
                            });
                            State::Started { params, selection, pending_switch: Some(target) }
                        }
                        Err(_) => {
                            cx.notify(Notification::NoChannelAvailable);
                            cx.stop_hardware();
                            State::Disconnecting { params, closing: Closing::Stop }
                        }
                    }
                }
                Event::ChannelSwitchComplete => match pending_switch {
                    Some(target) => {
                        cx.notify(Notification::ChannelChanged {
                            channel: target.channel,
                            bandwidth: target.bandwidth,
                        });
                        State::Started { params, selection: target, pending_switch: None }
                    }
                    None => State::Started { params, selection, pending_switch },
                },
                _ => State::Started { params, selection, pending_switch },
            },

            State::Disconnecting { params, closing } => match event {
                Event::HardwareStopConfirmed => match closing {
                    Closing::Stop => {
                        cx.notify(Notification::StopSucceeded);
                        cx.close()
                    }
                    Closing::Fail(reason) => cx.fail(reason),
                    Closing::Restart(target) => {
                        let target = match cx.domain.revalidate(&target) {
                            Ok(target) => target,
                            Err(e) => {
                                warn!("{} restart channel no longer usable: {}", cx.id, e);
                                let bandwidth = cx.requested_bandwidth(&params);
                                match cx.domain.pick_channel(cx.id, None, params.channels, bandwidth, true) {
                                    Ok(target) => target,
                                    Err(_) => {
                                        cx.notify(Notification::NoChannelAvailable);
                                        return cx.fail(FailureReason::NoChannelAvailable);
                                    }
                                }
                            }
                        };
                        cx.notify(Notification::ChannelChanged {
                            channel: target.channel,
                            bandwidth: target.bandwidth,
                        });
                        cx.open(params, target, false)
                    }
                },
                _ => State::Disconnecting { params, closing },
            },
        }
    }
}
