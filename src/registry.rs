//! Lookup table of the AP sessions sharing one radio domain.
//!
//! The registry does not own sessions. It mirrors the few facts other
//! sessions need to see (state, channel, whether the session is waiting on
//! the compliance timer) so domain-wide resources are released only when no
//! sibling depends on them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::Bandwidth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ap{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateName {
    Disconnected,
    ChannelSelect,
    DfsWait,
    Starting,
    Started,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: StateName,
    pub channel: Option<u8>,
    pub bandwidth: Option<Bandwidth>,
    /// The session is held back until the compliance timer expires.
    pub needs_monitoring: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: SessionId) {
        self.sessions.entry(id).or_insert(SessionInfo {
            id,
            state: StateName::Disconnected,
            channel: None,
            bandwidth: None,
            needs_monitoring: false,
        });
    }

    /// Returns whether the session was registered.
    pub fn unregister(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionInfo> {
        self.sessions.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn active(&self) -> impl Iterator<Item = &SessionInfo> + '_ {
        self.sessions.values()
    }

    /// Applies `f` to the entry for `id`, if registered.
    pub fn update<F: FnOnce(&mut SessionInfo)>(&mut self, id: SessionId, f: F) {
        if let Some(info) = self.sessions.get_mut(&id) {
            f(info);
        }
    }

    fn siblings(&self, id: SessionId) -> impl Iterator<Item = &SessionInfo> + '_ {
        self.sessions.values().filter(move |s| s.id != id)
    }

    /// Whether any session other than `id` still waits on the compliance timer.
    pub fn others_need_monitoring(&self, id: SessionId) -> bool {
        self.siblings(id).any(|s| s.needs_monitoring)
    }

    /// Channel and bandwidth of a sibling whose compliance wait is in progress.
    pub fn sibling_monitoring(&self, id: SessionId) -> Option<(u8, Bandwidth)> {
        self.siblings(id)
            .filter(|s| s.needs_monitoring && s.state == StateName::DfsWait)
            .find_map(|s| Some((s.channel?, s.bandwidth?)))
    }

    /// Whether a sibling already transmits on `channel`, meaning the
    /// compliance wait for it has been satisfied.
    pub fn sibling_started_on(&self, id: SessionId, channel: u8) -> bool {
        self.siblings(id)
            .any(|s| s.state == StateName::Started && s.channel == Some(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(registry: &mut SessionRegistry, id: SessionId, channel: u8) {
        registry.register(id);
        registry.update(id, |s| {
            s.state = StateName::DfsWait;
            s.channel = Some(channel);
            s.bandwidth = Some(Bandwidth::Mhz20);
            s.needs_monitoring = true;
        });
    }

    #[test]
    fn sibling_monitoring_excludes_self() {
        let mut registry = SessionRegistry::new();
        waiting(&mut registry, SessionId(1), 52);
        assert!(!registry.others_need_monitoring(SessionId(1)));
        assert_eq!(registry.sibling_monitoring(SessionId(1)), None);

        registry.register(SessionId(2));
        assert!(registry.others_need_monitoring(SessionId(2)));
        assert_eq!(registry.sibling_monitoring(SessionId(2)), Some((52, Bandwidth::Mhz20)));
    }

    #[test]
    fn unregister_releases_dependency() {
        let mut registry = SessionRegistry::new();
        waiting(&mut registry, SessionId(1), 52);
        waiting(&mut registry, SessionId(2), 52);
        assert!(registry.others_need_monitoring(SessionId(1)));
        assert!(registry.unregister(SessionId(2)));
        assert!(!registry.unregister(SessionId(2)));
        assert!(!registry.others_need_monitoring(SessionId(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn started_sibling_satisfies_wait() {
        let mut registry = SessionRegistry::new();
        registry.register(SessionId(1));
        registry.update(SessionId(1), |s| {
            s.state = StateName::Started;
            s.channel = Some(100);
        });
        assert!(registry.sibling_started_on(SessionId(2), 100));
        assert!(!registry.sibling_started_on(SessionId(1), 100));
        assert!(!registry.sibling_started_on(SessionId(2), 104));
    }
}
