use thiserror::Error;

use crate::registry::SessionId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DfsError {
    #[error("No channel available after filtering at any bandwidth")]
    NoChannelAvailable,

    #[error("Channel {0} is quarantined after a radar detection")]
    ChannelQuarantined(u8),

    #[error("Channel {0} is not allowed in the active regulatory domain")]
    UnsupportedChannel(u8),

    #[error("Invalid channel range {first}..={last}")]
    InvalidRange { first: u8, last: u8 },

    #[error("Unknown AP session {0}")]
    UnknownSession(SessionId),

    #[error("Controller is no longer running")]
    ControllerGone,

    #[error("Invalid configuration: {0}")]
    Config(String),
}
