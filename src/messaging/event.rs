use serde::{Deserialize, Serialize};

/// Protocol message actions, encoded on the wire as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Action {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
    /// Action introduced by a newer protocol revision
    Unknown(u8),
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Self::Heartbeat => 0,
            Self::Ack => 1,
            Self::Nack => 2,
            Self::Connect => 3,
            Self::Connected => 4,
            Self::Disconnect => 5,
            Self::Disconnected => 6,
            Self::Close => 7,
            Self::Closed => 8,
            Self::Error => 9,
            Self::Attach => 10,
            Self::Attached => 11,
            Self::Detach => 12,
            Self::Detached => 13,
            Self::Presence => 14,
            Self::Message => 15,
            Self::Sync => 16,
            Self::Auth => 17,
            Self::Unknown(code) => code,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
            Self::Disconnected => "disconnected",
            Self::Close => "close",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Attach => "attach",
            Self::Attached => "attached",
            Self::Detach => "detach",
            Self::Detached => "detached",
            Self::Presence => "presence",
            Self::Message => "message",
            Self::Sync => "sync",
            Self::Auth => "auth",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether frames with this action belong to a channel rather than the connection.
    pub fn is_channel_action(&self) -> bool {
        matches!(
            self,
            Self::Attach
                | Self::Attached
                | Self::Detach
                | Self::Detached
                | Self::Presence
                | Self::Message
                | Self::Sync
        )
    }
}

impl From<u8> for Action {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Heartbeat,
            1 => Self::Ack,
            2 => Self::Nack,
            3 => Self::Connect,
            4 => Self::Connected,
            5 => Self::Disconnect,
            6 => Self::Disconnected,
            7 => Self::Close,
            8 => Self::Closed,
            9 => Self::Error,
            10 => Self::Attach,
            11 => Self::Attached,
            12 => Self::Detach,
            13 => Self::Detached,
            14 => Self::Presence,
            15 => Self::Message,
            16 => Self::Sync,
            17 => Self::Auth,
            other => Self::Unknown(other),
        }
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action.code()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
