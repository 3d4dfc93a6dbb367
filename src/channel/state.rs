use crate::types::ErrorInfo;

/// Attach lifecycle of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }

    /// States from which the channel is (re-)attached when the connection
    /// becomes connected.
    pub fn awaits_attach(&self) -> bool {
        matches!(self, Self::Attaching | Self::Suspended)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    State(ChannelState),
    /// Server sent `ATTACHED` for a channel that already was attached.
    Update,
}

impl From<ChannelState> for ChannelEvent {
    fn from(state: ChannelState) -> Self {
        Self::State(state)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub event: ChannelEvent,
    pub reason: Option<ErrorInfo>,
    /// Whether the attachment continued without message loss
    pub resumed: bool,
}

impl ChannelStateChange {
    pub fn new(previous: ChannelState, current: ChannelState, reason: Option<ErrorInfo>) -> Self {
        Self {
            previous,
            current,
            event: ChannelEvent::State(current),
            reason,
            resumed: false,
        }
    }

    pub fn update(current: ChannelState, reason: Option<ErrorInfo>, resumed: bool) -> Self {
        Self {
            previous: current,
            current,
            event: ChannelEvent::Update,
            reason,
            resumed,
        }
    }
}
