use super::connection::ConnectionStateChange;
use crate::channel::{ChannelStateChange, CompletionId};
use crate::types::{ErrorInfo, Message, ProtocolMessage};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Timers owned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Bounds one whole connection attempt (credential, dial, handshake)
    Connect,
    /// Next reconnect attempt
    Retry,
    /// Moment the disconnected connection gives up and suspends
    SuspendDeadline,
    /// Bounds the close handshake
    Close,
    /// Fires when the server has been silent for too long
    Idle,
    ChannelAttach(String),
    ChannelDetach(String),
    ChannelRetry(String),
}

/// Side effects requested by the state machine, executed in order by the actor.
#[derive(Debug)]
pub(crate) enum Effect {
    FetchCredential { generation: u64, force: bool },
    Dial { generation: u64, url: Url },
    /// Abandon the in-flight credential fetch or dial
    AbortAttempt,
    Send(ProtocolMessage),
    /// Flush and close the current transport
    CloseTransport,
    /// Drop the current transport without a handshake
    DropTransport,
    StartTimer {
        timer: TimerKind,
        token: u64,
        delay: Duration,
    },
    CancelTimer(TimerKind),
    ConnectionChanged(ConnectionStateChange),
    ChannelChanged {
        channel: String,
        change: ChannelStateChange,
    },
    Complete {
        completion: CompletionId,
        result: Result<(), ErrorInfo>,
    },
    Deliver {
        channel: String,
        messages: Vec<Message>,
    },
}

/// Active timers and their tokens. A fired timer whose token no longer
/// matches was cancelled or restarted after it went off.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    next_token: u64,
    active: HashMap<TimerKind, u64>,
}

impl Timers {
    pub fn start(&mut self, timer: TimerKind, delay: Duration, out: &mut Vec<Effect>) {
        self.next_token += 1;
        let token = self.next_token;
        self.active.insert(timer.clone(), token);
        out.push(Effect::StartTimer {
            timer,
            token,
            delay,
        });
    }

    pub fn cancel(&mut self, timer: &TimerKind, out: &mut Vec<Effect>) {
        if self.active.remove(timer).is_some() {
            out.push(Effect::CancelTimer(timer.clone()));
        }
    }

    pub fn cancel_where(&mut self, predicate: impl Fn(&TimerKind) -> bool, out: &mut Vec<Effect>) {
        let mut cancelled: Vec<TimerKind> = self
            .active
            .keys()
            .filter(|timer| predicate(timer))
            .cloned()
            .collect();
        // HashMap order is arbitrary; keep the effect list reproducible.
        cancelled.sort_by_key(|timer| format!("{timer:?}"));
        for timer in cancelled {
            self.active.remove(&timer);
            out.push(Effect::CancelTimer(timer));
        }
    }

    /// Consumes a firing. Returns `false` for stale tokens.
    pub fn fire(&mut self, timer: &TimerKind, token: u64) -> bool {
        if self.active.get(timer) == Some(&token) {
            self.active.remove(timer);
            true
        } else {
            false
        }
    }

    pub fn is_active(&self, timer: &TimerKind) -> bool {
        self.active.contains_key(timer)
    }
}
