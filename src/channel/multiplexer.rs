use super::{ChannelEvent, ChannelState, ChannelStateChange, CompletionId, PendingMessage};
use crate::client::effect::{Effect, TimerKind, Timers};
use crate::messaging::Action;
use crate::types::{ErrorInfo, ProtocolMessage, error_codes, message::FLAG_RESUMED};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct ChannelRecord {
    state: ChannelState,
    queue: VecDeque<PendingMessage>,
    attach_waiters: Vec<CompletionId>,
    detach_waiters: Vec<CompletionId>,
}

impl Default for ChannelRecord {
    fn default() -> Self {
        Self {
            state: ChannelState::Initialized,
            queue: VecDeque::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
        }
    }
}

fn transition(
    name: &str,
    record: &mut ChannelRecord,
    to: ChannelState,
    reason: Option<ErrorInfo>,
    out: &mut Vec<Effect>,
) {
    if record.state == to {
        return;
    }
    tracing::info!("Channel '{}': {} -> {}", name, record.state, to);
    let change = ChannelStateChange::new(record.state, to, reason);
    record.state = to;
    out.push(Effect::ChannelChanged {
        channel: name.to_string(),
        change,
    });
}

fn complete(waiters: &mut Vec<CompletionId>, result: Result<(), ErrorInfo>, out: &mut Vec<Effect>) {
    for completion in waiters.drain(..) {
        out.push(Effect::Complete {
            completion,
            result: result.clone(),
        });
    }
}

/// Per-channel attach state machines and their outbound queues.
///
/// All queues share one bound (`max_queued` messages across channels).
#[derive(Debug)]
pub(crate) struct ChannelMultiplexer {
    channels: BTreeMap<String, ChannelRecord>,
    queued: usize,
    max_queued: usize,
    request_timeout: Duration,
    retry_timeout: Duration,
}

impl ChannelMultiplexer {
    pub fn new(max_queued: usize, request_timeout: Duration, retry_timeout: Duration) -> Self {
        Self {
            channels: BTreeMap::new(),
            queued: 0,
            max_queued,
            request_timeout,
            retry_timeout,
        }
    }

    pub fn state(&self, name: &str) -> ChannelState {
        self.channels
            .get(name)
            .map_or(ChannelState::Initialized, |record| record.state)
    }

    pub fn states(&self) -> BTreeMap<String, ChannelState> {
        self.channels
            .iter()
            .map(|(name, record)| (name.clone(), record.state))
            .collect()
    }

    /// Messages waiting in channel queues.
    pub fn queued(&self) -> usize {
        self.queued
    }

    fn send_attach(&self, name: &str, timers: &mut Timers, out: &mut Vec<Effect>) {
        out.push(Effect::Send(ProtocolMessage::for_channel(Action::Attach, name)));
        timers.start(TimerKind::ChannelAttach(name.to_string()), self.request_timeout, out);
    }

    fn cancel_channel_timers(name: &str, timers: &mut Timers, out: &mut Vec<Effect>) {
        timers.cancel(&TimerKind::ChannelAttach(name.to_string()), out);
        timers.cancel(&TimerKind::ChannelDetach(name.to_string()), out);
        timers.cancel(&TimerKind::ChannelRetry(name.to_string()), out);
    }

    fn fail_queue(
        record: &mut ChannelRecord,
        queued: &mut usize,
        error: &ErrorInfo,
        out: &mut Vec<Effect>,
    ) {
        *queued -= record.queue.len();
        for pending in record.queue.drain(..) {
            out.push(Effect::Complete {
                completion: pending.completion,
                result: Err(error.clone()),
            });
        }
    }

    pub fn attach(
        &mut self,
        name: &str,
        completion: Option<CompletionId>,
        connected: bool,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        let record = self.channels.entry(name.to_string()).or_default();
        match record.state {
            ChannelState::Attached => {
                if let Some(completion) = completion {
                    out.push(Effect::Complete {
                        completion,
                        result: Ok(()),
                    });
                }
            }
            ChannelState::Attaching => record.attach_waiters.extend(completion),
            _ => {
                let superseded = ErrorInfo::new(
                    error_codes::CHANNEL_OPERATION_FAILED,
                    400,
                    "detach superseded by attach",
                );
                complete(&mut record.detach_waiters, Err(superseded), out);
                transition(name, record, ChannelState::Attaching, None, out);
                record.attach_waiters.extend(completion);
                Self::cancel_channel_timers(name, timers, out);
                if connected {
                    self.send_attach(name, timers, out);
                }
            }
        }
    }

    pub fn detach(
        &mut self,
        name: &str,
        completion: Option<CompletionId>,
        connected: bool,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        let request_timeout = self.request_timeout;
        let record = self.channels.entry(name.to_string()).or_default();
        match record.state {
            ChannelState::Initialized | ChannelState::Detached => {
                if let Some(completion) = completion {
                    out.push(Effect::Complete {
                        completion,
                        result: Ok(()),
                    });
                }
            }
            ChannelState::Detaching => record.detach_waiters.extend(completion),
            ChannelState::Failed => {
                if let Some(completion) = completion {
                    out.push(Effect::Complete {
                        completion,
                        result: Err(ErrorInfo::new(
                            error_codes::CHANNEL_OPERATION_FAILED,
                            400,
                            format!("channel '{name}' is failed"),
                        )),
                    });
                }
            }
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended => {
                let detached = ErrorInfo::new(
                    error_codes::CHANNEL_OPERATION_FAILED,
                    400,
                    format!("channel '{name}' was detached"),
                );
                complete(&mut record.attach_waiters, Err(detached.clone()), out);
                Self::fail_queue(record, &mut self.queued, &detached, out);
                Self::cancel_channel_timers(name, timers, out);

                if connected {
                    transition(name, record, ChannelState::Detaching, None, out);
                    record.detach_waiters.extend(completion);
                    out.push(Effect::Send(ProtocolMessage::for_channel(Action::Detach, name)));
                    timers.start(TimerKind::ChannelDetach(name.to_string()), request_timeout, out);
                } else {
                    transition(name, record, ChannelState::Detached, None, out);
                    if let Some(completion) = completion {
                        out.push(Effect::Complete {
                            completion,
                            result: Ok(()),
                        });
                    }
                }
            }
        }
    }

    /// Appends to the channel queue, honouring the shared bound.
    pub fn enqueue(&mut self, pending: PendingMessage) -> Result<(), ErrorInfo> {
        if self.queued >= self.max_queued {
            return Err(ErrorInfo::new(
                error_codes::QUEUE_FULL,
                400,
                format!("outbound queue is full ({} messages)", self.max_queued),
            ));
        }
        let record = self.channels.entry(pending.channel.clone()).or_default();
        record.queue.push_back(pending);
        self.queued += 1;
        Ok(())
    }

    /// Handles `ATTACHED`; returns the channel's queued messages, ready to send.
    pub fn on_attached(
        &mut self,
        name: &str,
        frame: &ProtocolMessage,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) -> Vec<PendingMessage> {
        let Some(record) = self.channels.get_mut(name) else {
            tracing::debug!("ATTACHED for unknown channel '{}'", name);
            return Vec::new();
        };
        timers.cancel(&TimerKind::ChannelAttach(name.to_string()), out);
        let resumed = frame.has_flag(FLAG_RESUMED);

        match record.state {
            ChannelState::Attaching | ChannelState::Suspended => {
                tracing::info!("Channel '{}': {} -> attached", name, record.state);
                let change = ChannelStateChange {
                    previous: record.state,
                    current: ChannelState::Attached,
                    event: ChannelEvent::State(ChannelState::Attached),
                    reason: frame.error.clone(),
                    resumed,
                };
                record.state = ChannelState::Attached;
                out.push(Effect::ChannelChanged {
                    channel: name.to_string(),
                    change,
                });
            }
            ChannelState::Attached => {
                out.push(Effect::ChannelChanged {
                    channel: name.to_string(),
                    change: ChannelStateChange::update(
                        ChannelState::Attached,
                        frame.error.clone(),
                        resumed,
                    ),
                });
            }
            _ => {
                tracing::debug!("Ignoring late ATTACHED for '{}' in {}", name, record.state);
                return Vec::new();
            }
        }

        complete(&mut record.attach_waiters, Ok(()), out);
        self.queued -= record.queue.len();
        record.queue.drain(..).collect()
    }

    pub fn on_detached(
        &mut self,
        name: &str,
        error: Option<ErrorInfo>,
        connected: bool,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        let Some(record) = self.channels.get_mut(name) else {
            return;
        };
        timers.cancel(&TimerKind::ChannelDetach(name.to_string()), out);

        match record.state {
            ChannelState::Detaching => {
                transition(name, record, ChannelState::Detached, error, out);
                complete(&mut record.detach_waiters, Ok(()), out);
            }
            ChannelState::Attached | ChannelState::Attaching if connected => {
                // Detached by the server: attach again.
                tracing::warn!("Channel '{}' detached by server; re-attaching", name);
                transition(name, record, ChannelState::Attaching, error, out);
                self.send_attach(name, timers, out);
            }
            _ => {}
        }
    }

    pub fn on_channel_error(
        &mut self,
        name: &str,
        error: ErrorInfo,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        let Some(record) = self.channels.get_mut(name) else {
            return;
        };
        Self::cancel_channel_timers(name, timers, out);
        transition(name, record, ChannelState::Failed, Some(error.clone()), out);
        complete(&mut record.attach_waiters, Err(error.clone()), out);
        complete(&mut record.detach_waiters, Err(error.clone()), out);
        Self::fail_queue(record, &mut self.queued, &error, out);
    }

    /// Connection reached `connected`: (re-)attach every channel waiting for it.
    pub fn on_connected(&mut self, timers: &mut Timers, out: &mut Vec<Effect>) {
        let pending: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, record)| record.state.awaits_attach())
            .map(|(name, _)| name.clone())
            .collect();

        for name in pending {
            if let Some(record) = self.channels.get_mut(&name) {
                transition(&name, record, ChannelState::Attaching, None, out);
            }
            timers.cancel(&TimerKind::ChannelRetry(name.clone()), out);
            self.send_attach(&name, timers, out);
        }
    }

    /// Connection lost but may resume: attached channels become suspended.
    pub fn on_interrupted(&mut self, reason: Option<ErrorInfo>, timers: &mut Timers, out: &mut Vec<Effect>) {
        timers.cancel_where(
            |timer| {
                matches!(
                    timer,
                    TimerKind::ChannelAttach(_) | TimerKind::ChannelDetach(_) | TimerKind::ChannelRetry(_)
                )
            },
            out,
        );
        for (name, record) in self.channels.iter_mut() {
            match record.state {
                ChannelState::Attached | ChannelState::Attaching => {
                    transition(name, record, ChannelState::Suspended, reason.clone(), out);
                }
                ChannelState::Detaching => {
                    transition(name, record, ChannelState::Detached, reason.clone(), out);
                    complete(&mut record.detach_waiters, Ok(()), out);
                }
                _ => {}
            }
        }
    }

    /// Connection suspended: queued messages are dropped and reported.
    pub fn on_suspended(&mut self, reason: ErrorInfo, timers: &mut Timers, out: &mut Vec<Effect>) {
        self.on_interrupted(Some(reason.clone()), timers, out);
        for record in self.channels.values_mut() {
            complete(&mut record.attach_waiters, Err(reason.clone()), out);
            Self::fail_queue(record, &mut self.queued, &reason, out);
        }
    }

    /// Connection closed: every channel ends up detached.
    pub fn on_closed(&mut self, reason: ErrorInfo, timers: &mut Timers, out: &mut Vec<Effect>) {
        self.end_all(ChannelState::Detached, None, reason, timers, out);
    }

    /// Connection failed: every channel that was in use fails.
    pub fn on_failed(&mut self, reason: ErrorInfo, timers: &mut Timers, out: &mut Vec<Effect>) {
        self.end_all(ChannelState::Failed, Some(reason.clone()), reason, timers, out);
    }

    fn end_all(
        &mut self,
        to: ChannelState,
        change_reason: Option<ErrorInfo>,
        error: ErrorInfo,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        timers.cancel_where(
            |timer| {
                matches!(
                    timer,
                    TimerKind::ChannelAttach(_) | TimerKind::ChannelDetach(_) | TimerKind::ChannelRetry(_)
                )
            },
            out,
        );
        // A detach only succeeds when the connection closed cleanly.
        let detach_result = if to == ChannelState::Failed {
            Err(error.clone())
        } else {
            Ok(())
        };
        for (name, record) in self.channels.iter_mut() {
            if !matches!(record.state, ChannelState::Initialized | ChannelState::Detached) {
                transition(name, record, to, change_reason.clone(), out);
            }
            complete(&mut record.attach_waiters, Err(error.clone()), out);
            complete(&mut record.detach_waiters, detach_result.clone(), out);
            Self::fail_queue(record, &mut self.queued, &error, out);
        }
    }

    pub fn on_attach_timeout(&mut self, name: &str, timers: &mut Timers, out: &mut Vec<Effect>) {
        let retry_timeout = self.retry_timeout;
        let Some(record) = self.channels.get_mut(name) else {
            return;
        };
        if record.state != ChannelState::Attaching {
            return;
        }
        let reason = ErrorInfo::timeout(format!("attach of '{name}' timed out"));
        transition(name, record, ChannelState::Suspended, Some(reason.clone()), out);
        complete(&mut record.attach_waiters, Err(reason.clone()), out);
        Self::fail_queue(record, &mut self.queued, &reason, out);
        timers.start(TimerKind::ChannelRetry(name.to_string()), retry_timeout, out);
    }

    pub fn on_detach_timeout(&mut self, name: &str, out: &mut Vec<Effect>) {
        let Some(record) = self.channels.get_mut(name) else {
            return;
        };
        if record.state == ChannelState::Detaching {
            transition(name, record, ChannelState::Detached, None, out);
            complete(&mut record.detach_waiters, Ok(()), out);
        }
    }

    pub fn on_retry(&mut self, name: &str, connected: bool, timers: &mut Timers, out: &mut Vec<Effect>) {
        let Some(record) = self.channels.get_mut(name) else {
            return;
        };
        if record.state == ChannelState::Suspended && connected {
            transition(name, record, ChannelState::Attaching, None, out);
            self.send_attach(name, timers, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn mux() -> ChannelMultiplexer {
        ChannelMultiplexer::new(3, Duration::from_secs(10), Duration::from_secs(15))
    }

    fn changes(out: &[Effect]) -> Vec<(String, ChannelState)> {
        out.iter()
            .filter_map(|effect| match effect {
                Effect::ChannelChanged { channel, change } => Some((channel.clone(), change.current)),
                _ => None,
            })
            .collect()
    }

    fn sent(out: &[Effect]) -> Vec<Action> {
        out.iter()
            .filter_map(|effect| match effect {
                Effect::Send(frame) => Some(frame.action),
                _ => None,
            })
            .collect()
    }

    fn completions(out: &[Effect]) -> Vec<(CompletionId, bool)> {
        out.iter()
            .filter_map(|effect| match effect {
                Effect::Complete { completion, result } => Some((*completion, result.is_ok())),
                _ => None,
            })
            .collect()
    }

    fn attached(name: &str) -> ProtocolMessage {
        ProtocolMessage::for_channel(Action::Attached, name)
    }

    #[test]
    fn test_attach_while_disconnected_is_replayed_on_connect() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();

        mux.attach("news", Some(1), false, &mut timers, &mut out);
        assert_eq!(changes(&out), vec![("news".into(), ChannelState::Attaching)]);
        assert!(sent(&out).is_empty());

        out.clear();
        mux.on_connected(&mut timers, &mut out);
        assert_eq!(sent(&out), vec![Action::Attach]);

        out.clear();
        mux.on_attached("news", &attached("news"), &mut timers, &mut out);
        assert_eq!(changes(&out), vec![("news".into(), ChannelState::Attached)]);
        assert_eq!(completions(&out), vec![(1, true)]);
    }

    #[test]
    fn test_interruption_suspends_and_reconnect_reattaches() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", None, true, &mut timers, &mut out);
        mux.on_attached("a", &attached("a"), &mut timers, &mut out);

        out.clear();
        mux.on_interrupted(None, &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Suspended);

        out.clear();
        mux.on_connected(&mut timers, &mut out);
        assert_eq!(changes(&out), vec![("a".into(), ChannelState::Attaching)]);
        assert_eq!(sent(&out), vec![Action::Attach]);
    }

    #[test]
    fn test_queue_bound_is_shared_across_channels() {
        let mut mux = mux();
        for (i, channel) in ["a", "b", "a"].into_iter().enumerate() {
            let pending = PendingMessage::new(channel, vec![Message::new("e", serde_json::Value::Null)], i as u64);
            assert!(mux.enqueue(pending).is_ok());
        }
        let overflow = PendingMessage::new("c", Vec::new(), 9);
        let error = mux.enqueue(overflow).unwrap_err();
        assert_eq!(error.code, error_codes::QUEUE_FULL);
        assert_eq!(mux.queued(), 3);
    }

    #[test]
    fn test_attached_flushes_queue_in_order() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", None, true, &mut timers, &mut out);
        mux.enqueue(PendingMessage::new("a", Vec::new(), 1)).unwrap();
        mux.enqueue(PendingMessage::new("a", Vec::new(), 2)).unwrap();

        let flushed = mux.on_attached("a", &attached("a"), &mut timers, &mut out);
        let ids: Vec<_> = flushed.iter().map(|p| p.completion).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(mux.queued(), 0);
    }

    #[test]
    fn test_suspension_drops_queued_messages() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", None, false, &mut timers, &mut out);
        mux.enqueue(PendingMessage::new("a", Vec::new(), 7)).unwrap();

        out.clear();
        let reason = ErrorInfo::new(error_codes::CONNECTION_SUSPENDED, 503, "suspended");
        mux.on_suspended(reason, &mut timers, &mut out);
        assert_eq!(completions(&out), vec![(7, false)]);
        assert_eq!(mux.queued(), 0);
        assert_eq!(mux.state("a"), ChannelState::Suspended);
    }

    #[test]
    fn test_closed_detaches_and_failed_fails() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", None, true, &mut timers, &mut out);
        mux.on_attached("a", &attached("a"), &mut timers, &mut out);
        mux.on_closed(ErrorInfo::new(error_codes::CONNECTION_CLOSED, 400, "closed"), &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Detached);

        mux.attach("b", None, true, &mut timers, &mut out);
        mux.on_failed(ErrorInfo::new(40101, 401, "bad key"), &mut timers, &mut out);
        assert_eq!(mux.state("b"), ChannelState::Failed);
        assert_eq!(mux.state("a"), ChannelState::Detached);
    }

    #[test]
    fn test_pending_detach_fails_with_connection_but_succeeds_on_close() {
        let detaching = || {
            let mut mux = mux();
            let mut timers = Timers::default();
            let mut out = Vec::new();
            mux.attach("a", None, true, &mut timers, &mut out);
            mux.on_attached("a", &attached("a"), &mut timers, &mut out);
            mux.detach("a", Some(1), true, &mut timers, &mut out);
            (mux, timers)
        };

        let (mut mux, mut timers) = detaching();
        let mut out = Vec::new();
        mux.on_failed(ErrorInfo::new(40101, 401, "bad key"), &mut timers, &mut out);
        assert_eq!(completions(&out), vec![(1, false)]);

        let (mut mux, mut timers) = detaching();
        let mut out = Vec::new();
        mux.on_closed(ErrorInfo::new(error_codes::CONNECTION_CLOSED, 400, "closed"), &mut timers, &mut out);
        assert_eq!(completions(&out), vec![(1, true)]);
    }

    #[test]
    fn test_detach_round_trip() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", None, true, &mut timers, &mut out);
        mux.on_attached("a", &attached("a"), &mut timers, &mut out);

        out.clear();
        mux.detach("a", Some(4), true, &mut timers, &mut out);
        assert_eq!(sent(&out), vec![Action::Detach]);
        assert_eq!(mux.state("a"), ChannelState::Detaching);

        out.clear();
        mux.on_detached("a", None, true, &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Detached);
        assert_eq!(completions(&out), vec![(4, true)]);
    }

    #[test]
    fn test_server_detach_triggers_reattach() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", None, true, &mut timers, &mut out);
        mux.on_attached("a", &attached("a"), &mut timers, &mut out);

        out.clear();
        mux.on_detached("a", None, true, &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Attaching);
        assert_eq!(sent(&out), vec![Action::Attach]);
    }

    #[test]
    fn test_attach_timeout_suspends_then_retries() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", Some(1), true, &mut timers, &mut out);

        out.clear();
        mux.on_attach_timeout("a", &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Suspended);
        assert_eq!(completions(&out), vec![(1, false)]);
        assert!(timers.is_active(&TimerKind::ChannelRetry("a".into())));

        out.clear();
        mux.on_retry("a", true, &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Attaching);
        assert_eq!(sent(&out), vec![Action::Attach]);
    }

    #[test]
    fn test_channel_error_fails_waiters_and_queue() {
        let mut mux = mux();
        let mut timers = Timers::default();
        let mut out = Vec::new();
        mux.attach("a", Some(1), true, &mut timers, &mut out);
        mux.enqueue(PendingMessage::new("a", Vec::new(), 2)).unwrap();

        out.clear();
        mux.on_channel_error("a", ErrorInfo::new(40160, 401, "not permitted"), &mut timers, &mut out);
        assert_eq!(mux.state("a"), ChannelState::Failed);
        assert_eq!(completions(&out), vec![(1, false), (2, false)]);
    }
}
