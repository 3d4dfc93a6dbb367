//! The connection state machine.
//!
//! [`ConnectionStateMachine`] is a plain synchronous value: every input
//! (user request, transport event, credential result, timer) goes through
//! [`handle`](ConnectionStateMachine::handle) together with the current time,
//! and comes back as an ordered list of [`Effect`]s for the actor to carry out.
//! Nothing in here spawns, sleeps or reads a clock, so the same inputs always
//! produce the same states.
//!
//! Every connection attempt gets a new generation. Credential results,
//! dial results and transport events carry the generation they belong to;
//! anything from a superseded attempt is discarded.

use super::connection::{ConnectionState, ConnectionStateChange, RecoveryKey};
use super::effect::{Effect, TimerKind, Timers};
use super::options::{ClientConfig, Continuity};
use crate::auth::ConnectAuth;
use crate::channel::{ChannelMultiplexer, ChannelState, CompletionId, PendingMessage};
use crate::messaging::{Action, MessageRouter, Route};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::types::message::AuthDetails;
use crate::types::{ErrorInfo, FailureKind, Message, ProtocolMessage, error_codes};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Everything the state machine reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    Connect,
    Close,
    Authorize {
        completion: CompletionId,
    },
    Attach {
        channel: String,
        completion: Option<CompletionId>,
    },
    Detach {
        channel: String,
        completion: Option<CompletionId>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        completion: CompletionId,
    },
    CredentialObtained {
        generation: u64,
        result: Result<ConnectAuth, ErrorInfo>,
    },
    TransportOpened {
        generation: u64,
    },
    DialFailed {
        generation: u64,
        error: ErrorInfo,
    },
    Frame {
        generation: u64,
        frame: ProtocolMessage,
    },
    TransportClosed {
        generation: u64,
        error: Option<ErrorInfo>,
    },
    TimerFired {
        timer: TimerKind,
        token: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Credential,
    Dialing,
    Handshake,
}

/// Read-only view published after every input.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub state: ConnectionState,
    pub error_reason: Option<ErrorInfo>,
    pub connection_id: Option<String>,
    pub recovery_key: Option<RecoveryKey>,
    pub host: Option<String>,
    pub channels: BTreeMap<String, ChannelState>,
}

impl ClientSnapshot {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            error_reason: None,
            connection_id: None,
            recovery_key: None,
            host: None,
            channels: BTreeMap::new(),
        }
    }
}

pub(crate) struct ConnectionStateMachine {
    config: Arc<ClientConfig>,
    token_auth: bool,
    router: MessageRouter,
    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    generation: u64,
    phase: Phase,
    host: Option<String>,
    scheduler: RetryScheduler,
    channels: ChannelMultiplexer,
    timers: Timers,

    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: i64,
    msg_serial: u64,
    recover: Option<RecoveryKey>,
    attempt_continuity: Continuity,
    unacked: VecDeque<PendingMessage>,

    suspended_mode: bool,
    suspend_deadline: Option<Instant>,
    connection_state_ttl: Duration,
    idle_timeout: Option<Duration>,
    force_credential: bool,
    reauth_pending: bool,
    authorize_waiters: Vec<CompletionId>,
}

impl ConnectionStateMachine {
    pub fn new(config: Arc<ClientConfig>, scheduler: RetryScheduler, token_auth: bool) -> Self {
        let channels = ChannelMultiplexer::new(
            config.max_queued_messages,
            config.realtime_request_timeout,
            config.disconnected_retry_timeout,
        );
        Self {
            token_auth,
            router: MessageRouter::new(),
            state: ConnectionState::Initialized,
            error_reason: None,
            generation: 0,
            phase: Phase::Idle,
            host: None,
            scheduler,
            channels,
            timers: Timers::default(),
            connection_id: None,
            connection_key: None,
            connection_serial: -1,
            msg_serial: 0,
            recover: config.recover.clone(),
            attempt_continuity: Continuity::Fresh,
            unacked: VecDeque::new(),
            suspended_mode: false,
            suspend_deadline: None,
            connection_state_ttl: config.connection_state_ttl,
            idle_timeout: None,
            force_credential: false,
            reauth_pending: false,
            authorize_waiters: Vec::new(),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a freshly dialed transport for `generation` should be installed.
    pub fn accepts_transport(&self, generation: u64) -> bool {
        generation == self.generation
            && self.state == ConnectionState::Connecting
            && self.phase == Phase::Dialing
    }

    pub fn recovery_key(&self) -> Option<RecoveryKey> {
        self.connection_key.as_ref().map(|key| RecoveryKey {
            connection_key: key.clone(),
            connection_serial: self.connection_serial,
            msg_serial: self.msg_serial,
        })
    }

    pub fn queued_messages(&self) -> usize {
        self.channels.queued()
    }

    pub fn unacked_messages(&self) -> usize {
        self.unacked.len()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            state: self.state,
            error_reason: self.error_reason.clone(),
            connection_id: self.connection_id.clone(),
            recovery_key: self.recovery_key(),
            host: self.host.clone(),
            channels: self.channels.states(),
        }
    }

    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        let mut out = Vec::new();
        match input {
            Input::Connect => self.connect(now, &mut out),
            Input::Close => self.close(&mut out),
            Input::Authorize { completion } => self.authorize(completion, now, &mut out),
            Input::Attach {
                channel,
                completion,
            } => self.attach(&channel, completion, &mut out),
            Input::Detach {
                channel,
                completion,
            } => {
                let connected = self.is_connected();
                self.channels
                    .detach(&channel, completion, connected, &mut self.timers, &mut out);
            }
            Input::Publish {
                channel,
                messages,
                completion,
            } => self.publish(channel, messages, completion, &mut out),
            Input::CredentialObtained { generation, result } if generation == self.generation => {
                self.on_credential(result, now, &mut out)
            }
            Input::TransportOpened { generation } if self.accepts_transport(generation) => {
                tracing::debug!("Transport open (generation {}); awaiting CONNECTED", generation);
                self.phase = Phase::Handshake;
            }
            Input::DialFailed { generation, error }
                if generation == self.generation && self.state == ConnectionState::Connecting =>
            {
                self.on_attempt_failed(error, now, &mut out)
            }
            Input::Frame { generation, frame } if generation == self.generation => {
                self.on_frame(frame, now, &mut out)
            }
            Input::TransportClosed { generation, error } if generation == self.generation => {
                self.on_transport_closed(error, now, &mut out)
            }
            Input::TimerFired { timer, token } => {
                if self.timers.fire(&timer, token) {
                    self.on_timer(timer, now, &mut out);
                } else {
                    tracing::trace!("Ignoring stale {:?} timer", timer);
                }
            }
            stale => {
                tracing::debug!(
                    "Discarding input from superseded attempt (current generation {}): {:?}",
                    self.generation,
                    stale
                );
            }
        }
        out
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn transition(
        &mut self,
        to: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
        out: &mut Vec<Effect>,
    ) {
        let previous = self.state;
        self.state = to;
        self.error_reason = reason.clone();
        match &reason {
            Some(reason) => tracing::info!("Connection state: {} -> {} ({})", previous, to, reason),
            None => tracing::info!("Connection state: {} -> {}", previous, to),
        }
        out.push(Effect::ConnectionChanged(
            ConnectionStateChange::new(previous, to)
                .with_reason(reason)
                .with_retry_in(retry_in),
        ));
    }

    fn emit_update(&mut self, reason: Option<ErrorInfo>, out: &mut Vec<Effect>) {
        out.push(Effect::ConnectionChanged(ConnectionStateChange::update(
            self.state, reason,
        )));
    }

    fn complete(completion: CompletionId, result: Result<(), ErrorInfo>, out: &mut Vec<Effect>) {
        out.push(Effect::Complete { completion, result });
    }

    fn finish_authorize(&mut self, result: Result<(), ErrorInfo>, out: &mut Vec<Effect>) {
        for completion in self.authorize_waiters.drain(..) {
            out.push(Effect::Complete {
                completion,
                result: result.clone(),
            });
        }
    }

    // ---- user requests ----

    fn connect(&mut self, now: Instant, out: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!("connect() while {}; nothing to do", self.state);
            }
            ConnectionState::Closing => {
                tracing::warn!("connect() while closing is not permitted");
            }
            ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed => {
                self.begin_session(now, out);
                let host = self.scheduler.begin_cycle(now);
                self.start_attempt(host, out);
            }
            ConnectionState::Disconnected | ConnectionState::Suspended => {
                self.timers.cancel(&TimerKind::Retry, out);
                let host = if self.suspended_mode {
                    self.scheduler.begin_cycle(now)
                } else {
                    self.scheduler.current_host().to_string()
                };
                self.start_attempt(host, out);
            }
        }
    }

    fn begin_session(&mut self, now: Instant, out: &mut Vec<Effect>) {
        self.suspended_mode = false;
        self.connection_state_ttl = self.config.connection_state_ttl;
        self.arm_suspend_deadline(now, out);
    }

    fn arm_suspend_deadline(&mut self, now: Instant, out: &mut Vec<Effect>) {
        self.suspend_deadline = Some(now + self.connection_state_ttl);
        self.timers
            .start(TimerKind::SuspendDeadline, self.connection_state_ttl, out);
    }

    fn start_attempt(&mut self, host: String, out: &mut Vec<Effect>) {
        self.generation += 1;
        self.phase = Phase::Credential;
        tracing::info!("Connection attempt {} against {}", self.generation, host);
        self.host = Some(host);

        self.timers.cancel(&TimerKind::Retry, out);
        if self.state != ConnectionState::Connecting {
            self.transition(ConnectionState::Connecting, None, None, out);
        }
        self.timers
            .start(TimerKind::Connect, self.config.realtime_request_timeout, out);
        out.push(Effect::FetchCredential {
            generation: self.generation,
            force: std::mem::take(&mut self.force_credential),
        });
    }

    fn close(&mut self, out: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                tracing::debug!("close() while {}; nothing to do", self.state);
            }
            ConnectionState::Initialized
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => self.closed(out),
            ConnectionState::Connecting => {
                out.push(Effect::AbortAttempt);
                out.push(Effect::DropTransport);
                self.phase = Phase::Idle;
                self.transition(ConnectionState::Closing, None, None, out);
                self.closed(out);
            }
            ConnectionState::Connected => {
                self.timers.cancel(&TimerKind::Idle, out);
                out.push(Effect::Send(ProtocolMessage::new(Action::Close)));
                self.transition(ConnectionState::Closing, None, None, out);
                self.timers
                    .start(TimerKind::Close, self.config.disconnect_timeout, out);
            }
        }
    }

    fn authorize(&mut self, completion: CompletionId, now: Instant, out: &mut Vec<Effect>) {
        if !self.token_auth {
            Self::complete(
                completion,
                Err(ErrorInfo::new(
                    error_codes::BAD_REQUEST,
                    400,
                    "authorize() requires token authentication",
                )),
                out,
            );
            return;
        }

        match self.state {
            ConnectionState::Closing => Self::complete(
                completion,
                Err(ErrorInfo::new(error_codes::CONNECTION_CLOSED, 400, "connection is closing")),
                out,
            ),
            ConnectionState::Connected => {
                self.authorize_waiters.push(completion);
                if !self.reauth_pending {
                    self.request_reauth(out);
                }
            }
            ConnectionState::Connecting => {
                self.authorize_waiters.push(completion);
                self.force_credential = true;
            }
            _ => {
                self.authorize_waiters.push(completion);
                self.force_credential = true;
                self.connect(now, out);
            }
        }
    }

    fn request_reauth(&mut self, out: &mut Vec<Effect>) {
        self.reauth_pending = true;
        out.push(Effect::FetchCredential {
            generation: self.generation,
            force: true,
        });
    }

    fn attach(&mut self, channel: &str, completion: Option<CompletionId>, out: &mut Vec<Effect>) {
        if let Some(error) = self.unusable_connection_error() {
            if let Some(completion) = completion {
                Self::complete(completion, Err(error), out);
            }
            return;
        }
        let connected = self.is_connected();
        self.channels
            .attach(channel, completion, connected, &mut self.timers, out);
    }

    /// Error for operations that cannot proceed in the current state.
    fn unusable_connection_error(&self) -> Option<ErrorInfo> {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => Some(ErrorInfo::new(
                error_codes::CONNECTION_CLOSED,
                400,
                "connection is closed",
            )),
            ConnectionState::Failed => Some(self.error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(error_codes::CONNECTION_FAILED, 400, "connection failed")
            })),
            ConnectionState::Suspended => Some(ErrorInfo::new(
                error_codes::CONNECTION_SUSPENDED,
                503,
                "connection is suspended",
            )),
            _ => None,
        }
    }

    fn publish(
        &mut self,
        channel: String,
        mut messages: Vec<Message>,
        completion: CompletionId,
        out: &mut Vec<Effect>,
    ) {
        if let Some(error) = self.unusable_connection_error() {
            Self::complete(completion, Err(error), out);
            return;
        }

        let channel_state = self.channels.state(&channel);
        if channel_state == ChannelState::Failed {
            Self::complete(
                completion,
                Err(ErrorInfo::new(
                    error_codes::CHANNEL_OPERATION_FAILED,
                    400,
                    format!("channel '{channel}' is failed"),
                )),
                out,
            );
            return;
        }

        if self.config.idempotent_publishing {
            let base = uuid::Uuid::new_v4().simple().to_string();
            for (index, message) in messages.iter_mut().enumerate() {
                message.id.get_or_insert_with(|| format!("{base}:{index}"));
            }
        }

        let pending = PendingMessage::new(channel.clone(), messages, completion);
        if self.is_connected() && channel_state == ChannelState::Attached {
            self.send_message(pending, out);
            return;
        }

        if self.config.no_queueing {
            Self::complete(
                completion,
                Err(ErrorInfo::new(
                    error_codes::CHANNEL_NOT_ATTACHED,
                    400,
                    format!("channel '{channel}' is not attached and queueing is disabled"),
                )),
                out,
            );
            return;
        }

        if let Err(error) = self.channels.enqueue(pending) {
            Self::complete(completion, Err(error), out);
            return;
        }
        if channel_state != ChannelState::Attaching {
            let connected = self.is_connected();
            self.channels
                .attach(&channel, None, connected, &mut self.timers, out);
        }
    }

    fn send_message(&mut self, mut pending: PendingMessage, out: &mut Vec<Effect>) {
        let serial = self.msg_serial;
        self.msg_serial += 1;
        pending.msg_serial = Some(serial);
        self.write_message(pending, out);
    }

    fn write_message(&mut self, pending: PendingMessage, out: &mut Vec<Effect>) {
        let mut frame = ProtocolMessage::for_channel(Action::Message, pending.channel.clone())
            .with_messages(pending.messages.clone());
        frame.msg_serial = pending.msg_serial;
        out.push(Effect::Send(frame));
        self.unacked.push_back(pending);
    }

    fn resolve_acks(&mut self, serial: u64, count: u32, error: Option<ErrorInfo>, out: &mut Vec<Effect>) {
        let end = serial.saturating_add(u64::from(count));
        let result = error.map_or(Ok(()), Err);
        let mut remaining = VecDeque::with_capacity(self.unacked.len());
        for pending in self.unacked.drain(..) {
            match pending.msg_serial {
                Some(s) if (serial..end).contains(&s) => out.push(Effect::Complete {
                    completion: pending.completion,
                    result: result.clone(),
                }),
                _ => remaining.push_back(pending),
            }
        }
        self.unacked = remaining;
    }

    fn fail_unacked(&mut self, error: &ErrorInfo, out: &mut Vec<Effect>) {
        for pending in self.unacked.drain(..) {
            out.push(Effect::Complete {
                completion: pending.completion,
                result: Err(error.clone()),
            });
        }
    }

    // ---- attempt lifecycle ----

    fn next_continuity(&self) -> Continuity {
        if let Some(key) = &self.connection_key {
            Continuity::Resume {
                connection_key: key.clone(),
                connection_serial: self.connection_serial,
            }
        } else if let Some(recover) = &self.recover {
            Continuity::Recover(recover.clone())
        } else {
            Continuity::Fresh
        }
    }

    fn on_credential(&mut self, result: Result<ConnectAuth, ErrorInfo>, now: Instant, out: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connecting if self.phase == Phase::Credential => match result {
                Ok(auth) => {
                    let host = self.host.clone().unwrap_or_default();
                    let continuity = self.next_continuity();
                    match self.config.connect_url(&host, &auth, &continuity) {
                        Ok(url) => {
                            self.attempt_continuity = continuity;
                            self.phase = Phase::Dialing;
                            out.push(Effect::Dial {
                                generation: self.generation,
                                url,
                            });
                        }
                        Err(e) => self.fail(e.to_error_info(), out),
                    }
                }
                Err(error) => self.on_attempt_failed(error, now, out),
            },
            ConnectionState::Connected if self.reauth_pending => {
                self.reauth_pending = false;
                match result {
                    Ok(ConnectAuth::Token(token)) => {
                        let mut frame = ProtocolMessage::new(Action::Auth);
                        frame.auth = Some(AuthDetails {
                            access_token: token,
                        });
                        out.push(Effect::Send(frame));
                    }
                    Ok(ConnectAuth::Key(_)) => self.finish_authorize(Ok(()), out),
                    Err(error) => {
                        tracing::warn!("Re-authentication failed: {}", error);
                        self.finish_authorize(Err(error.clone()), out);
                        self.emit_update(Some(error), out);
                    }
                }
            }
            _ => tracing::debug!("Ignoring credential result while {}", self.state),
        }
    }

    fn on_attempt_failed(&mut self, error: ErrorInfo, now: Instant, out: &mut Vec<Effect>) {
        self.timers.cancel(&TimerKind::Connect, out);
        out.push(Effect::AbortAttempt);
        out.push(Effect::DropTransport);
        self.phase = Phase::Idle;

        // Superseded attempts never get here, so a cancelled dial or fetch
        // counts against the host like any other failure.
        let kind = error.kind();
        tracing::warn!(
            "Connection attempt against {} failed: {}",
            self.host.as_deref().unwrap_or("?"),
            error
        );

        match self.scheduler.on_failure(kind) {
            RetryDecision::Fail => self.fail(error, out),
            RetryDecision::Retry { delay, .. } => {
                if kind == FailureKind::Credential {
                    self.force_credential = true;
                }
                self.schedule_retry(delay, error, now, out);
            }
        }
    }

    fn schedule_retry(&mut self, delay: Duration, reason: ErrorInfo, now: Instant, out: &mut Vec<Effect>) {
        if self.suspended_mode {
            let retry_in = self.config.suspended_retry_timeout;
            self.transition(ConnectionState::Suspended, Some(reason), Some(retry_in), out);
            self.timers.start(TimerKind::Retry, retry_in, out);
            return;
        }

        let remaining = match self.suspend_deadline {
            Some(deadline) if now >= deadline => {
                self.suspend(reason, out);
                return;
            }
            Some(deadline) => deadline - now,
            None => delay,
        };

        // A retry due at or after the deadline is left to the deadline timer.
        let retry_in = if delay < remaining {
            self.timers.start(TimerKind::Retry, delay, out);
            delay
        } else {
            remaining
        };
        self.transition(ConnectionState::Disconnected, Some(reason), Some(retry_in), out);
    }

    fn suspend(&mut self, reason: ErrorInfo, out: &mut Vec<Effect>) {
        self.suspended_mode = true;
        self.suspend_deadline = None;
        self.timers.cancel(&TimerKind::SuspendDeadline, out);
        self.timers.cancel(&TimerKind::Retry, out);
        self.timers.cancel(&TimerKind::Connect, out);
        self.timers.cancel(&TimerKind::Idle, out);
        if self.state == ConnectionState::Connecting {
            out.push(Effect::AbortAttempt);
            out.push(Effect::DropTransport);
            self.phase = Phase::Idle;
        }

        let dropped = ErrorInfo::new(
            error_codes::CONNECTION_SUSPENDED,
            503,
            format!("connection suspended: {}", reason.message),
        );
        // The server discards the session once the state TTL has passed.
        self.clear_session();
        self.fail_unacked(&dropped, out);
        self.finish_authorize(Err(dropped.clone()), out);

        let retry_in = self.config.suspended_retry_timeout;
        self.transition(ConnectionState::Suspended, Some(reason), Some(retry_in), out);
        self.channels.on_suspended(dropped, &mut self.timers, out);
        self.timers.start(TimerKind::Retry, retry_in, out);
    }

    fn clear_session(&mut self) {
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = -1;
        self.msg_serial = 0;
        self.idle_timeout = None;
        self.reauth_pending = false;
    }

    fn fail(&mut self, reason: ErrorInfo, out: &mut Vec<Effect>) {
        self.generation += 1;
        self.phase = Phase::Idle;
        out.push(Effect::AbortAttempt);
        out.push(Effect::DropTransport);
        self.cancel_connection_timers(out);
        self.suspended_mode = false;
        self.suspend_deadline = None;

        self.transition(ConnectionState::Failed, Some(reason.clone()), None, out);
        self.channels.on_failed(reason.clone(), &mut self.timers, out);
        self.fail_unacked(&reason, out);
        self.finish_authorize(Err(reason), out);
        self.clear_session();
        self.recover = None;
    }

    fn closed(&mut self, out: &mut Vec<Effect>) {
        self.generation += 1;
        self.phase = Phase::Idle;
        out.push(Effect::CloseTransport);
        self.cancel_connection_timers(out);
        self.suspended_mode = false;
        self.suspend_deadline = None;

        let info = ErrorInfo::new(error_codes::CONNECTION_CLOSED, 400, "connection closed");
        self.transition(ConnectionState::Closed, None, None, out);
        self.channels.on_closed(info.clone(), &mut self.timers, out);
        self.fail_unacked(&info, out);
        self.finish_authorize(Err(info), out);
        self.clear_session();
        self.recover = None;
    }

    fn cancel_connection_timers(&mut self, out: &mut Vec<Effect>) {
        for timer in [
            TimerKind::Connect,
            TimerKind::Retry,
            TimerKind::SuspendDeadline,
            TimerKind::Close,
            TimerKind::Idle,
        ] {
            self.timers.cancel(&timer, out);
        }
    }

    fn on_transport_closed(&mut self, error: Option<ErrorInfo>, now: Instant, out: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connecting => {
                let error = error.unwrap_or_else(|| {
                    ErrorInfo::transport("transport closed before CONNECTED")
                });
                self.on_attempt_failed(error, now, out);
            }
            ConnectionState::Connected => self.on_connection_lost(error, false, now, out),
            ConnectionState::Closing => self.closed(out),
            _ => {}
        }
    }

    /// The live connection went away; resume is attempted on the next cycle.
    fn on_connection_lost(
        &mut self,
        error: Option<ErrorInfo>,
        mut immediate: bool,
        now: Instant,
        out: &mut Vec<Effect>,
    ) {
        let reason = error.unwrap_or_else(|| {
            ErrorInfo::new(error_codes::DISCONNECTED, 503, "connection to server lost")
        });
        out.push(Effect::DropTransport);
        self.timers.cancel(&TimerKind::Idle, out);
        self.phase = Phase::Idle;

        match reason.kind() {
            FailureKind::Fatal => {
                self.fail(reason, out);
                return;
            }
            FailureKind::Credential => {
                self.force_credential = true;
                if !self.scheduler.note_credential_failure() {
                    self.fail(reason, out);
                    return;
                }
                // Reconnect with a renewed token straight away.
                immediate = true;
            }
            FailureKind::Host | FailureKind::Cancelled => {}
        }

        self.scheduler.begin_cycle(now);
        self.arm_suspend_deadline(now, out);

        let delay = if immediate {
            Duration::ZERO
        } else {
            self.config.disconnected_retry_timeout
        };
        self.timers.start(TimerKind::Retry, delay, out);
        self.transition(ConnectionState::Disconnected, Some(reason.clone()), Some(delay), out);
        self.channels
            .on_interrupted(Some(reason), &mut self.timers, out);
    }

    fn on_timer(&mut self, timer: TimerKind, now: Instant, out: &mut Vec<Effect>) {
        match timer {
            TimerKind::Connect => {
                if self.state == ConnectionState::Connecting {
                    let error = ErrorInfo::timeout("connection attempt timed out");
                    self.on_attempt_failed(error, now, out);
                }
            }
            TimerKind::Retry => match self.state {
                ConnectionState::Disconnected => {
                    let host = self.scheduler.current_host().to_string();
                    self.start_attempt(host, out);
                }
                ConnectionState::Suspended => {
                    let host = self.scheduler.begin_cycle(now);
                    self.start_attempt(host, out);
                }
                _ => {}
            },
            TimerKind::SuspendDeadline => {
                if !self.suspended_mode
                    && matches!(
                        self.state,
                        ConnectionState::Disconnected | ConnectionState::Connecting
                    )
                {
                    let reason = self.error_reason.clone().unwrap_or_else(|| {
                        ErrorInfo::new(
                            error_codes::CONNECTION_SUSPENDED,
                            503,
                            "unable to connect within the connection state TTL",
                        )
                    });
                    self.suspend(reason, out);
                }
            }
            TimerKind::Close => {
                if self.state == ConnectionState::Closing {
                    tracing::warn!("Close handshake timed out");
                    out.push(Effect::DropTransport);
                    self.closed(out);
                }
            }
            TimerKind::Idle => {
                if self.is_connected() {
                    let error = ErrorInfo::new(
                        error_codes::DISCONNECTED,
                        503,
                        "no activity from server within the idle interval",
                    );
                    self.on_connection_lost(Some(error), false, now, out);
                }
            }
            TimerKind::ChannelAttach(name) => {
                self.channels.on_attach_timeout(&name, &mut self.timers, out)
            }
            TimerKind::ChannelDetach(name) => self.channels.on_detach_timeout(&name, out),
            TimerKind::ChannelRetry(name) => {
                let connected = self.is_connected();
                self.channels
                    .on_retry(&name, connected, &mut self.timers, out);
            }
        }
    }

    // ---- inbound frames ----

    fn on_frame(&mut self, frame: ProtocolMessage, now: Instant, out: &mut Vec<Effect>) {
        if self.is_connected()
            && let Some(idle) = self.idle_timeout
        {
            self.timers.start(TimerKind::Idle, idle, out);
        }
        if let Some(serial) = frame.connection_serial {
            self.connection_serial = serial;
        }

        match self.router.route(&frame) {
            Route::Heartbeat | Route::Ignored(_) => {}
            Route::Ack {
                serial,
                count,
                error,
            } => self.resolve_acks(serial, count, error, out),
            Route::Connection(Action::Connected) => self.on_connected(frame, now, out),
            Route::Connection(Action::Disconnected) => {
                let error = frame.error;
                match self.state {
                    ConnectionState::Connecting => {
                        let error = error.unwrap_or_else(|| {
                            ErrorInfo::transport("server refused the connection")
                        });
                        self.on_attempt_failed(error, now, out);
                    }
                    // The server asked us to go away; reconnecting straight
                    // away is allowed.
                    ConnectionState::Connected => self.on_connection_lost(error, true, now, out),
                    _ => {}
                }
            }
            Route::Connection(Action::Closed) => match self.state {
                ConnectionState::Closing => self.closed(out),
                ConnectionState::Connected | ConnectionState::Connecting => {
                    self.on_transport_closed(frame.error, now, out)
                }
                _ => {}
            },
            Route::Connection(Action::Error) => {
                let error = frame.error.unwrap_or_else(|| {
                    ErrorInfo::new(error_codes::INTERNAL_ERROR, 500, "unspecified server error")
                });
                match self.state {
                    ConnectionState::Connecting => self.on_attempt_failed(error, now, out),
                    ConnectionState::Connected => self.on_connection_lost(Some(error), false, now, out),
                    ConnectionState::Closing => self.closed(out),
                    _ => {}
                }
            }
            Route::Connection(Action::Auth) => {
                if self.is_connected() && self.token_auth && !self.reauth_pending {
                    tracing::info!("Server requested re-authentication");
                    self.request_reauth(out);
                }
            }
            Route::Connection(other) => tracing::debug!("Unhandled connection frame {}", other),
            Route::Channel { channel, action } => self.on_channel_frame(channel, action, frame, out),
        }
    }

    fn on_channel_frame(
        &mut self,
        channel: String,
        action: Action,
        frame: ProtocolMessage,
        out: &mut Vec<Effect>,
    ) {
        match action {
            Action::Attached => {
                let flushed = self
                    .channels
                    .on_attached(&channel, &frame, &mut self.timers, out);
                if !flushed.is_empty() {
                    tracing::debug!("Flushing {} queued messages on '{}'", flushed.len(), channel);
                }
                for pending in flushed {
                    self.send_message(pending, out);
                }
            }
            Action::Detached => {
                let connected = self.is_connected();
                self.channels
                    .on_detached(&channel, frame.error, connected, &mut self.timers, out);
            }
            Action::Error => {
                let error = frame.error.unwrap_or_else(|| {
                    ErrorInfo::new(error_codes::CHANNEL_OPERATION_FAILED, 400, "channel error")
                });
                self.channels
                    .on_channel_error(&channel, error, &mut self.timers, out);
            }
            Action::Message => {
                if self.channels.state(&channel) == ChannelState::Attached {
                    out.push(Effect::Deliver {
                        channel,
                        messages: frame.messages,
                    });
                } else {
                    tracing::debug!("Dropping message for non-attached channel '{}'", channel);
                }
            }
            other => tracing::debug!("Unhandled channel frame {} for '{}'", other, channel),
        }
    }

    fn on_connected(&mut self, frame: ProtocolMessage, now: Instant, out: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                // Reply to an in-place AUTH, or refreshed connection details.
                self.apply_connection_details(&frame, out);
                self.finish_authorize(Ok(()), out);
                self.emit_update(frame.error, out);
                return;
            }
            _ => {
                tracing::debug!("Ignoring CONNECTED while {}", self.state);
                return;
            }
        }

        self.timers.cancel(&TimerKind::Connect, out);
        self.timers.cancel(&TimerKind::SuspendDeadline, out);
        self.timers.cancel(&TimerKind::Retry, out);
        self.phase = Phase::Idle;
        self.suspended_mode = false;
        self.suspend_deadline = None;
        self.scheduler.on_connected(now);

        let resumed = frame.error.is_none()
            && match &self.attempt_continuity {
                Continuity::Fresh => false,
                Continuity::Resume { .. } => {
                    self.connection_id.is_none() || frame.connection_id == self.connection_id
                }
                Continuity::Recover(_) => true,
            };
        if let Continuity::Recover(key) = &self.attempt_continuity {
            self.msg_serial = if resumed { key.msg_serial } else { 0 };
        } else if !resumed {
            self.msg_serial = 0;
        }
        self.recover = None;

        self.connection_id = frame.connection_id.clone();
        self.connection_key = frame.effective_connection_key().map(str::to_string);
        if !resumed {
            self.connection_serial = frame.connection_serial.unwrap_or(-1);
        }
        self.apply_connection_details(&frame, out);

        if resumed {
            tracing::info!("Resumed connection {:?}", self.connection_id);
        } else if !matches!(self.attempt_continuity, Continuity::Fresh) {
            tracing::warn!(
                "Could not resume previous connection; new connection {:?}",
                self.connection_id
            );
        }

        self.transition(ConnectionState::Connected, frame.error.clone(), None, out);

        // Unacknowledged messages go out first, renumbered on a new connection.
        let unacked = std::mem::take(&mut self.unacked);
        for pending in unacked {
            if resumed {
                self.write_message(pending, out);
            } else {
                self.send_message(pending, out);
            }
        }

        self.channels.on_connected(&mut self.timers, out);
        self.finish_authorize(Ok(()), out);
    }

    fn apply_connection_details(&mut self, frame: &ProtocolMessage, out: &mut Vec<Effect>) {
        let Some(details) = &frame.connection_details else {
            return;
        };
        if let Some(ttl) = details.connection_state_ttl.filter(|ttl| *ttl > 0) {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        self.idle_timeout = details
            .max_idle_interval
            .filter(|interval| *interval > 0)
            .map(|interval| Duration::from_millis(interval) + self.config.realtime_request_timeout);
        match self.idle_timeout {
            Some(idle) => self.timers.start(TimerKind::Idle, idle, out),
            None => self.timers.cancel(&TimerKind::Idle, out),
        }
    }
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RealtimeClientOptions;
    use crate::client::connection::ConnectionEvent;
    use crate::retry::HostCursor;
    use crate::types::ConnectionDetails;

    const FALLBACKS: [&str; 3] = ["fb-1", "fb-2", "fb-3"];

    struct Harness {
        machine: ConnectionStateMachine,
        now: Instant,
        effects: Vec<Effect>,
        timers: Vec<(TimerKind, u64, Instant)>,
    }

    impl Harness {
        fn new(options: RealtimeClientOptions) -> Self {
            Self::with_auth(options, false)
        }

        fn with_auth(options: RealtimeClientOptions, token_auth: bool) -> Self {
            let config = Arc::new(ClientConfig::resolve(&options).unwrap());
            let cursor = HostCursor::with_order(
                "primary",
                FALLBACKS.iter().map(|h| h.to_string()).collect(),
                config.fallback_retry_timeout,
            );
            let scheduler = RetryScheduler::new(cursor, &config);
            Self {
                machine: ConnectionStateMachine::new(config, scheduler, token_auth),
                now: Instant::now(),
                effects: Vec::new(),
                timers: Vec::new(),
            }
        }

        fn feed(&mut self, input: Input) -> Vec<Effect> {
            let effects = self.machine.handle(input, self.now);
            for effect in &effects {
                match effect {
                    Effect::StartTimer { timer, token, delay } => {
                        self.timers.retain(|(t, _, _)| t != timer);
                        self.timers.push((timer.clone(), *token, self.now + *delay));
                    }
                    Effect::CancelTimer(timer) => self.timers.retain(|(t, _, _)| t != timer),
                    _ => {}
                }
            }
            let recorded: Vec<Effect> = effects.iter().map(clone_effect).collect();
            self.effects.extend(recorded);
            effects
        }

        /// Advances the clock, firing due timers in deadline order.
        fn advance(&mut self, by: Duration) {
            let target = self.now + by;
            loop {
                let next = self
                    .timers
                    .iter()
                    .filter(|(_, _, at)| *at <= target)
                    .min_by_key(|(_, _, at)| *at)
                    .cloned();
                let Some((timer, token, at)) = next else { break };
                self.timers.retain(|(t, _, _)| *t != timer);
                self.now = at;
                self.feed(Input::TimerFired { timer, token });
            }
            self.now = target;
        }

        fn state(&self) -> ConnectionState {
            self.machine.state()
        }

        fn current_generation(&self) -> u64 {
            self.machine.generation()
        }

        fn grant(&mut self) -> Vec<Effect> {
            let generation = self.current_generation();
            self.feed(Input::CredentialObtained {
                generation,
                result: Ok(ConnectAuth::Key("app.key:secret".into())),
            })
        }

        fn open_and_connect(&mut self, frame: ProtocolMessage) -> Vec<Effect> {
            let generation = self.current_generation();
            self.grant();
            self.feed(Input::TransportOpened { generation });
            self.feed(Input::Frame { generation, frame })
        }

        fn refuse(&mut self) {
            let generation = self.current_generation();
            self.grant();
            self.feed(Input::DialFailed {
                generation,
                error: ErrorInfo::transport("connection refused"),
            });
        }

        fn dialed_hosts(&self) -> Vec<String> {
            self.effects
                .iter()
                .filter_map(|effect| match effect {
                    Effect::Dial { url, .. } => url.host_str().map(str::to_string),
                    _ => None,
                })
                .collect()
        }

        fn changes(&self) -> Vec<ConnectionStateChange> {
            self.effects
                .iter()
                .filter_map(|effect| match effect {
                    Effect::ConnectionChanged(change) => Some(change.clone()),
                    _ => None,
                })
                .collect()
        }

        fn states(&self) -> Vec<ConnectionState> {
            self.changes()
                .into_iter()
                .filter(|change| change.event != ConnectionEvent::Update)
                .map(|change| change.current)
                .collect()
        }
    }

    fn clone_effect(effect: &Effect) -> Effect {
        match effect {
            Effect::FetchCredential { generation, force } => Effect::FetchCredential {
                generation: *generation,
                force: *force,
            },
            Effect::Dial { generation, url } => Effect::Dial {
                generation: *generation,
                url: url.clone(),
            },
            Effect::AbortAttempt => Effect::AbortAttempt,
            Effect::Send(frame) => Effect::Send(frame.clone()),
            Effect::CloseTransport => Effect::CloseTransport,
            Effect::DropTransport => Effect::DropTransport,
            Effect::StartTimer { timer, token, delay } => Effect::StartTimer {
                timer: timer.clone(),
                token: *token,
                delay: *delay,
            },
            Effect::CancelTimer(timer) => Effect::CancelTimer(timer.clone()),
            Effect::ConnectionChanged(change) => Effect::ConnectionChanged(change.clone()),
            Effect::ChannelChanged { channel, change } => Effect::ChannelChanged {
                channel: channel.clone(),
                change: change.clone(),
            },
            Effect::Complete { completion, result } => Effect::Complete {
                completion: *completion,
                result: result.clone(),
            },
            Effect::Deliver { channel, messages } => Effect::Deliver {
                channel: channel.clone(),
                messages: messages.clone(),
            },
        }
    }

    fn key_options() -> RealtimeClientOptions {
        RealtimeClientOptions {
            key: Some("app.key:secret".to_string()),
            ..Default::default()
        }
    }

    fn connected_frame(id: &str, key: &str) -> ProtocolMessage {
        let mut frame = ProtocolMessage::new(Action::Connected);
        frame.connection_id = Some(id.to_string());
        frame.connection_key = Some(key.to_string());
        frame.connection_serial = Some(-1);
        frame
    }

    fn completion_results(effects: &[Effect]) -> Vec<(CompletionId, bool)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Complete { completion, result } => Some((*completion, result.is_ok())),
                _ => None,
            })
            .collect()
    }

    fn sent_frames(effects: &[Effect]) -> Vec<ProtocolMessage> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_and_handshake() {
        let mut h = Harness::new(key_options());
        let effects = h.feed(Input::Connect);
        assert_eq!(h.state(), ConnectionState::Connecting);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::FetchCredential { generation: 1, force: false })));

        h.open_and_connect(connected_frame("conn-1", "key-1"));
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.dialed_hosts(), vec!["primary"]);
        assert_eq!(
            h.machine.recovery_key().unwrap().to_string(),
            "key-1:-1:0"
        );
        assert_eq!(
            h.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn test_state_depends_only_on_event_order() {
        let run = || {
            let mut h = Harness::new(key_options());
            h.feed(Input::Connect);
            h.refuse();
            h.advance(Duration::from_secs(15));
            h.open_and_connect(connected_frame("c", "k"));
            let generation = h.current_generation();
            h.feed(Input::TransportClosed {
                generation,
                error: None,
            });
            h.advance(Duration::from_secs(15));
            h.open_and_connect(connected_frame("c", "k"));
            (h.states(), h.dialed_hosts())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_host_failures_walk_fallbacks_then_suspend_at_deadline() {
        let mut h = Harness::new(key_options());
        let start = h.now;
        h.feed(Input::Connect);
        h.refuse();
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.changes().last().unwrap().retry_in,
            Some(Duration::from_secs(15))
        );

        // Every retry is refused until the deadline passes.
        let mut suspended_at = None;
        for _ in 0..20 {
            h.advance(Duration::from_secs(15));
            if h.state() == ConnectionState::Suspended {
                suspended_at = Some(h.now);
                break;
            }
            h.refuse();
        }

        let hosts = h.dialed_hosts();
        assert_eq!(&hosts[..4], &["primary", "fb-1", "fb-2", "fb-3"]);
        assert_eq!(hosts[4], "primary");
        assert_eq!(suspended_at.unwrap() - start, Duration::from_secs(120));

        let suspensions = h
            .states()
            .into_iter()
            .filter(|s| *s == ConnectionState::Suspended)
            .count();
        assert_eq!(suspensions, 1);
    }

    #[test]
    fn test_suspended_retries_on_longer_cadence() {
        let mut h = Harness::new(RealtimeClientOptions {
            connection_state_ttl: Some(Duration::from_secs(20)),
            ..key_options()
        });
        h.feed(Input::Connect);
        h.refuse();
        h.advance(Duration::from_secs(20));
        assert_eq!(h.state(), ConnectionState::Suspended);
        assert_eq!(
            h.changes().last().unwrap().retry_in,
            Some(Duration::from_secs(30))
        );

        h.advance(Duration::from_secs(29));
        assert_eq!(h.state(), ConnectionState::Suspended);
        h.advance(Duration::from_secs(1));
        assert_eq!(h.state(), ConnectionState::Connecting);

        // A fresh cycle starts at the primary host.
        h.refuse();
        assert_eq!(h.state(), ConnectionState::Suspended);
        assert_eq!(h.dialed_hosts().last().unwrap(), "primary");
    }

    #[test]
    fn test_credential_failures_stay_on_host_then_fail() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        for _ in 0..4 {
            let generation = h.current_generation();
            h.feed(Input::CredentialObtained {
                generation,
                result: Err(ErrorInfo::new(error_codes::TOKEN_EXPIRED, 401, "expired")),
            });
            if h.state() == ConnectionState::Failed {
                break;
            }
            assert_eq!(h.state(), ConnectionState::Disconnected);
            h.advance(Duration::from_secs(10));
            assert!(h
                .effects
                .iter()
                .rev()
                .any(|e| matches!(e, Effect::FetchCredential { force: true, .. })));
        }
        assert_eq!(h.state(), ConnectionState::Failed);
        assert!(h.dialed_hosts().is_empty());
    }

    #[test]
    fn test_fatal_error_fails_connection() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        let frame = ProtocolMessage::new(Action::Error)
            .with_error(ErrorInfo::new(error_codes::INVALID_CREDENTIALS, 401, "invalid key"));
        h.open_and_connect(frame);
        assert_eq!(h.state(), ConnectionState::Failed);
        assert_eq!(
            h.machine.snapshot().error_reason.unwrap().code,
            error_codes::INVALID_CREDENTIALS
        );
        assert!(h.machine.recovery_key().is_none());
    }

    #[test]
    fn test_resume_keeps_recovery_key_and_resends_unacked() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("conn-1", "key-1"));
        h.feed(Input::Attach {
            channel: "news".into(),
            completion: None,
        });
        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::for_channel(Action::Attached, "news"),
        });
        h.feed(Input::Publish {
            channel: "news".into(),
            messages: vec![Message::new("greeting", serde_json::json!("hi"))],
            completion: 10,
        });
        let before = h.machine.recovery_key().unwrap();
        assert_eq!(before.msg_serial, 1);

        h.feed(Input::TransportClosed {
            generation,
            error: Some(ErrorInfo::transport("reset")),
        });
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(h.machine.snapshot().channels["news"], ChannelState::Suspended);

        h.advance(Duration::from_secs(15));
        let dial = h.grant();
        let url = dial
            .iter()
            .find_map(|e| match e {
                Effect::Dial { url, .. } => Some(url.clone()),
                _ => None,
            })
            .unwrap();
        let query: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into(), v.into())).collect();
        assert!(query.contains(&("resume".into(), "key-1".into())));
        assert!(query.contains(&("connectionSerial".into(), "-1".into())));

        let generation = h.current_generation();
        h.feed(Input::TransportOpened { generation });
        let effects = h.feed(Input::Frame {
            generation,
            frame: connected_frame("conn-1", "key-1"),
        });
        assert_eq!(h.machine.recovery_key().unwrap(), before);

        let sent = sent_frames(&effects);
        assert_eq!(sent[0].action, Action::Message);
        assert_eq!(sent[0].msg_serial, Some(0));
        assert_eq!(sent[1].action, Action::Attach);

        let effects = h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::for_channel(Action::Attached, "news"),
        });
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ChannelChanged { change, .. } if change.current == ChannelState::Attached
        )));

        let effects = h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Ack).with_msg_serial(0),
        });
        assert_eq!(completion_results(&effects), vec![(10, true)]);
    }

    #[test]
    fn test_failed_resume_renumbers_unacked() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("conn-1", "key-1"));
        h.feed(Input::Attach {
            channel: "a".into(),
            completion: None,
        });
        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::for_channel(Action::Attached, "a"),
        });
        for completion in 0..3 {
            h.feed(Input::Publish {
                channel: "a".into(),
                messages: Vec::new(),
                completion,
            });
        }
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Ack).with_msg_serial(0),
        });
        h.feed(Input::TransportClosed {
            generation,
            error: None,
        });
        h.advance(Duration::from_secs(15));

        let mut frame = connected_frame("conn-2", "key-2");
        frame.error = Some(ErrorInfo::new(80008, 400, "unable to resume"));
        let effects = h.open_and_connect(frame);
        let serials: Vec<_> = sent_frames(&effects)
            .iter()
            .filter(|f| f.action == Action::Message)
            .map(|f| f.msg_serial)
            .collect();
        assert_eq!(serials, vec![Some(0), Some(1)]);
        assert_eq!(h.machine.recovery_key().unwrap().connection_key, "key-2");
    }

    #[test]
    fn test_server_disconnect_allows_immediate_retry() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("c", "k"));
        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Disconnected),
        });
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(h.changes().last().unwrap().retry_in, Some(Duration::ZERO));

        h.advance(Duration::ZERO);
        assert_eq!(h.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_no_queueing_publish_while_disconnected_fails_immediately() {
        let mut h = Harness::new(RealtimeClientOptions {
            no_queueing: true,
            ..key_options()
        });
        h.feed(Input::Connect);
        h.refuse();
        assert_eq!(h.state(), ConnectionState::Disconnected);

        let effects = h.feed(Input::Publish {
            channel: "a".into(),
            messages: vec![Message::new("x", serde_json::Value::Null)],
            completion: 1,
        });
        assert_eq!(completion_results(&effects), vec![(1, false)]);
        assert_eq!(h.machine.queued_messages(), 0);
    }

    #[test]
    fn test_queued_publish_flushes_after_attach() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Publish {
            channel: "a".into(),
            messages: vec![Message::new("x", serde_json::Value::Null)],
            completion: 1,
        });
        assert_eq!(h.machine.queued_messages(), 1);

        h.feed(Input::Connect);
        let effects = h.open_and_connect(connected_frame("c", "k"));
        assert_eq!(sent_frames(&effects)[0].action, Action::Attach);

        let generation = h.current_generation();
        let effects = h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::for_channel(Action::Attached, "a"),
        });
        let sent = sent_frames(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_serial, Some(0));
        assert_eq!(h.machine.queued_messages(), 0);
        assert_eq!(h.machine.unacked_messages(), 1);
    }

    #[test]
    fn test_close_from_connected_waits_for_closed() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("c", "k"));

        let effects = h.feed(Input::Close);
        assert_eq!(h.state(), ConnectionState::Closing);
        assert_eq!(sent_frames(&effects)[0].action, Action::Close);

        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Closed),
        });
        assert_eq!(h.state(), ConnectionState::Closed);
        assert!(h.machine.recovery_key().is_none());
    }

    #[test]
    fn test_close_times_out() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("c", "k"));
        h.feed(Input::Close);
        h.advance(Duration::from_secs(30));
        assert_eq!(h.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_discards_late_results() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        let stale = h.current_generation();
        h.feed(Input::Close);
        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Closing,
                ConnectionState::Closed
            ]
        );

        let effects = h.feed(Input::CredentialObtained {
            generation: stale,
            result: Ok(ConnectAuth::Key("app.key:secret".into())),
        });
        assert!(effects.is_empty());
        assert_eq!(h.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_from_failed_is_a_no_op_and_connect_restarts() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        let generation = h.current_generation();
        h.feed(Input::CredentialObtained {
            generation,
            result: Err(ErrorInfo::new(40101, 401, "bad key")),
        });
        assert_eq!(h.state(), ConnectionState::Failed);

        assert!(h.feed(Input::Close).is_empty());
        h.feed(Input::Connect);
        assert_eq!(h.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_idle_server_is_treated_as_disconnect() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        let mut frame = connected_frame("c", "k");
        frame.connection_details = Some(ConnectionDetails {
            max_idle_interval: Some(15_000),
            ..Default::default()
        });
        h.open_and_connect(frame);

        h.advance(Duration::from_secs(20));
        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Heartbeat),
        });
        h.advance(Duration::from_secs(24));
        assert_eq!(h.state(), ConnectionState::Connected);

        h.advance(Duration::from_secs(1));
        assert_eq!(h.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_timeout_counts_as_host_failure() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.grant();
        h.advance(Duration::from_secs(10));
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.changes().last().unwrap().reason.as_ref().unwrap().code,
            error_codes::TIMEOUT
        );
        h.advance(Duration::from_secs(15));
        h.grant();
        assert_eq!(h.dialed_hosts(), vec!["primary", "fb-1"]);
    }

    #[test]
    fn test_authorize_sends_auth_and_reports_update() {
        let mut h = Harness::with_auth(key_options(), true);
        h.feed(Input::Connect);
        let generation = h.current_generation();
        h.feed(Input::CredentialObtained {
            generation,
            result: Ok(ConnectAuth::Token("t1".into())),
        });
        h.feed(Input::TransportOpened { generation });
        h.feed(Input::Frame {
            generation,
            frame: connected_frame("c", "k"),
        });

        let effects = h.feed(Input::Authorize { completion: 5 });
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::FetchCredential { force: true, .. })));

        let effects = h.feed(Input::CredentialObtained {
            generation,
            result: Ok(ConnectAuth::Token("t2".into())),
        });
        let auth = &sent_frames(&effects)[0];
        assert_eq!(auth.action, Action::Auth);
        assert_eq!(auth.auth.as_ref().unwrap().access_token, "t2");

        let effects = h.feed(Input::Frame {
            generation,
            frame: connected_frame("c", "k"),
        });
        assert_eq!(completion_results(&effects), vec![(5, true)]);
        let change = h.changes().pop().unwrap();
        assert_eq!(change.event, ConnectionEvent::Update);
        assert_eq!(change.current, ConnectionState::Connected);
    }

    #[test]
    fn test_recover_key_is_used_once() {
        let mut h = Harness::new(RealtimeClientOptions {
            recover: Some("old-key:4:9".to_string()),
            ..key_options()
        });
        h.feed(Input::Connect);
        let effects = h.grant();
        let url = effects
            .iter()
            .find_map(|e| match e {
                Effect::Dial { url, .. } => Some(url.clone()),
                _ => None,
            })
            .unwrap();
        assert!(url.query_pairs().any(|(k, v)| k == "recover" && v == "old-key"));

        let generation = h.current_generation();
        h.feed(Input::TransportOpened { generation });
        h.feed(Input::Frame {
            generation,
            frame: connected_frame("new", "old-key"),
        });
        assert_eq!(h.machine.recovery_key().unwrap().msg_serial, 9);
    }

    #[test]
    fn test_channel_attach_requires_usable_connection() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.feed(Input::Close);
        let effects = h.feed(Input::Attach {
            channel: "a".into(),
            completion: Some(3),
        });
        assert_eq!(completion_results(&effects), vec![(3, false)]);
    }

    #[test]
    fn test_messages_delivered_only_when_attached() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("c", "k"));
        let generation = h.current_generation();
        let message_frame = ProtocolMessage::for_channel(Action::Message, "a")
            .with_messages(vec![Message::new("n", serde_json::json!(1))]);

        let effects = h.feed(Input::Frame {
            generation,
            frame: message_frame.clone(),
        });
        assert!(!effects.iter().any(|e| matches!(e, Effect::Deliver { .. })));

        h.feed(Input::Attach {
            channel: "a".into(),
            completion: None,
        });
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::for_channel(Action::Attached, "a"),
        });
        let effects = h.feed(Input::Frame {
            generation,
            frame: message_frame,
        });
        assert!(effects.iter().any(|e| matches!(e, Effect::Deliver { channel, .. } if channel == "a")));
    }

    #[test]
    fn test_cancelled_dial_counts_as_host_failure() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        let generation = h.current_generation();
        h.grant();
        h.feed(Input::DialFailed {
            generation,
            error: ErrorInfo::cancelled(),
        });
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(h.changes().last().unwrap().retry_in, Some(Duration::from_secs(15)));

        h.advance(Duration::from_secs(15));
        assert_eq!(h.state(), ConnectionState::Connecting);
        h.grant();
        assert_eq!(h.dialed_hosts(), vec!["primary", "fb-1"]);
    }

    #[test]
    fn test_token_error_on_live_connection_reconnects_immediately() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("c", "k"));
        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Error)
                .with_error(ErrorInfo::new(error_codes::TOKEN_EXPIRED, 401, "token expired")),
        });
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(h.changes().last().unwrap().retry_in, Some(Duration::ZERO));

        h.advance(Duration::ZERO);
        assert_eq!(h.state(), ConnectionState::Connecting);
        assert!(h
            .effects
            .iter()
            .rev()
            .any(|e| matches!(e, Effect::FetchCredential { force: true, .. })));
    }

    #[test]
    fn test_ack_at_serial_limit_is_ignored_safely() {
        let mut h = Harness::new(key_options());
        h.feed(Input::Connect);
        h.open_and_connect(connected_frame("c", "k"));
        h.feed(Input::Attach {
            channel: "news".into(),
            completion: None,
        });
        let generation = h.current_generation();
        h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::for_channel(Action::Attached, "news"),
        });
        h.feed(Input::Publish {
            channel: "news".into(),
            messages: vec![Message::new("n", serde_json::json!(1))],
            completion: 3,
        });

        let mut ack = ProtocolMessage::new(Action::Ack).with_msg_serial(u64::MAX);
        ack.count = Some(2);
        let effects = h.feed(Input::Frame { generation, frame: ack });
        assert!(completion_results(&effects).is_empty());
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.machine.unacked_messages(), 1);

        let effects = h.feed(Input::Frame {
            generation,
            frame: ProtocolMessage::new(Action::Ack).with_msg_serial(0),
        });
        assert_eq!(completion_results(&effects), vec![(3, true)]);
    }
}
