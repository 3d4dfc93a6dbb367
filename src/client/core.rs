use super::actor::{ActorMessage, Command};
use super::connection::{ConnectionEvent, ConnectionState, ConnectionStateChange, RecoveryKey};
use super::options::{ClientConfig, RealtimeClientOptions};
use super::state::ClientSnapshot;
use super::RealtimeClientBuilder;
use crate::channel::{ChannelShared, ChannelState, PublishHandle, RealtimeChannel};
use crate::infrastructure::{EventEmitter, ListenerHandle};
use crate::types::{ErrorInfo, Message, RealtimeError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// State shared between the public handles and the client actor.
pub(crate) struct ClientShared {
    pub config: Arc<ClientConfig>,
    pub connection_events: EventEmitter<ConnectionEvent, ConnectionStateChange>,
    /// Latest view of the connection, replaced by the actor after every input
    pub snapshot: watch::Sender<ClientSnapshot>,
    channels: Mutex<HashMap<String, Arc<ChannelShared>>>,
}

impl ClientShared {
    pub fn new(config: Arc<ClientConfig>, initial: ClientSnapshot) -> Self {
        let (snapshot, _) = watch::channel(initial);
        Self {
            config,
            connection_events: EventEmitter::new(),
            snapshot,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// The channel record for `name`, created on first use.
    pub fn channel(&self, name: &str) -> Arc<ChannelShared> {
        let mut channels = self.channels.lock();
        Arc::clone(
            channels
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ChannelShared::new(name))),
        )
    }
}

/// The main entry point for interacting with the realtime service.
///
/// `RealtimeClient` owns one realtime connection. It connects (unless
/// `no_connect` is set), reconnects with host fallback when the transport
/// drops, resumes the previous session where possible and multiplexes any
/// number of [`RealtimeChannel`]s over it.
///
/// All connection work happens on a background task. Methods on the client
/// never wait for the network except where they return a future; progress
/// is observed through [`on`](Self::on) listeners, [`state`](Self::state)
/// or [`watch`](Self::watch).
///
/// Listeners run on that background task, in registration order. A slow
/// listener delays the delivery of later events.
///
/// # Example
///
/// ```no_run
/// use ably_realtime_rs::{ConnectionEvent, ConnectionState, RealtimeClient, RealtimeClientOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RealtimeClient::new(RealtimeClientOptions {
///     key: Some("app.key:secret".to_string()),
///     ..Default::default()
/// })?;
///
/// client.on(Some(ConnectionEvent::State(ConnectionState::Connected)), |change| {
///     println!("connected (was {})", change.previous);
/// });
///
/// // Later
/// client.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<ActorMessage>,
    shared: Arc<ClientShared>,
}

impl RealtimeClient {
    /// Creates a client with the default websocket transport.
    ///
    /// Must be called inside a tokio runtime. Connects straight away unless
    /// `no_connect` is set.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Config`] when the options are invalid (no
    /// authentication mechanism, malformed key or recovery key, ...).
    pub fn new(options: RealtimeClientOptions) -> Result<Self> {
        RealtimeClientBuilder::new(options)?.build()
    }

    pub fn builder(options: RealtimeClientOptions) -> Result<RealtimeClientBuilder> {
        RealtimeClientBuilder::new(options)
    }

    pub(crate) fn from_parts(
        commands: mpsc::UnboundedSender<ActorMessage>,
        shared: Arc<ClientShared>,
    ) -> Self {
        Self { commands, shared }
    }

    pub(crate) fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(ActorMessage::Command(command))
            .map_err(|_| RealtimeError::InvalidState("client has shut down".to_string()))
    }

    /// Starts connecting. Returns as soon as the request is queued.
    ///
    /// A no-op while connecting or connected. From `disconnected` or
    /// `suspended` it retries immediately instead of waiting for the timer.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidState`] while the connection is closing.
    pub fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Closing {
            return Err(RealtimeError::InvalidState(
                "cannot connect while the connection is closing".to_string(),
            ));
        }
        self.send_command(Command::Connect)
    }

    /// Closes the connection. Queued and unacknowledged publishes fail.
    pub fn close(&self) {
        if let Err(e) = self.send_command(Command::Close) {
            tracing::debug!("close() ignored: {}", e);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.borrow().state
    }

    /// Reason for the most recent state change, if it had one.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot.borrow().error_reason.clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.shared.snapshot.borrow().connection_id.clone()
    }

    /// Token for resuming this connection from another client via the
    /// `recover` option. `None` when there is no connection to resume.
    pub fn recovery_key(&self) -> Option<RecoveryKey> {
        self.shared.snapshot.borrow().recovery_key.clone()
    }

    /// Host of the current or most recent connection attempt.
    pub fn host(&self) -> Option<String> {
        self.shared.snapshot.borrow().host.clone()
    }

    /// Receiver of connection snapshots, updated after every processed event.
    pub fn watch(&self) -> watch::Receiver<ClientSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Registers a connection state listener; `None` listens to every event.
    ///
    /// A listener that panics is logged and skipped; the others still run.
    pub fn on<F>(&self, event: Option<ConnectionEvent>, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared.connection_events.on(event, callback)
    }

    /// Like [`on`](Self::on), but the listener fires at most once.
    pub fn once<F>(&self, event: Option<ConnectionEvent>, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared.connection_events.once(event, callback)
    }

    /// Obtains a fresh token and applies it to the connection.
    ///
    /// When connected the token is sent in place with an `AUTH` frame and the
    /// server's reply is reported as an `Update` event. Otherwise the client
    /// connects with the new token.
    ///
    /// # Errors
    ///
    /// Fails when the client uses basic (key) authentication, or when the
    /// token cannot be obtained or is rejected.
    pub async fn authorize(&self) -> Result<()> {
        let (reply, handle) = PublishHandle::new();
        self.send_command(Command::Authorize(reply))?;
        handle.await
    }

    /// Handle for the named channel. Every call for the same name refers to
    /// the same channel.
    pub fn channel(&self, name: &str) -> RealtimeChannel {
        RealtimeChannel::new(self.shared.channel(name), self.clone())
    }

    /// States of every channel the connection knows about.
    pub fn channels(&self) -> BTreeMap<String, ChannelState> {
        self.shared.snapshot.borrow().channels.clone()
    }

    /// Publishes `messages` on `channel` without waiting.
    ///
    /// The returned handle resolves when the server acknowledges the
    /// messages, or with the error that prevented it. On a channel that is
    /// not attached yet the messages are queued and the channel is attached;
    /// with `no_queueing` set the handle fails immediately instead.
    pub fn publish(&self, channel: &str, messages: Vec<Message>) -> Result<PublishHandle> {
        let (reply, handle) = PublishHandle::new();
        self.send_command(Command::Publish {
            channel: channel.to_string(),
            messages,
            reply,
        })?;
        Ok(handle)
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.shared.snapshot.borrow();
        f.debug_struct("RealtimeClient")
            .field("state", &snapshot.state)
            .field("connection_id", &snapshot.connection_id)
            .finish()
    }
}
