use super::{ChannelEvent, ChannelState, ChannelStateChange, PublishHandle};
use crate::client::RealtimeClient;
use crate::client::actor::Command;
use crate::infrastructure::{EventEmitter, ListenerHandle};
use crate::types::{ErrorInfo, Message, Result, SUBSCRIPTION_BUFFER};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Subscriber {
    /// Only messages with this name, or all when `None`
    name: Option<String>,
    sender: mpsc::Sender<Message>,
}

/// Channel state as seen by handles, updated by the client actor.
pub(crate) struct ChannelShared {
    name: String,
    status: Mutex<(ChannelState, Option<ErrorInfo>)>,
    events: EventEmitter<ChannelEvent, ChannelStateChange>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChannelShared {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Mutex::new((ChannelState::Initialized, None)),
            events: EventEmitter::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn apply(&self, change: &ChannelStateChange) {
        *self.status.lock() = (change.current, change.reason.clone());
        self.events.emit(&change.event, change);
    }

    /// Fans inbound messages out to subscribers. A full subscriber loses the
    /// message rather than stalling the connection.
    pub fn deliver(&self, messages: Vec<Message>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());

        for message in messages {
            for subscriber in subscribers.iter() {
                if subscriber
                    .name
                    .as_ref()
                    .is_some_and(|name| message.name.as_ref() != Some(name))
                {
                    continue;
                }
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    subscriber.sender.try_send(message.clone())
                {
                    tracing::warn!(
                        "Subscriber on '{}' is full; dropping message {:?}",
                        self.name,
                        message.name
                    );
                }
            }
        }
    }

    fn subscribe(&self, name: Option<String>) -> mpsc::Receiver<Message> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.lock().push(Subscriber { name, sender });
        receiver
    }
}

/// A named pub/sub topic multiplexed over the client's connection.
///
/// Handles are cheap to clone and all refer to the same channel. Attach and
/// detach resolve once the server confirms; publishing before the channel is
/// attached queues the message and attaches implicitly (unless queueing is
/// disabled).
///
/// # Example
///
/// ```no_run
/// use ably_realtime_rs::{RealtimeClient, RealtimeClientOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RealtimeClient::new(RealtimeClientOptions {
///     key: Some("app.key:secret".to_string()),
///     ..Default::default()
/// })?;
///
/// let channel = client.channel("news");
/// let mut messages = channel.subscribe();
/// channel.attach().await?;
///
/// channel.publish("headline", serde_json::json!("hello"))?.await?;
/// if let Some(message) = messages.recv().await {
///     println!("{:?}: {}", message.name, message.data);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<ChannelShared>,
    client: RealtimeClient,
}

impl RealtimeChannel {
    pub(crate) fn new(shared: Arc<ChannelShared>, client: RealtimeClient) -> Self {
        Self { shared, client }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.status.lock().0
    }

    /// Reason attached to the most recent state change, if any.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.status.lock().1.clone()
    }

    /// Attaches the channel, waiting for the server's `ATTACHED`.
    ///
    /// Issued while the connection is not yet connected, the attach is sent
    /// once it is.
    pub async fn attach(&self) -> Result<()> {
        let (reply, handle) = PublishHandle::new();
        self.client.send_command(Command::Attach {
            channel: self.name().to_string(),
            reply: Some(reply),
        })?;
        handle.await
    }

    pub async fn detach(&self) -> Result<()> {
        let (reply, handle) = PublishHandle::new();
        self.client.send_command(Command::Detach {
            channel: self.name().to_string(),
            reply: Some(reply),
        })?;
        handle.await
    }

    /// Publishes a single message. See [`RealtimeClient::publish`].
    pub fn publish(&self, name: impl Into<String>, data: serde_json::Value) -> Result<PublishHandle> {
        self.publish_messages(vec![Message::new(name, data)])
    }

    pub fn publish_messages(&self, messages: Vec<Message>) -> Result<PublishHandle> {
        self.client.publish(self.name(), messages)
    }

    /// Receives every message published on the channel, attaching it if needed.
    pub fn subscribe(&self) -> mpsc::Receiver<Message> {
        self.subscribe_with(None)
    }

    /// Receives messages with the given name only.
    pub fn subscribe_to(&self, name: impl Into<String>) -> mpsc::Receiver<Message> {
        self.subscribe_with(Some(name.into()))
    }

    fn subscribe_with(&self, name: Option<String>) -> mpsc::Receiver<Message> {
        let receiver = self.shared.subscribe(name);
        if !matches!(self.state(), ChannelState::Attached | ChannelState::Attaching) {
            let attach = Command::Attach {
                channel: self.name().to_string(),
                reply: None,
            };
            if let Err(e) = self.client.send_command(attach) {
                tracing::warn!("Implicit attach of '{}' failed: {}", self.name(), e);
            }
        }
        receiver
    }

    /// Registers a state change listener; `None` listens to every event.
    pub fn on<F>(&self, event: Option<ChannelEvent>, callback: F) -> ListenerHandle
    where
        F: Fn(&ChannelStateChange) + Send + Sync + 'static,
    {
        self.shared.events.on(event, callback)
    }

    pub fn once<F>(&self, event: Option<ChannelEvent>, callback: F) -> ListenerHandle
    where
        F: Fn(&ChannelStateChange) + Send + Sync + 'static,
    {
        self.shared.events.once(event, callback)
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
