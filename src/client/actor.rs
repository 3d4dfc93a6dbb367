//! The task that owns the connection state machine.
//!
//! User handles, credential fetches, dials, transport readers and timers all
//! talk to the actor through one unbounded queue, so every transition is
//! computed on a single task in arrival order. Background tasks only hold a
//! weak sender; once every client and channel handle is dropped the queue
//! closes and the actor shuts the transport down.

use super::connection::{ConnectionManager, ConnectionStateChange, TransportEvent};
use super::core::ClientShared;
use super::effect::{Effect, TimerKind};
use super::state::{ConnectionStateMachine, Input};
use crate::auth::{Authenticator, ConnectAuth};
use crate::channel::{CompletionId, CompletionSender};
use crate::infrastructure::TaskManager;
use crate::transport::{Transport, TransportConnection};
use crate::types::{Message, PROTOCOL_JSON, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Requests issued by the public handles.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Close,
    Authorize(CompletionSender),
    Attach {
        channel: String,
        reply: Option<CompletionSender>,
    },
    Detach {
        channel: String,
        reply: Option<CompletionSender>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        reply: CompletionSender,
    },
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Command(Command),
    Credential {
        generation: u64,
        result: Result<ConnectAuth>,
    },
    Dialed {
        generation: u64,
        result: Result<TransportConnection>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Timer {
        timer: TimerKind,
        token: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TaskKey {
    /// The in-flight credential fetch or dial (at most one)
    Attempt,
    Timer(TimerKind),
}

type Outbox = mpsc::WeakUnboundedSender<ActorMessage>;

fn deliver(outbox: &Outbox, message: ActorMessage) {
    match outbox.upgrade() {
        Some(sender) => {
            if sender.send(message).is_err() {
                tracing::debug!("Client actor stopped; dropping message");
            }
        }
        None => tracing::debug!("Client dropped; discarding background result"),
    }
}

pub(crate) struct ClientActor {
    machine: ConnectionStateMachine,
    auth: Arc<Authenticator>,
    transport: Arc<dyn Transport>,
    connection: ConnectionManager,
    tasks: TaskManager<TaskKey>,
    completions: HashMap<CompletionId, CompletionSender>,
    next_completion: CompletionId,
    shared: Arc<ClientShared>,
    inbox: mpsc::UnboundedReceiver<ActorMessage>,
    outbox: Outbox,
}

impl ClientActor {
    pub fn new(
        machine: ConnectionStateMachine,
        auth: Arc<Authenticator>,
        transport: Arc<dyn Transport>,
        shared: Arc<ClientShared>,
        inbox: mpsc::UnboundedReceiver<ActorMessage>,
        outbox: Outbox,
    ) -> Self {
        Self {
            machine,
            auth,
            transport,
            connection: ConnectionManager::new(),
            tasks: TaskManager::new(),
            completions: HashMap::new(),
            next_completion: 0,
            shared,
            inbox,
            outbox,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!("Client actor started");
        while let Some(message) = self.inbox.recv().await {
            let Some(input) = self.to_input(message) else {
                continue;
            };
            let effects = self.machine.handle(input, Instant::now());
            self.execute(effects);
            self.shared.snapshot.send_replace(self.machine.snapshot());
        }

        tracing::debug!("All client handles dropped; shutting down actor");
        self.connection.drop_transport();
        self.tasks.abort_all();
    }

    fn register(&mut self, reply: CompletionSender) -> CompletionId {
        self.next_completion += 1;
        let id = self.next_completion;
        self.completions.insert(id, reply);
        id
    }

    fn to_input(&mut self, message: ActorMessage) -> Option<Input> {
        let input = match message {
            ActorMessage::Command(command) => match command {
                Command::Connect => Input::Connect,
                Command::Close => Input::Close,
                Command::Authorize(reply) => Input::Authorize {
                    completion: self.register(reply),
                },
                Command::Attach { channel, reply } => Input::Attach {
                    channel,
                    completion: reply.map(|reply| self.register(reply)),
                },
                Command::Detach { channel, reply } => Input::Detach {
                    channel,
                    completion: reply.map(|reply| self.register(reply)),
                },
                Command::Publish {
                    channel,
                    messages,
                    reply,
                } => Input::Publish {
                    channel,
                    messages,
                    completion: self.register(reply),
                },
            },
            ActorMessage::Credential { generation, result } => Input::CredentialObtained {
                generation,
                result: result.map_err(|e| e.to_error_info()),
            },
            ActorMessage::Dialed { generation, result } => match result {
                Ok(connection) => {
                    if !self.machine.accepts_transport(generation) {
                        tracing::debug!("Dropping transport from superseded attempt {}", generation);
                        return None;
                    }
                    let outbox = self.outbox.clone();
                    self.connection
                        .set_transport(generation, connection, move |generation, event| {
                            deliver(&outbox, ActorMessage::Transport { generation, event })
                        });
                    Input::TransportOpened { generation }
                }
                Err(e) => Input::DialFailed {
                    generation,
                    error: e.to_error_info(),
                },
            },
            ActorMessage::Transport { generation, event } => match event {
                TransportEvent::Frame(frame) => {
                    tracing::debug!("Received {} frame", frame.action);
                    Input::Frame { generation, frame }
                }
                TransportEvent::Closed(error) => Input::TransportClosed { generation, error },
            },
            ActorMessage::Timer { timer, token } => Input::TimerFired { timer, token },
        };
        Some(input)
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::FetchCredential { generation, force } => {
                    let auth = Arc::clone(&self.auth);
                    let outbox = self.outbox.clone();
                    self.tasks.spawn_keyed(TaskKey::Attempt, async move {
                        let result = auth.connect_auth(force).await;
                        deliver(&outbox, ActorMessage::Credential { generation, result });
                    });
                }
                Effect::Dial { generation, url } => {
                    let transport = Arc::clone(&self.transport);
                    let outbox = self.outbox.clone();
                    tracing::debug!("Dialing {}", url.host_str().unwrap_or_default());
                    self.tasks.spawn_keyed(TaskKey::Attempt, async move {
                        let result = transport.dial(PROTOCOL_JSON, &url).await;
                        deliver(&outbox, ActorMessage::Dialed { generation, result });
                    });
                }
                Effect::AbortAttempt => self.tasks.abort(&TaskKey::Attempt),
                Effect::Send(frame) => {
                    let action = frame.action;
                    if !self.connection.send(frame) {
                        tracing::debug!("No open transport; {} frame not sent", action);
                    }
                }
                Effect::CloseTransport => self.connection.close(),
                Effect::DropTransport => self.connection.drop_transport(),
                Effect::StartTimer {
                    timer,
                    token,
                    delay,
                } => {
                    let outbox = self.outbox.clone();
                    let key = TaskKey::Timer(timer.clone());
                    self.tasks.spawn_keyed(key, async move {
                        tokio::time::sleep(delay).await;
                        deliver(&outbox, ActorMessage::Timer { timer, token });
                    });
                }
                Effect::CancelTimer(timer) => self.tasks.abort(&TaskKey::Timer(timer)),
                Effect::ConnectionChanged(change) => self.emit_connection_change(&change),
                Effect::ChannelChanged { channel, change } => {
                    self.shared.channel(&channel).apply(&change);
                }
                Effect::Complete { completion, result } => {
                    match self.completions.remove(&completion) {
                        // The caller may have dropped its handle.
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => tracing::debug!("Completion {} already resolved", completion),
                    }
                }
                Effect::Deliver { channel, messages } => {
                    self.shared.channel(&channel).deliver(messages);
                }
            }
        }
    }

    fn emit_connection_change(&self, change: &ConnectionStateChange) {
        // Listeners reading the client from inside a callback see this change.
        let mut snapshot = self.machine.snapshot();
        snapshot.state = change.current;
        snapshot.error_reason = change.reason.clone();
        self.shared.snapshot.send_replace(snapshot);

        self.shared.connection_events.emit(&change.event, change);
    }
}

impl std::fmt::Debug for ClientActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientActor")
            .field("machine", &self.machine)
            .field("pending_completions", &self.completions.len())
            .finish_non_exhaustive()
    }
}
