use crate::transport::TransportConnection;
use crate::types::{ErrorInfo, ProtocolMessage, RealtimeError, Result};
use futures::{SinkExt, StreamExt};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events a connection listener can filter on: every state plus `Update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    State(ConnectionState),
    /// Emitted without a state change, e.g. after an in-place re-auth or a
    /// `CONNECTED` that did not resume the previous connection.
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        Self::State(state)
    }
}

/// Immutable record emitted to listeners on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub event: ConnectionEvent,
    pub retry_in: Option<Duration>,
    pub reason: Option<ErrorInfo>,
}

impl ConnectionStateChange {
    pub fn new(previous: ConnectionState, current: ConnectionState) -> Self {
        Self {
            previous,
            current,
            event: ConnectionEvent::State(current),
            retry_in: None,
            reason: None,
        }
    }

    pub fn update(current: ConnectionState, reason: Option<ErrorInfo>) -> Self {
        Self {
            previous: current,
            current,
            event: ConnectionEvent::Update,
            retry_in: None,
            reason,
        }
    }

    pub fn with_reason(mut self, reason: Option<ErrorInfo>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_retry_in(mut self, retry_in: Option<Duration>) -> Self {
        self.retry_in = retry_in;
        self
    }
}

/// Opaque resumption token: `connectionKey:connectionSerial:msgSerial`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKey {
    pub connection_key: String,
    pub connection_serial: i64,
    pub msg_serial: u64,
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.connection_key, self.connection_serial, self.msg_serial
        )
    }
}

impl FromStr for RecoveryKey {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RealtimeError::Config(format!("invalid recovery key '{s}'"));

        // The connection key itself may contain ':'; serials are the last two fields.
        let mut parts = s.rsplitn(3, ':');
        let msg_serial = parts.next().ok_or_else(invalid)?;
        let connection_serial = parts.next().ok_or_else(invalid)?;
        let connection_key = parts.next().filter(|key| !key.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            connection_key: connection_key.to_string(),
            connection_serial: connection_serial.parse().map_err(|_| invalid())?,
            msg_serial: msg_serial.parse().map_err(|_| invalid())?,
        })
    }
}

/// Input produced by the reader/writer tasks of a live transport.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Frame(ProtocolMessage),
    /// The transport ended; `None` for a clean close.
    Closed(Option<ErrorInfo>),
}

enum WriterCommand {
    Frame(ProtocolMessage),
    Close,
}

/// Owns the currently open transport (at most one) and its I/O tasks.
pub(crate) struct ConnectionManager {
    generation: u64,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            generation: 0,
            writer: None,
            reader: None,
        }
    }

    /// Installs a freshly dialed transport for `generation`, spawning its reader
    /// and writer. Events are tagged with the generation so a superseded
    /// transport can never influence the state machine.
    pub fn set_transport<F>(&mut self, generation: u64, connection: TransportConnection, on_event: F)
    where
        F: Fn(u64, TransportEvent) + Send + Sync + Clone + 'static,
    {
        self.drop_transport();

        let TransportConnection {
            mut sink,
            mut stream,
        } = connection;
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();

        let writer_events = on_event.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Frame(frame) => {
                        tracing::debug!("Sending {} frame", frame.action);
                        if let Err(e) = sink.send(frame).await {
                            tracing::warn!("Transport write failed: {}", e);
                            writer_events(
                                generation,
                                TransportEvent::Closed(Some(e.to_error_info())),
                            );
                            return;
                        }
                    }
                    WriterCommand::Close => break,
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("Transport close returned error: {}", e);
            }
        });

        let reader = tokio::spawn(async move {
            tracing::debug!("Starting read task for generation {}", generation);
            loop {
                match stream.next().await {
                    Some(Ok(frame)) => on_event(generation, TransportEvent::Frame(frame)),
                    Some(Err(e)) => {
                        tracing::warn!("Transport read error: {}", e);
                        on_event(generation, TransportEvent::Closed(Some(e.to_error_info())));
                        break;
                    }
                    None => {
                        on_event(generation, TransportEvent::Closed(None));
                        break;
                    }
                }
            }
            tracing::debug!("Read task for generation {} finished", generation);
        });

        self.generation = generation;
        self.writer = Some(tx);
        self.reader = Some(reader);
    }

    pub fn generation(&self) -> Option<u64> {
        self.writer.as_ref().map(|_| self.generation)
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Queues a frame on the writer. Returns `false` when no transport is open.
    pub fn send(&self, frame: ProtocolMessage) -> bool {
        self.writer
            .as_ref()
            .is_some_and(|writer| writer.send(WriterCommand::Frame(frame)).is_ok())
    }

    /// Flushes queued frames, then closes the sink gracefully.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.send(WriterCommand::Close);
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Abandons the transport without a close handshake.
    pub fn drop_transport(&mut self) {
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
