use super::{Transport, TransportConnection};
use crate::types::{ProtocolMessage, RealtimeError, Result};
use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

/// What the next dial against a [`MemoryTransport`] does.
#[derive(Debug, Clone)]
pub enum DialBehavior {
    /// Open a connection and hand its server half to the test harness.
    Accept,
    /// Fail the dial as if the TCP connection had been refused.
    Refuse(String),
    /// Never complete the dial.
    Hang,
}

struct MemoryState {
    dials: Vec<Url>,
    script: VecDeque<DialBehavior>,
    default_behavior: DialBehavior,
    accepted: mpsc::UnboundedSender<MemoryServerConnection>,
}

/// In-process transport: every accepted dial yields a [`MemoryServerConnection`]
/// through which a test plays the broker.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryServerConnection>) {
        let (accepted, incoming) = mpsc::unbounded();
        let transport = Self {
            state: Arc::new(Mutex::new(MemoryState {
                dials: Vec::new(),
                script: VecDeque::new(),
                default_behavior: DialBehavior::Accept,
                accepted,
            })),
        };
        (transport, incoming)
    }

    /// Queues the behaviour of the next unscripted dial.
    pub fn push_behavior(&self, behavior: DialBehavior) {
        self.state.lock().script.push_back(behavior);
    }

    /// Behaviour used once the script is exhausted.
    pub fn set_default_behavior(&self, behavior: DialBehavior) {
        self.state.lock().default_behavior = behavior;
    }

    pub fn dialed_urls(&self) -> Vec<Url> {
        self.state.lock().dials.clone()
    }

    pub fn dialed_hosts(&self) -> Vec<String> {
        self.state
            .lock()
            .dials
            .iter()
            .filter_map(|url| url.host_str().map(str::to_string))
            .collect()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("dials", &self.state.lock().dials.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, _protocol: &str, url: &Url) -> Result<TransportConnection> {
        let behavior = {
            let mut state = self.state.lock();
            state.dials.push(url.clone());
            match state.script.pop_front() {
                Some(behavior) => behavior,
                None => state.default_behavior.clone(),
            }
        };

        match behavior {
            DialBehavior::Refuse(reason) => Err(RealtimeError::Transport(reason)),
            DialBehavior::Hang => futures::future::pending().await,
            DialBehavior::Accept => {
                let (to_client, client_stream) = mpsc::unbounded::<Result<ProtocolMessage>>();
                let (client_sink, from_client) = mpsc::unbounded::<ProtocolMessage>();

                let server = MemoryServerConnection {
                    url: url.clone(),
                    to_client,
                    from_client,
                };
                self.state
                    .lock()
                    .accepted
                    .unbounded_send(server)
                    .map_err(|_| RealtimeError::Transport("memory server is gone".into()))?;

                let sink = client_sink
                    .sink_map_err(|e| RealtimeError::Transport(e.to_string()));
                Ok(TransportConnection {
                    sink: Box::pin(sink),
                    stream: Box::pin(client_stream),
                })
            }
        }
    }
}

/// Server half of an accepted in-memory connection.
pub struct MemoryServerConnection {
    pub url: Url,
    to_client: mpsc::UnboundedSender<Result<ProtocolMessage>>,
    from_client: mpsc::UnboundedReceiver<ProtocolMessage>,
}

impl MemoryServerConnection {
    /// Delivers a frame to the client. Returns `false` once the client is gone.
    pub fn send(&self, frame: ProtocolMessage) -> bool {
        self.to_client.unbounded_send(Ok(frame)).is_ok()
    }

    /// Breaks the connection with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self
            .to_client
            .unbounded_send(Err(RealtimeError::Transport(reason.into())));
        self.to_client.close_channel();
    }

    /// Ends the connection cleanly.
    pub fn close(&self) {
        self.to_client.close_channel();
    }

    /// Next frame written by the client; `None` once it closed its side.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.from_client.next().await
    }

    /// A frame already written by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<ProtocolMessage> {
        self.from_client.next().now_or_never().flatten()
    }

    /// Query parameter of the dialed URL.
    pub fn query(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

impl std::fmt::Debug for MemoryServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServerConnection")
            .field("url", &self.url.as_str())
            .finish()
    }
}
