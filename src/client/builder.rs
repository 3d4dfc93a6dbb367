use super::actor::ClientActor;
use super::core::ClientShared;
use super::options::{ClientConfig, RealtimeClientOptions};
use super::state::ConnectionStateMachine;
use super::RealtimeClient;
use crate::auth::{Authenticator, CredentialProvider};
use crate::retry::RetryScheduler;
use crate::transport::{Transport, WebSocketTransport};
use crate::types::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builder for RealtimeClient that handles initialization
pub struct RealtimeClientBuilder {
    config: Arc<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    provider: Option<Arc<dyn CredentialProvider>>,
}

impl RealtimeClientBuilder {
    /// Resolve and validate `options`
    pub fn new(options: RealtimeClientOptions) -> Result<Self> {
        let config = ClientConfig::resolve(&options)?;
        Ok(Self {
            config: Arc::new(config),
            transport: None,
            provider: None,
        })
    }

    /// Replace the websocket transport (e.g. with an in-memory one in tests)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Obtain credentials from `provider` instead of the configured auth options
    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Build the client and spawn its connection actor
    pub fn build(self) -> Result<RealtimeClient> {
        let config = self.config;
        let auth = match self.provider {
            Some(provider) => Authenticator::with_provider(Arc::clone(&config), provider)?,
            None => Authenticator::from_config(Arc::clone(&config))?,
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));

        let scheduler = RetryScheduler::from_config(&config);
        let machine =
            ConnectionStateMachine::new(Arc::clone(&config), scheduler, auth.uses_token_auth());
        let shared = Arc::new(ClientShared::new(Arc::clone(&config), machine.snapshot()));

        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = ClientActor::new(
            machine,
            Arc::new(auth),
            transport,
            Arc::clone(&shared),
            inbox,
            commands.downgrade(),
        );
        tokio::spawn(actor.run());

        let client = RealtimeClient::from_parts(commands, shared);
        if !config.no_connect {
            client.connect()?;
        }
        Ok(client)
    }
}

impl std::fmt::Debug for RealtimeClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClientBuilder")
            .field("realtime_host", &self.config.realtime_host)
            .field("custom_transport", &self.transport.is_some())
            .field("custom_provider", &self.provider.is_some())
            .finish()
    }
}
