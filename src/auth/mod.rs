//! Credential acquisition.
//!
//! The connection machinery only ever asks for a [`ConnectAuth`]: either the
//! basic key or a token string. Everything about where that token comes from
//! (static token, callback, auth URL, token request exchange) lives here.

mod provider;
mod token;

pub use provider::{
    AuthCallback, AuthMethod, AuthUrlProvider, CallbackProvider, CredentialProvider,
    StaticProvider,
};
pub use token::{ApiKey, Credential, TokenDetails, TokenParams, TokenRequest};

use crate::client::ClientConfig;
use crate::infrastructure::RestClient;
use crate::types::{ErrorInfo, RealtimeError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// How the next connection attempt authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectAuth {
    /// Basic auth with the full `name:secret` key
    Key(String),
    /// Token auth
    Token(String),
}

impl std::fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(_) => f.write_str("Key(***)"),
            Self::Token(_) => f.write_str("Token(***)"),
        }
    }
}

enum Mode {
    Basic(ApiKey),
    /// Tokens requested from the REST API using the key for basic auth
    KeyTokens(ApiKey),
    Provider(Arc<dyn CredentialProvider>),
}

/// Resolves credentials for connection attempts and caches the current token.
pub struct Authenticator {
    mode: Mode,
    rest: RestClient,
    default_params: TokenParams,
    current: Mutex<Option<TokenDetails>>,
}

impl Authenticator {
    pub fn from_config(config: Arc<ClientConfig>) -> Result<Self> {
        let rest = RestClient::new(Arc::clone(&config))?;

        let mode = if let Some(callback) = &config.auth_callback {
            Mode::Provider(Arc::new(CallbackProvider::new(callback.clone())))
        } else if let Some(url) = &config.auth_url {
            Mode::Provider(Arc::new(AuthUrlProvider::new(
                rest.clone(),
                url.clone(),
                config.auth_method,
                config.auth_headers.clone(),
                config.auth_params.clone(),
            )))
        } else if let Some(details) = &config.token_details {
            Mode::Provider(Arc::new(StaticProvider::new(details.clone())))
        } else if let Some(token) = &config.token {
            Mode::Provider(Arc::new(StaticProvider::new(token.clone())))
        } else if let Some(key) = &config.key {
            if config.use_token_auth {
                Mode::KeyTokens(key.clone())
            } else {
                Mode::Basic(key.clone())
            }
        } else {
            return Err(RealtimeError::Config(
                "no key, token, auth callback or auth URL configured".to_string(),
            ));
        };

        Ok(Self::with_mode(mode, rest, &config))
    }

    /// Uses a custom provider regardless of the configured auth options.
    pub fn with_provider(config: Arc<ClientConfig>, provider: Arc<dyn CredentialProvider>) -> Result<Self> {
        let rest = RestClient::new(Arc::clone(&config))?;
        Ok(Self::with_mode(Mode::Provider(provider), rest, &config))
    }

    fn with_mode(mode: Mode, rest: RestClient, config: &ClientConfig) -> Self {
        let mut default_params = config.default_token_params.clone();
        if default_params.client_id.is_none() {
            default_params.client_id = config.client_id.clone();
        }
        Self {
            mode,
            rest,
            default_params,
            current: Mutex::new(None),
        }
    }

    pub fn uses_token_auth(&self) -> bool {
        !matches!(self.mode, Mode::Basic(_))
    }

    /// Credential for the next connection attempt. A cached, unexpired token
    /// is reused unless `force` is set.
    pub async fn connect_auth(&self, force: bool) -> Result<ConnectAuth> {
        match &self.mode {
            Mode::Basic(key) => Ok(ConnectAuth::Key(key.as_basic())),
            _ => self.token(force).await.map(ConnectAuth::Token),
        }
    }

    async fn token(&self, force: bool) -> Result<String> {
        if !force
            && let Some(details) = self.current.lock().as_ref()
            && !details.is_expired()
        {
            return Ok(details.token.clone());
        }

        let details = self.fetch().await.map_err(as_credential_failure)?;
        if details.is_expired() {
            return Err(RealtimeError::Credential(ErrorInfo::new(
                crate::types::error_codes::TOKEN_EXPIRED,
                401,
                "provider returned an expired token",
            )));
        }

        let token = details.token.clone();
        *self.current.lock() = Some(details);
        Ok(token)
    }

    async fn fetch(&self) -> Result<TokenDetails> {
        let params = self.default_params.clone();
        match &self.mode {
            Mode::Basic(_) => Err(RealtimeError::Config(
                "basic auth does not use tokens".to_string(),
            )),
            Mode::KeyTokens(key) => {
                let request = TokenRequest::unsigned(key.name.clone(), &params);
                self.rest.request_token(&request, Some(key)).await
            }
            Mode::Provider(provider) => match provider.obtain(&params).await? {
                Credential::TokenString(token) => Ok(TokenDetails::new(token)),
                Credential::TokenDetails(details) => Ok(details),
                Credential::TokenRequest(request) => self.rest.request_token(&request, None).await,
            },
        }
    }

    /// Forgets the cached token so the next attempt fetches a fresh one.
    pub fn invalidate(&self) {
        self.current.lock().take();
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Basic(_) => "basic",
            Mode::KeyTokens(_) => "key-tokens",
            Mode::Provider(_) => "provider",
        };
        f.debug_struct("Authenticator").field("mode", &mode).finish()
    }
}

// Provider failures are retried on the same host unless the server said no
// outright.
fn as_credential_failure(error: RealtimeError) -> RealtimeError {
    match error {
        RealtimeError::Credential(_) | RealtimeError::Protocol(_) => error,
        other => RealtimeError::Credential(ErrorInfo::credential(other.to_string())),
    }
}
