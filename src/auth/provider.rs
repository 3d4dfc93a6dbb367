use super::{Credential, TokenParams};
use crate::infrastructure::RestClient;
use crate::types::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Something that can produce a credential on demand.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn obtain(&self, params: &TokenParams) -> Result<Credential>;
}

/// HTTP method used against an auth URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMethod {
    #[default]
    Get,
    Post,
}

/// User supplied async function returning a credential.
#[derive(Clone)]
pub struct AuthCallback(Arc<dyn Fn(TokenParams) -> BoxFuture<'static, Result<Credential>> + Send + Sync>);

impl AuthCallback {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(TokenParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Credential>> + Send + 'static,
    {
        Self(Arc::new(move |params| Box::pin(callback(params))))
    }

    pub async fn call(&self, params: TokenParams) -> Result<Credential> {
        (self.0)(params).await
    }
}

impl std::fmt::Debug for AuthCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthCallback(..)")
    }
}

/// Hands out the same credential every time.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    credential: Credential,
}

impl StaticProvider {
    pub fn new(credential: impl Into<Credential>) -> Self {
        Self {
            credential: credential.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn obtain(&self, _params: &TokenParams) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

#[derive(Debug, Clone)]
pub struct CallbackProvider {
    callback: AuthCallback,
}

impl CallbackProvider {
    pub fn new(callback: AuthCallback) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl CredentialProvider for CallbackProvider {
    async fn obtain(&self, params: &TokenParams) -> Result<Credential> {
        self.callback.call(params.clone()).await
    }
}

/// Fetches credentials from a customer-hosted auth URL.
#[derive(Debug, Clone)]
pub struct AuthUrlProvider {
    rest: RestClient,
    url: String,
    method: AuthMethod,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
}

impl AuthUrlProvider {
    pub fn new(
        rest: RestClient,
        url: impl Into<String>,
        method: AuthMethod,
        headers: Vec<(String, String)>,
        params: Vec<(String, String)>,
    ) -> Self {
        Self {
            rest,
            url: url.into(),
            method,
            headers,
            params,
        }
    }
}

#[async_trait]
impl CredentialProvider for AuthUrlProvider {
    async fn obtain(&self, params: &TokenParams) -> Result<Credential> {
        tracing::debug!("Requesting credential from auth URL ({:?})", self.method);
        self.rest
            .fetch_auth_url(&self.url, self.method, &self.headers, &self.params, params)
            .await
    }
}
