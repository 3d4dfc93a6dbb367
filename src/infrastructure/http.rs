use crate::auth::{ApiKey, AuthMethod, Credential, TokenDetails, TokenParams, TokenRequest};
use crate::client::ClientConfig;
use crate::retry::HostCursor;
use crate::types::{ErrorInfo, FailureKind, RealtimeError, Result, error_codes};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

/// HTTP side of authentication: auth URL calls and token request exchange.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl RestClient {
    pub fn new(config: Arc<ClientConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// Exchanges a token request at `POST {rest}/keys/{keyName}/requestToken`.
    ///
    /// Host-level failures move on to the next REST fallback host, at most
    /// `http_max_retry_count` times. With `basic` set the request is
    /// authenticated with the key and may be unsigned.
    pub async fn request_token(
        &self,
        request: &TokenRequest,
        basic: Option<&ApiKey>,
    ) -> Result<TokenDetails> {
        let mut hosts = HostCursor::new(
            self.config.rest_host.clone(),
            self.config.fallback_hosts.clone(),
            self.config.fallback_retry_timeout,
        );
        hosts.begin_cycle(tokio::time::Instant::now());
        let attempts = 1 + self.config.http_max_retry_count.min(hosts.len() - 1);

        let mut last_error = None;
        for attempt in 0..attempts {
            let host = if attempt == 0 {
                hosts.current().to_string()
            } else {
                hosts.advance().to_string()
            };

            match self.request_token_from(&host, request, basic).await {
                Ok(details) => return Ok(details),
                Err(e) if e.kind() == FailureKind::Host => {
                    tracing::warn!("Token request against {} failed: {}", host, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| RealtimeError::Transport("no REST host available".into())))
    }

    async fn request_token_from(
        &self,
        host: &str,
        request: &TokenRequest,
        basic: Option<&ApiKey>,
    ) -> Result<TokenDetails> {
        let mut url = Url::parse(&self.config.rest_url(host))?;
        url.path_segments_mut()
            .map_err(|_| RealtimeError::Config(format!("REST URL for {host} cannot be a base")))?
            .extend(["keys", request.key_name.as_str(), "requestToken"]);

        let mut builder = self.http.post(url).json(request);
        if let Some(key) = basic {
            builder = builder.basic_auth(&key.name, Some(&key.secret));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let info = serde_json::from_str::<ErrorBody>(&body)
                .map(|body| body.error)
                .unwrap_or_else(|_| {
                    let code = if status.is_server_error() {
                        error_codes::INTERNAL_ERROR
                    } else {
                        error_codes::BAD_REQUEST
                    };
                    ErrorInfo::new(code, status.as_u16(), format!("requestToken returned {status}"))
                });
            return Err(info.into());
        }

        let details = response.json::<TokenDetails>().await?;
        tracing::debug!("Obtained token from {}", host);
        Ok(details)
    }

    /// Calls a customer auth URL and interprets its body by content type.
    pub async fn fetch_auth_url(
        &self,
        auth_url: &str,
        method: AuthMethod,
        headers: &[(String, String)],
        params: &[(String, String)],
        token_params: &TokenParams,
    ) -> Result<Credential> {
        let mut pairs = token_params.to_pairs();
        pairs.extend(params.iter().cloned());

        let mut builder = match method {
            AuthMethod::Get => {
                let mut url = Url::parse(auth_url)?;
                url.query_pairs_mut().extend_pairs(&pairs);
                self.http.get(url)
            }
            AuthMethod::Post => {
                let body = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&pairs)
                    .finish();
                self.http
                    .post(auth_url)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body)
            }
        };
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("auth URL returned {status}");
            // A 403 from the customer's server means the client is not allowed
            // a token at all.
            let info = if status.as_u16() == 403 {
                ErrorInfo::new(40300, 403, message)
            } else {
                ErrorInfo::new(error_codes::AUTH_CALLBACK_FAILED, 401, message)
            };
            return Err(info.into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            Credential::from_json(response.json().await?)
        } else if content_type.starts_with("text/plain") || content_type.starts_with("application/jwt") {
            let token = response.text().await?;
            Ok(Credential::TokenString(token.trim().to_string()))
        } else {
            Err(RealtimeError::Credential(ErrorInfo::credential(format!(
                "auth URL returned unsupported content type '{content_type}'"
            ))))
        }
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("rest_host", &self.config.rest_host)
            .finish()
    }
}
