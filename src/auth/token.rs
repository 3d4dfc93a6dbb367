use crate::types::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parameters handed to a credential provider when a token is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenParams {
    /// Requested lifetime in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// JSON-encoded capability map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Milliseconds since the epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl TokenParams {
    /// Query/form pairs used when calling an auth URL.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(ttl) = self.ttl {
            pairs.push(("ttl".to_string(), ttl.to_string()));
        }
        if let Some(capability) = &self.capability {
            pairs.push(("capability".to_string(), capability.clone()));
        }
        if let Some(client_id) = &self.client_id {
            pairs.push(("clientId".to_string(), client_id.clone()));
        }
        if let Some(timestamp) = self.timestamp {
            pairs.push(("timestamp".to_string(), timestamp.to_string()));
        }
        pairs
    }
}

/// A token issued by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    /// Expiry in milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl TokenDetails {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
            issued: None,
            capability: None,
            client_id: None,
        }
    }

    /// Tokens without a known expiry are assumed valid.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires.is_some_and(|expires| expires <= now_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

/// A signed request that the service exchanges for a [`TokenDetails`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl TokenRequest {
    /// Unsigned request for `key_name`; only valid when sent with basic auth.
    pub fn unsigned(key_name: impl Into<String>, params: &TokenParams) -> Self {
        Self {
            key_name: key_name.into(),
            ttl: params.ttl,
            capability: params.capability.clone(),
            client_id: params.client_id.clone(),
            timestamp: Some(params.timestamp.unwrap_or_else(now_millis)),
            nonce: Some(uuid::Uuid::new_v4().simple().to_string()),
            mac: None,
        }
    }
}

/// What a credential provider may hand back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    TokenString(String),
    TokenDetails(TokenDetails),
    TokenRequest(TokenRequest),
}

impl Credential {
    /// Interprets a JSON body from an auth URL or callback.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if value.get("token").is_some() {
            return Ok(Self::TokenDetails(serde_json::from_value(value)?));
        }
        if value.get("keyName").is_some() {
            return Ok(Self::TokenRequest(serde_json::from_value(value)?));
        }
        if let serde_json::Value::String(token) = value {
            return Ok(Self::TokenString(token));
        }
        Err(RealtimeError::Config(
            "JSON credential is neither TokenDetails nor TokenRequest".to_string(),
        ))
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self::TokenString(token)
    }
}

impl From<TokenDetails> for Credential {
    fn from(details: TokenDetails) -> Self {
        Self::TokenDetails(details)
    }
}

impl From<TokenRequest> for Credential {
    fn from(request: TokenRequest) -> Self {
        Self::TokenRequest(request)
    }
}

/// An API key of the form `name:secret`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub name: String,
    pub secret: String,
}

impl ApiKey {
    pub fn as_basic(&self) -> String {
        format!("{}:{}", self.name, self.secret)
    }
}

impl FromStr for ApiKey {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((name, secret)) if !name.is_empty() && !secret.is_empty() => Ok(Self {
                name: name.to_string(),
                secret: secret.to_string(),
            }),
            _ => Err(RealtimeError::Config(
                "API key must be of the form 'name:secret'".to_string(),
            )),
        }
    }
}

// The secret never shows up in logs.
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("name", &self.name)
            .field("secret", &"***")
            .finish()
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
