use super::constants::error_codes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// How a failure influences the retry scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// DNS, TCP, TLS, timeouts and 5xx: retry against the next host.
    Host,
    /// Token or auth callback problems: retry the credential on the same host.
    Credential,
    /// Non-retryable; the connection goes to `failed`.
    Fatal,
    /// Caused by a user `close()`; never reported as a failure.
    Cancelled,
}

/// Error details as carried on the wire and on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    pub fn is_token_error(&self) -> bool {
        (error_codes::TOKEN_ERROR_START..=error_codes::TOKEN_ERROR_END).contains(&self.code)
    }

    /// Classifies the error for the retry scheduler.
    pub fn kind(&self) -> FailureKind {
        if self.code == error_codes::CANCELLED {
            return FailureKind::Cancelled;
        }
        if self.is_token_error() || self.code == error_codes::AUTH_CALLBACK_FAILED {
            return FailureKind::Credential;
        }
        if self.status_code >= 500
            || (error_codes::INTERNAL_ERROR..60000).contains(&self.code)
            || matches!(
                self.code,
                error_codes::CONNECTION_FAILED
                    | error_codes::DISCONNECTED
                    | error_codes::CONNECTION_SUSPENDED
            )
        {
            return FailureKind::Host;
        }
        if (error_codes::BAD_REQUEST..=error_codes::CLIENT_ERROR_END).contains(&self.code)
            || (400..500).contains(&self.status_code)
        {
            return FailureKind::Fatal;
        }
        FailureKind::Host
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(error_codes::CONNECTION_FAILED, 503, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(error_codes::TIMEOUT, 504, message)
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::new(error_codes::AUTH_CALLBACK_FAILED, 401, message)
    }

    pub fn cancelled() -> Self {
        Self::new(error_codes::CANCELLED, 400, "connection closed by client")
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} / {}] {}",
            self.code, self.status_code, self.message
        )
    }
}

/// Errors that can occur when using the Ably Realtime client.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Network or dial failure; retried against fallback hosts
    #[error("Transport error: {0}")]
    Transport(String),

    /// The credential provider failed or returned an unusable credential
    #[error("Credential error: {0}")]
    Credential(ErrorInfo),

    /// Non-retryable protocol error reported by the server
    #[error("Protocol error: {0}")]
    Protocol(ErrorInfo),

    /// Operation timed out
    #[error("Timeout error")]
    Timeout,

    /// The operation was abandoned because the client closed
    #[error("Cancelled by user")]
    Cancelled,

    /// Publish on a channel that is not attached while queueing is disabled
    #[error("Channel '{0}' is not attached")]
    NotAttached(String),

    /// The outbound queue reached its configured bound
    #[error("Outbound queue is full ({0} messages)")]
    QueueFull(usize),

    /// The requested operation is not permitted in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connection is in the `failed` state
    #[error("Connection failed: {0}")]
    ConnectionFailed(ErrorInfo),

    /// The connection is closed or closing
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection is suspended
    #[error("Connection suspended: {0}")]
    ConnectionSuspended(ErrorInfo),

    /// Channel-specific failure (attach rejected, message nacked, ...)
    #[error("Channel error: {0}")]
    ChannelFailed(ErrorInfo),

    /// Invalid client options
    #[error("Configuration error: {0}")]
    Config(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error (auth URL, token requests)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl RealtimeError {
    /// Converts the error into the clonable reason recorded on state changes.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Credential(info)
            | Self::Protocol(info)
            | Self::ConnectionFailed(info)
            | Self::ConnectionSuspended(info)
            | Self::ChannelFailed(info) => info.clone(),
            Self::Transport(msg) => ErrorInfo::transport(msg.clone()),
            Self::WebSocket(e) => ErrorInfo::transport(e.to_string()),
            Self::Http(e) => match e.status() {
                Some(status) if status.is_client_error() => {
                    ErrorInfo::new(error_codes::BAD_REQUEST, status.as_u16(), e.to_string())
                }
                _ => ErrorInfo::transport(e.to_string()),
            },
            Self::Timeout => ErrorInfo::timeout("operation timed out"),
            Self::Cancelled => ErrorInfo::cancelled(),
            Self::NotAttached(channel) => ErrorInfo::new(
                error_codes::CHANNEL_NOT_ATTACHED,
                400,
                format!("channel '{channel}' is not attached"),
            ),
            Self::QueueFull(bound) => ErrorInfo::new(
                error_codes::QUEUE_FULL,
                400,
                format!("outbound queue is full ({bound} messages)"),
            ),
            Self::ConnectionClosed => {
                ErrorInfo::new(error_codes::CONNECTION_CLOSED, 400, "connection closed")
            }
            Self::InvalidState(msg) | Self::Config(msg) => {
                ErrorInfo::new(error_codes::BAD_REQUEST, 400, msg.clone())
            }
            Self::Serialization(e) => ErrorInfo::new(error_codes::BAD_REQUEST, 400, e.to_string()),
            Self::UrlParse(e) => ErrorInfo::new(error_codes::BAD_REQUEST, 400, e.to_string()),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.to_error_info().kind()
    }
}

impl From<ErrorInfo> for RealtimeError {
    fn from(info: ErrorInfo) -> Self {
        match info.kind() {
            FailureKind::Credential => Self::Credential(info),
            FailureKind::Cancelled => Self::Cancelled,
            FailureKind::Fatal => Self::Protocol(info),
            FailureKind::Host if info.code == error_codes::TIMEOUT => Self::Timeout,
            FailureKind::Host => Self::Transport(info.message),
        }
    }
}

/// Convenience type alias for `Result<T, RealtimeError>`.
pub type Result<T> = std::result::Result<T, RealtimeError>;
