//! # Ably Realtime Rust
//!
//! A Rust client for the Ably realtime pub/sub service.
//!
//! The client keeps one connection to the service, moves it through an
//! explicit state machine (`initialized`, `connecting`, `connected`,
//! `disconnected`, `suspended`, `closing`, `closed`, `failed`), retries
//! against fallback hosts when the connection drops, and resumes the previous
//! session so that attached channels and unacknowledged publishes survive
//! short interruptions.
//!
//! ## Example
//!
//! ```no_run
//! use ably_realtime_rs::{RealtimeClient, RealtimeClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RealtimeClient::new(RealtimeClientOptions {
//!         key: Some("app.key:secret".to_string()),
//!         ..Default::default()
//!     })?;
//!
//!     let channel = client.channel("news");
//!     channel.attach().await?;
//!     channel.publish("greeting", serde_json::json!("hello"))?.await?;
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod infrastructure;
pub mod messaging;
pub mod retry;
pub mod transport;
pub mod types;

pub use auth::{AuthCallback, AuthMethod, Credential, CredentialProvider, TokenDetails, TokenParams, TokenRequest};
pub use channel::{ChannelEvent, ChannelState, ChannelStateChange, PublishHandle, RealtimeChannel};
pub use client::{
    ClientSnapshot, ConnectionEvent, ConnectionState, ConnectionStateChange, RealtimeClient,
    RealtimeClientBuilder, RealtimeClientOptions, RecoveryKey,
};
pub use infrastructure::ListenerHandle;
pub use types::{ErrorInfo, FailureKind, Message, RealtimeError, Result};
