// Module declarations
pub(crate) mod actor;
mod builder;
mod connection;
mod core;
pub(crate) mod effect;
mod options;
mod state;

// Public API exports
pub use builder::RealtimeClientBuilder;
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStateChange, RecoveryKey};
pub use core::RealtimeClient;
pub use options::{ClientConfig, Continuity, RealtimeClientOptions, default_fallback_hosts};
pub use state::ClientSnapshot;
