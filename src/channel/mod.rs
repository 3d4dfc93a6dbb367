// Module declarations
mod core;
mod multiplexer;
mod push;
mod state;

// Public API exports
pub use core::RealtimeChannel;
pub use push::PublishHandle;
pub use state::{ChannelEvent, ChannelState, ChannelStateChange};

pub(crate) use core::ChannelShared;
pub(crate) use multiplexer::ChannelMultiplexer;
pub(crate) use push::{CompletionId, CompletionSender, PendingMessage};
