pub mod constants;
pub mod error;
pub mod message;

pub use constants::*;
pub use error::{ErrorInfo, FailureKind, RealtimeError, Result};
pub use message::{ConnectionDetails, Message, ProtocolMessage};
