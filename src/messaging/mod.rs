// Messaging module - protocol actions and inbound frame routing
pub mod event;
pub mod router;

pub use event::Action;
pub use router::{MessageRouter, Route};
