// Retry module - fallback host selection and retry timing
pub mod hosts;
pub mod scheduler;

pub use hosts::HostCursor;
pub use scheduler::{RetryDecision, RetryScheduler};
