// Infrastructure module - Core background services and utilities
pub mod emitter;
pub mod http;
pub mod task_manager;
pub mod timer;

pub use emitter::{EventEmitter, ListenerHandle};
pub use http::RestClient;
pub use task_manager::TaskManager;
pub use timer::Timer;
