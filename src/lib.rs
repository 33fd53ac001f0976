#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/", "README.md"))]
#![deny(missing_docs)]

use std::{fmt, sync::Arc};

/// Pause/interrupt primitive shared by the worker and every controller
pub mod pause;
/// Suspension primitives a task body calls: `sleep`, `wait_for_resume`, `hold_key`, `mouse_click`
pub mod action;
/// Cooperative task identity, state machine and controller
pub mod controller;
/// OS-thread-backed specialization of [`controller::TaskController`]
pub mod threaded;
/// The scheduling loop
pub mod worker;
/// Supervisor: worker lifecycle, watchdog, controller registry
pub mod manager;
/// In-process pub/sub used to carry log events to observers
pub mod hub;
/// Typed, run-time-read-only variable store exposed to tasks
pub mod variables;
/// Monotonic interval helpers used by the watchdog and auto-loop throttling
pub mod time;
/// Generic snapshot save/load helper (JSON/MessagePack)
pub mod state;

/// The crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The hub client with the given name is already registered
    #[error("hub client already registered: {0}")]
    HubAlreadyRegistered(Arc<str>),
    /// The hub client with the given name was not found
    #[error("hub client not found: {0}")]
    HubClientNotFound(Arc<str>),
    /// A task with the given name is already registered with the manager
    #[error("task already registered: `{0}`")]
    DuplicateTask(String),
    /// No task is registered under the given name
    #[error("task not found: `{0}`")]
    TaskNotFound(String),
    /// The worker is not alive (stopped, or never started)
    #[error("worker is not alive")]
    WorkerNotAlive,
    /// The worker did not quiesce within its grace period (a task is blocking without yielding)
    #[error("worker did not respond within the grace period: a task may be deadlocked")]
    WorkerUnresponsive,
    /// Invalid data received / parameters provided
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Standard I/O errors (snapshot save/load)
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    /// Snapshot (de)serialization errors
    #[error("snapshot error: {0}")]
    Snapshot(String),
    /// The requested operation is not implemented (the relevant cargo feature is disabled)
    #[error("not implemented")]
    Unimplemented,
    /// All other errors
    #[error("operation failed: {0}")]
    Failed(String),
}

impl Error {
    /// Creates a new invalid-data error
    pub fn invalid_data<S: fmt::Display>(msg: S) -> Self {
        Error::InvalidData(msg.to_string())
    }
    /// Creates a new generic failure
    pub fn failed<S: fmt::Display>(msg: S) -> Self {
        Error::Failed(msg.to_string())
    }
}

/// Installs a `tracing-subscriber` fmt layer at the given default filter level, overridable via
/// `RUST_LOG`. Analogous to `roboplc::configure_logger`: a convenience for binaries embedding this
/// crate that don't already own a subscriber. Does nothing (beyond logging the conflict) if a
/// global subscriber is already installed, since only the first one wins.
pub fn init_tracing(filter: tracing::level_filters::LevelFilter) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    if fmt().with_env_filter(env_filter).try_init().is_err() {
        tracing::debug!("a global tracing subscriber is already installed, init_tracing is a no-op");
    }
}

/// Prelude module
pub mod prelude {
    pub use crate::action::{hold_key, mouse_click, sleep, wait_for_resume, InputBackend, MouseButton, NullBackend};
    pub use crate::controller::{TaskController, TaskId, TaskName, TaskState};
    pub use crate::hub::prelude::*;
    pub use crate::manager::{ManagerOptions, TaskManager};
    pub use crate::pause::PauseState;
    pub use crate::threaded::ThreadedController;
    pub use crate::variables::{VariableStore, VariableValue};
    pub use crate::worker::{Worker, WorkerOptions};
    pub use bma_ts::{Monotonic, Timestamp};
    pub use std::time::Duration;
}
