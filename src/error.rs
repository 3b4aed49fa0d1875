//! Error types surfaced by the scheduler and its collaborators.

use thiserror::Error;

/// Errors returned by scheduler setup and teardown.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A background thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The submission worker died while executing a recorded command.
    #[error("submission worker thread panicked")]
    WorkerPanicked,

    /// The submission worker did not exit within the stop grace period.
    #[error("submission worker did not stop within {0:?}")]
    ShutdownTimedOut(std::time::Duration),
}

/// Failure reported by a native fence wait.
///
/// Any of these is fatal to the fence waiter: once a wait fails no later
/// counter can be trusted to complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FenceError {
    #[error("device lost while waiting on fence")]
    DeviceLost,

    #[error("fence wait failed with driver code {0}")]
    Driver(i32),

    #[error("fence wait failed: {0}")]
    Other(String),
}
