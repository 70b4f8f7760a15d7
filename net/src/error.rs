use std::io;

/// Errors returned synchronously by the runtime's entry points.
///
/// Failures discovered after an operation has been handed to a worker are
/// delivered through the relevant callback instead
/// ([`crate::DisconnectReason`], [`crate::ConnectError`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The worker (service, connector) was already started.
    #[error("already started")]
    AlreadyStarted,
    /// The worker is not running (never started, or already stopped).
    #[error("not running")]
    NotRunning,
    /// An underlying socket or poller operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
