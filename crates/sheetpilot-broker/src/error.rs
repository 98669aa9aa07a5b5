//! Error types for the session broker.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

/// Errors surfaced by the broker to the daemon and, through it, the CLI.
///
/// Nothing here is retried automatically: a dead handle means the session
/// must be reopened, a save conflict needs a human, and a timeout means the
/// in-flight operation is still draining on the session's thread.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session handle invalidated: {0}. Close and reopen the session.")]
    HandleInvalidated(String),

    #[error("Save conflict: {0}")]
    SaveConflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out after {}s (still draining on the session thread)", .0.as_secs())]
    Timeout(Duration),

    #[error("File is already open in another session: {}", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Automation error: {0}")]
    Driver(String),

    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl From<DriverError> for BrokerError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::HandleDead(msg) => BrokerError::HandleInvalidated(msg),
            DriverError::Protocol(msg) => BrokerError::HandleInvalidated(msg),
            DriverError::Io(err) => BrokerError::Io(err),
            DriverError::SaveConflict(msg) => BrokerError::SaveConflict(msg),
            DriverError::Operation(msg) => BrokerError::Driver(msg),
            DriverError::InvalidArgs(msg) => BrokerError::InvalidArgs(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
