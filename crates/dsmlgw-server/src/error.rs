//! Front-end error types.

use std::fmt;

/// Errors that stop the `dsmlgw` binary before or after a batch runs.
///
/// Failures inside a batch never surface here; they are reported in the
/// `batchResponse` itself. That includes a directory that cannot be reached.
#[derive(Debug)]
pub enum ServerError {
    /// Invalid configuration
    Config(String),

    /// Reading the batch or writing the response failed
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
