//! Error types for the registration cache.

use std::fmt;
use std::io;

use crate::region::Protection;

/// Error type for cache operations.
#[derive(Debug)]
pub enum Error {
    /// The user register callback failed.
    Io(io::Error),
    /// Subscription to the event source or another resource acquisition failed.
    NoResource(String),
    /// The OS-reported page protection cannot satisfy the requested access.
    PermissionDenied {
        /// Protection the request needs.
        wanted: Protection,
        /// Protection the pages actually support.
        got: Protection,
    },
    /// Malformed request or configuration.
    InvalidArgument(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::NoResource(msg) => write!(f, "No resource: {}", msg),
            Error::PermissionDenied { wanted, got } => {
                write!(f, "Permission denied: wanted {:?}, pages support {:?}", wanted, got)
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
