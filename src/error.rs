use std::io;

use thiserror::Error;

/// Recoverable failures of the environment reference API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JsvmError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("an object was expected")]
    ObjectExpected,

    /// The id no longer names a live reference of the requested kind.
    #[error("reference has already been deleted")]
    StaleReference,

    #[error("value cannot be held weakly")]
    CannotBeHeldWeakly,
}

/// Failures starting the inspector server.
#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("Unable to resolve \"{host}\": {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Starting inspector on {host}:{port} failed: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("inspector server is not in the NEW state")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = JsvmError> = std::result::Result<T, E>;
