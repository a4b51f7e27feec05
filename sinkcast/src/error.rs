//! Error types for sinkcast
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for the sinkcast crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error(transparent)]
    Config(#[from] sinkcast_common::Error),

    /// A long-running subprocess could not be started
    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A subprocess could not be signalled
    #[error("Failed to terminate {name}: {source}")]
    Terminate {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience Result type using the sinkcast Error
pub type Result<T> = std::result::Result<T, Error>;
