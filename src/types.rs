//! Error types shared across waypoint

use thiserror::Error;

/// Errors raised by waypoint subsystems
#[derive(Debug, Error)]
pub enum WaypointError {
    /// Cold-tier database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Origin fetch failure (connect, timeout, transport)
    #[error("Origin fetch failed: {0}")]
    Origin(String),

    /// Stored response payload could not be decoded
    #[error("Response decode failed: {0}")]
    Decode(String),

    /// Configuration file or vhost definition problem
    #[error("Configuration error: {0}")]
    Config(String),

    /// No vhost/location matches the request
    #[error("No route for host '{host}' path '{path}'")]
    NoRoute { host: String, path: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WaypointError>;
