//! Error types for the plugin runtime.

use thiserror::Error;

/// Result type alias for plugin runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the plugin runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid role registration (no role, conflicting roles)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file or typed payload could not be decoded
    #[error("Config error: {0}")]
    Config(String),

    /// The piped plugin service could not be reached
    #[error("Connection error: failed to connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A role's one-time initialization hook failed
    #[error("Initialization error: failed to initialize {role} plugin: {source}")]
    Initialization {
        role: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A state that registration should have made impossible
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    /// One of the concurrently running subsystems failed
    #[error("Subsystem {name} failed: {source}")]
    Subsystem {
        name: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error raised inside a named subsystem.
    pub fn subsystem(name: &'static str, err: Error) -> Self {
        Error::Subsystem {
            name,
            source: Box::new(err),
        }
    }
}

impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}
