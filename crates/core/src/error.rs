//! Error types shared across the workspace

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache, store, and proxy operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during local cache or socket operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(buildstash::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or validation error
    #[error("configuration error: {message}")]
    #[diagnostic(code(buildstash::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Malformed cache key
    #[error("invalid cache key: {key}")]
    #[diagnostic(code(buildstash::invalid_key))]
    InvalidKey {
        /// The offending key
        key: String,
    },

    /// The requested object does not exist upstream
    #[error("not found: {key}")]
    #[diagnostic(code(buildstash::not_found))]
    NotFound {
        /// The key or path that was requested
        key: String,
    },

    /// Transient failure talking to the object store or an origin server
    #[error("remote {operation} failed: {message}")]
    #[diagnostic(
        code(buildstash::remote),
        help("The operation is retried automatically; persistent failures degrade to cache misses")
    )]
    Remote {
        /// Operation that failed (e.g., "GetObject", "fetch")
        operation: String,
        /// Human-readable description of the failure
        message: String,
        /// Whether retrying may succeed
        retryable: bool,
    },

    /// Authentication or permission failure from the object store
    #[error("remote {operation} denied: {message}")]
    #[diagnostic(
        code(buildstash::remote_auth),
        help("Check the credentials and bucket policy; uploads are disabled until restart")
    )]
    RemoteAuth {
        /// Operation that was denied
        operation: String,
        /// Description from the remote service
        message: String,
    },

    /// Uploads were administratively disabled after an auth failure
    #[error("uploads disabled")]
    #[diagnostic(code(buildstash::uploads_disabled))]
    UploadsDisabled,

    /// Retries exhausted without success
    #[error("{operation} failed after {attempts} attempts")]
    #[diagnostic(code(buildstash::retry_exhausted))]
    RetryExhausted {
        /// Operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: usize,
    },

    /// Serialization error for cache records or wire frames
    #[error("serialization error: {message}")]
    #[diagnostic(code(buildstash::serialization))]
    Serialization {
        /// Description of the serialization issue
        message: String,
    },

    /// Malformed client request on the IPC endpoint
    #[error("protocol error: {message}")]
    #[diagnostic(code(buildstash::protocol))]
    Protocol {
        /// Description of the protocol violation
        message: String,
    },

    /// TLS setup or handshake failure
    #[error("TLS error: {message}")]
    #[diagnostic(code(buildstash::tls))]
    Tls {
        /// Description of the TLS failure
        message: String,
    },

    /// The server is shutting down and refuses new work
    #[error("shutting down")]
    #[diagnostic(code(buildstash::shutdown))]
    Shutdown,
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create an invalid-key error
    #[must_use]
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a retryable remote error
    #[must_use]
    pub fn remote(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable remote error
    #[must_use]
    pub fn remote_fatal(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an auth/permission error
    #[must_use]
    pub fn remote_auth(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteAuth {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a retry-exhausted error
    #[must_use]
    pub fn retry_exhausted(operation: impl Into<String>, attempts: usize) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create a TLS error
    #[must_use]
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls {
            message: msg.into(),
        }
    }

    /// Whether the operation that produced this error may succeed if retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { retryable, .. } => *retryable,
            Self::Io { .. } => true,
            Self::RemoteAuth { .. }
            | Self::UploadsDisabled
            | Self::Configuration { .. }
            | Self::InvalidKey { .. }
            | Self::NotFound { .. }
            | Self::RetryExhausted { .. }
            | Self::Serialization { .. }
            | Self::Protocol { .. }
            | Self::Tls { .. }
            | Self::Shutdown => false,
        }
    }
}

/// Result type for buildstash operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/tmp/cache/ab/cd/key",
            "read",
        );
        let msg = err.to_string();
        assert!(msg.contains("read"));
        assert!(msg.contains("/tmp/cache/ab/cd/key"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::remote("GetObject", "503").is_retryable());
        assert!(!Error::remote_fatal("GetObject", "bad request").is_retryable());
        assert!(!Error::remote_auth("PutObject", "access denied").is_retryable());
        assert!(!Error::configuration("missing bucket").is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }
}
