//! Error types for Reel

use std::io;
use thiserror::Error;

/// Result type for Reel operations
pub type Result<T> = std::result::Result<T, ReelError>;

/// Errors that can occur in Reel
#[derive(Debug, Error)]
pub enum ReelError {
    /// No cassette file exists for this name in any supported format
    #[error("Cassette not found: {0}")]
    NotFound(String),

    /// A cassette file exists but this build cannot read its format or version
    #[error("Unsupported cassette format for '{name}': {reason}")]
    UnsupportedFormat {
        /// Cassette name
        name: String,
        /// Why the file cannot be read
        reason: String,
    },

    /// No recorded interaction fits the request
    #[error("No matching interaction for {method} {url}")]
    NoMatch {
        /// Request method
        method: String,
        /// Request URL
        url: String,
    },

    /// Every candidate interaction was already replayed in this session
    #[error("Interaction already consumed: {method} {url}")]
    AlreadyConsumed {
        /// Request method
        method: String,
        /// Request URL
        url: String,
    },

    /// Sessions were exited out of stack order
    #[error("Session stack violation: cannot exit '{exiting}' while '{top}' is active")]
    StackViolation {
        /// Session the caller tried to exit
        exiting: String,
        /// Session currently on top of the stack
        top: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Cassette file could not be parsed
    #[error("Invalid cassette format: {0}")]
    InvalidFormat(String),

    /// Binary cassette corrupted (CRC mismatch)
    #[error("Cassette corrupted in {section}: expected CRC {expected:#x}, got {actual:#x}")]
    CorruptedData {
        /// Section where corruption was detected
        section: &'static str,
        /// Expected CRC32 value
        expected: u32,
        /// Actual CRC32 value
        actual: u32,
    },

    /// Invalid cassette name
    #[error("Invalid cassette name: {0}")]
    InvalidCassetteName(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Forwarding to the real network failed
    #[error("Network error: {0}")]
    Network(String),
}

impl ReelError {
    /// Whether this error is fatal to the load/save that produced it.
    ///
    /// Matching errors are reported per request and never abort a session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::UnsupportedFormat { .. }
                | Self::InvalidFormat(_)
                | Self::CorruptedData { .. }
        )
    }
}

impl From<serde_json::Error> for ReelError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Io(io::Error::new(io::ErrorKind::Other, err))
        } else {
            Self::InvalidFormat(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ReelError::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_fatal());
        assert!(ReelError::UnsupportedFormat {
            name: "x".to_string(),
            reason: "binary".to_string(),
        }
        .is_fatal());

        assert!(!ReelError::NoMatch {
            method: "GET".to_string(),
            url: "http://x/".to_string(),
        }
        .is_fatal());
        assert!(!ReelError::AlreadyConsumed {
            method: "GET".to_string(),
            url: "http://x/".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn test_json_error_maps_to_invalid_format() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(ReelError::from(err), ReelError::InvalidFormat(_)));
    }
}
