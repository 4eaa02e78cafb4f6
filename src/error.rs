//! Error types shared by the device client, coordinator and setup flows.

use thiserror::Error;

/// Result type alias for Ecotracker operations
pub type Result<T> = std::result::Result<T, EcotrackerError>;

/// Main error type for the Ecotracker integration
///
/// Variants carry rendered messages rather than source errors so a failure
/// can be cached in the coordinator state and handed to every subscriber.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EcotrackerError {
    /// Connection refused, timeout or unexpected HTTP status
    #[error("Network error: {message}")]
    Network { message: String },

    /// Body was not JSON or lacked one of the required readings
    #[error("Format error: {message}")]
    Format { message: String },

    /// User or configuration input outside the accepted range
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Device could not be reached while setting up a config entry
    #[error("Cannot connect: {message}")]
    CannotConnect { message: String },

    /// Config store read/write failures
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl EcotrackerError {
    pub fn network<S: Into<String>>(message: S) -> Self {
        EcotrackerError::Network {
            message: message.into(),
        }
    }

    pub fn format<S: Into<String>>(message: S) -> Self {
        EcotrackerError::Format {
            message: message.into(),
        }
    }

    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        EcotrackerError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn cannot_connect<S: Into<String>>(message: S) -> Self {
        EcotrackerError::CannotConnect {
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        EcotrackerError::Storage {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EcotrackerError {
    fn from(err: std::io::Error) -> Self {
        EcotrackerError::storage(err.to_string())
    }
}

impl From<serde_json::Error> for EcotrackerError {
    fn from(err: serde_json::Error) -> Self {
        EcotrackerError::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EcotrackerError::network("connection refused");
        assert_eq!(err.to_string(), "Network error: connection refused");

        let err = EcotrackerError::validation("scan_interval", "must be between 1 and 3600");
        assert_eq!(
            err.to_string(),
            "Validation error: scan_interval - must be between 1 and 3600"
        );
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read only");
        let err: EcotrackerError = io.into();
        assert!(matches!(err, EcotrackerError::Storage { .. }));
    }
}
