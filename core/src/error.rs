use thiserror::Error;

/// Hoist error types
#[derive(Error, Debug)]
pub enum HoistError {
    /// Registry answered 404 for a manifest or blob
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry answered with an unexpected non-2xx status
    #[error("Registry protocol error: {status} - {body}")]
    Protocol { status: u16, body: String },

    /// Token endpoint failure or exhausted authentication retries
    #[error("Authentication failed: {registry} - {message}")]
    Auth { registry: String, message: String },

    /// Cross-repository mount rejected by the registry
    #[error("Mount of {digest} from {from} failed: {message}")]
    MountFailed {
        digest: String,
        from: String,
        message: String,
    },

    /// Filesystem walk or add-argument failure while building a layer
    #[error("Archive error: {0}")]
    Archive(String),

    /// Manifest and config digests disagree
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Malformed JSON document or digest string
    #[error("Parse error: {0}")]
    Parse(String),

    /// Malformed image reference
    #[error("Invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for HoistError {
    fn from(err: serde_json::Error) -> Self {
        HoistError::Parse(err.to_string())
    }
}

/// Result type alias for Hoist operations
pub type Result<T> = std::result::Result<T, HoistError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let error = HoistError::NotFound("library/nginx:latest".to_string());
        assert_eq!(error.to_string(), "Not found: library/nginx:latest");
    }

    #[test]
    fn test_protocol_error_display() {
        let error = HoistError::Protocol {
            status: 500,
            body: "internal error".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry protocol error: 500 - internal error"
        );
    }

    #[test]
    fn test_auth_error_display() {
        let error = HoistError::Auth {
            registry: "ghcr.io".to_string(),
            message: "token endpoint returned 403".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Authentication failed: ghcr.io - token endpoint returned 403"
        );
    }

    #[test]
    fn test_mount_failed_display() {
        let error = HoistError::MountFailed {
            digest: "sha256:abc".to_string(),
            from: "library/base".to_string(),
            message: "202 Accepted".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Mount of sha256:abc from library/base failed: 202 Accepted"
        );
    }

    #[test]
    fn test_invalid_reference_display() {
        let error = HoistError::InvalidReference {
            reference: "".to_string(),
            message: "empty".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid image reference '': empty");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: HoistError = io_error.into();
        assert!(matches!(error, HoistError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: HoistError = result.unwrap_err().into();
        assert!(matches!(error, HoistError::Parse(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(HoistError::Other("test error".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
