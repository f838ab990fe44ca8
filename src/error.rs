use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type alias for the objstore-s3 client
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by the storage service in a non-2xx response.
///
/// The `code` is the provider's own vocabulary (`NoSuchKey`, `AccessDenied`,
/// ...) and is never renamed. When the response carried no decodable body
/// (HEAD requests), the code is the numeric HTTP status, e.g. `"404"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub status: u16,
    pub code: String,
    pub message: Option<String>,
    pub request_id: Option<String>,
    /// Every scalar field of the `<Error>` document, including `Code` and `Message`.
    pub metadata: BTreeMap<String, String>,
}

impl ServiceError {
    /// Error built from a bare status code with no body.
    pub fn from_status(status: u16) -> Self {
        Self {
            status,
            code: status.to_string(),
            message: None,
            request_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Corrective region hint: the `<Region>` of `AuthorizationHeaderMalformed`
    /// or the `x-amz-bucket-region` header of a body-less error.
    pub fn region(&self) -> Option<&str> {
        self.metadata
            .get("Region")
            .map(String::as_str)
            .filter(|r| !r.is_empty())
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (HTTP {})", self.code, self.status)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

/// Error types for the objstore-s3 client
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error reported by the storage service
    #[error("S3 error: {0}")]
    Service(#[from] ServiceError),

    /// Malformed XML body
    #[error("XML error: {0}")]
    Xml(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Header value that cannot be sent
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// Invalid response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Caller supplied an argument the service would reject
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Provider error code, if this error came from the service.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Service(err) => Some(err.code.as_str()),
            _ => None,
        }
    }

    pub fn service(&self) -> Option<&ServiceError> {
        match self {
            Error::Service(err) => Some(err),
            _ => None,
        }
    }

    /// True when the service answered with one of `codes`.
    pub fn has_code(&self, codes: &[&str]) -> bool {
        self.code().map_or(false, |code| codes.contains(&code))
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_mismatch() -> ServiceError {
        let mut metadata = BTreeMap::new();
        metadata.insert("Code".to_string(), "AuthorizationHeaderMalformed".to_string());
        metadata.insert("Region".to_string(), "us-west-2".to_string());
        ServiceError {
            status: 400,
            code: "AuthorizationHeaderMalformed".to_string(),
            message: Some("the region 'us-east-1' is wrong".to_string()),
            request_id: None,
            metadata,
        }
    }

    #[test]
    fn test_service_error_display() {
        let err = Error::from(region_mismatch());
        assert_eq!(
            err.to_string(),
            "S3 error: AuthorizationHeaderMalformed (HTTP 400): the region 'us-east-1' is wrong"
        );
    }

    #[test]
    fn test_region_hint() {
        assert_eq!(region_mismatch().region(), Some("us-west-2"));
        assert_eq!(ServiceError::from_status(404).region(), None);
    }

    #[test]
    fn test_status_only_error_uses_numeric_code() {
        let err = Error::from(ServiceError::from_status(404));
        assert_eq!(err.code(), Some("404"));
        assert!(err.has_code(&["404", "NoSuchKey"]));
        assert!(!err.has_code(&["NoSuchBucket"]));
    }

    #[test]
    fn test_non_service_error_has_no_code() {
        let err = Error::Configuration("missing region".to_string());
        assert!(err.code().is_none());
        assert!(err.to_string().contains("Configuration error"));
    }
}
