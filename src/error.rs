use thiserror::Error;

/// Errors that can occur in the mock engine and its host proxy.
#[derive(Error, Debug)]
pub enum MockError {
    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A regular expression failed to compile.
    #[error("regex error: {0}")]
    Regex(String),

    /// A content transform (`merge`/`delete`/`replace`) failed.
    #[error("transform error: {0}")]
    Transform(String),

    /// Forwarding a request to the upstream server failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Building a synthesized response failed.
    #[error("response construction error: {0}")]
    Response(String),

    /// Catch-all for anything else.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using [`MockError`].
pub type Result<T> = std::result::Result<T, MockError>;

impl From<String> for MockError {
    fn from(s: String) -> Self {
        MockError::Other(s)
    }
}

impl From<&str> for MockError {
    fn from(s: &str) -> Self {
        MockError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for MockError {
    fn from(err: serde_json::Error) -> Self {
        MockError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for MockError {
    fn from(err: regex::Error) -> Self {
        MockError::Regex(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MockError::Config("missing file".to_string());
        assert_eq!(err.to_string(), "configuration error: missing file");
    }

    #[test]
    fn error_from_str() {
        let err: MockError = "boom".into();
        assert!(matches!(err, MockError::Other(_)));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: MockError = io_err.into();
        assert!(matches!(err, MockError::Io(_)));
    }
}
