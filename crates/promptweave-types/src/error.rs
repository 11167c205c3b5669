use thiserror::Error;

/// Errors from model provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("output extraction failed: {0}")]
    Extraction(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },
}

/// Errors from prompt formatting.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("template error: {0}")]
    Template(String),

    #[error("unsupported mime type: '{0}'")]
    UnsupportedMimeType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::Request("connection refused".to_string());
        assert_eq!(err.to_string(), "request failed: connection refused");
    }

    #[test]
    fn test_format_error_display() {
        let err = FormatError::UnsupportedMimeType("image/tiff".to_string());
        assert!(err.to_string().contains("image/tiff"));
    }
}
