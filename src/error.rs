use thiserror::Error;

/// Failures produced by provider construction and the internal fetch paths.
///
/// Evaluation methods never return these. Transport and parse failures on an
/// evaluation path are logged and recovered by substituting the caller's
/// fallback; a failed definitions fetch leaves the previously cached
/// definitions in place.
#[derive(Debug, Error)]
pub enum FlagsError {
    /// The HTTP client could not be built or the request could not be
    /// performed.
    #[error("flags request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server replied with a non-success status.
    #[error("flags endpoint returned status {0}")]
    Status(reqwest::StatusCode),

    /// The response body did not match the expected shape.
    #[error("failed to decode flags response: {0}")]
    Decode(#[from] serde_json::Error),
}
