//! Version generation errors.

use thiserror::Error;

/// Failure of one derived version.
///
/// Variants carry plain messages so one decode failure can be reported
/// against every label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The spec cannot be resolved to a pixel size.
    #[error("invalid version spec: {0}")]
    InvalidSpec(String),

    /// The content type has no image codec.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The original could not be decoded.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The resized image could not be encoded.
    #[error("failed to encode image: {0}")]
    Encode(String),

    /// The version was produced but could not be stored.
    #[error("failed to store version: {0}")]
    Store(String),

    /// The upload was aborted before the version ran.
    #[error("version generation cancelled")]
    Cancelled,

    /// The resize task died.
    #[error("version task failed: {0}")]
    Task(String),
}

impl VersionError {
    /// Create an invalid spec error.
    #[must_use]
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}
