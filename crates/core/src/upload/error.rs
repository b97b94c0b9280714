//! Upload error types.

use thiserror::Error;

/// Why a file was rejected before any transport saw it.
///
/// The display strings are user-visible and stored on the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Smaller than `min_file_size`.
    #[error("File is too small")]
    TooSmall,
    /// Larger than `max_file_size`.
    #[error("File is too big")]
    TooBig,
    /// Name does not match `accept_file_types`.
    #[error("Filetype not allowed")]
    TypeNotAllowed,
}

/// Request-level upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed multipart body.
    #[error("malformed multipart body: {0}")]
    Parse(String),

    /// Body grew past the configured post size.
    #[error("request body exceeds {limit} bytes")]
    PostTooLarge {
        /// Configured limit.
        limit: u64,
    },

    /// No transport configured.
    #[error("no storage transport configured")]
    NoTransports,

    /// Upload limits or patterns are unusable.
    #[error("invalid upload policy: {0}")]
    InvalidPolicy(String),
}
