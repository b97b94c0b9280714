//! Derived image versions (thumbnails and other resize targets).
//!
//! The original is decoded once; every version spec is resized and
//! re-encoded on the blocking pool concurrently, and a failing version never
//! aborts its siblings.

mod engine;
mod error;

pub use engine::{Dimensions, RenderedVersion, VersionBatch, generate_versions, resolve_dimensions};
pub use error::VersionError;
