//! Core upload pipeline for Stowage.
//!
//! This crate contains the upload orchestration with ZERO web dependencies.
//! HTTP framing and multipart parsing live in the api crate; this crate
//! consumes their output as an [`upload::UploadEvent`] stream.
//!
//! # Modules
//!
//! - `naming` - Collision-safe stored names
//! - `artifact` - The record describing one stored file and its versions
//! - `versions` - Parallel thumbnail generation
//! - `transport` - Local filesystem and object storage backends
//! - `urls` - Retrieval and delete URLs
//! - `upload` - Fan-out of uploaded files to every transport

pub mod artifact;
pub mod context;
pub mod naming;
pub mod transport;
pub mod upload;
pub mod urls;
pub mod versions;

pub use artifact::{Artifact, FormFields, RawUpload, VersionInfo};
pub use context::RequestContext;
pub use transport::{StorageError, Transport};
pub use upload::{UploadError, UploadEvent, UploadOutcome, UploadService, UploadStatus};
