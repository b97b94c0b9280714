//! Shared types, errors, and configuration for Stowage.
//!
//! This crate provides common types used across all other crates:
//! - Image version specifications (resize targets)
//! - Application-wide error types
//! - Configuration management

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, ServerConfig, StorageProvider, UploadConfig};
pub use error::{AppError, AppResult};
pub use types::{Dimension, VersionSpec, VersionSpecs};
