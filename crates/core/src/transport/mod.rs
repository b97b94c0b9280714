//! Storage transports: where stored files live and how they are addressed.
//!
//! Every transport owns one namespace (a directory, or a bucket plus key
//! prefix) and exposes the same capability set. Object storage goes through
//! Apache OpenDAL.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Transport                              │
//! ├───────────────────────────────┬───────────────────────────────┤
//! │ LocalTransport                │ ObjectTransport (OpenDAL)     │
//! │ <dir>/<name>                  │ <prefix>/<name>               │
//! │ <dir>/<label>/<name>          │ <prefix>/<label>/<name>       │
//! └───────────────────────────────┴───────────────────────────────┘
//! ```

mod error;
mod local;
mod object;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use regex::Regex;
use stowage_shared::{StorageProvider, UploadConfig, VersionSpecs};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use error::StorageError;
pub use local::LocalTransport;
pub use object::{ObjectSettings, ObjectTransport, UrlMode};

use crate::artifact::{Artifact, FormFields, RawUpload, VersionInfo};
use crate::context::RequestContext;
use crate::urls::{Addressing, decode_component, materialize};
use crate::versions::{VersionError, generate_versions};

/// Result of [`Transport::store`]: the artifact plus the primary store error, if any.
#[derive(Debug)]
pub struct Settled {
    /// The artifact in its terminal state.
    pub artifact: Artifact,
    /// Why the primary store failed.
    pub error: Option<StorageError>,
}

impl Settled {
    fn failed(mut artifact: Artifact, error: StorageError) -> Self {
        artifact.fail(error.to_string());
        Self {
            artifact,
            error: Some(error),
        }
    }

    /// True when the primary bytes were stored.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Settings every transport shares.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Versions derived for image uploads.
    pub versions: VersionSpecs,
    /// File names eligible for versions.
    pub image_types: Regex,
}

impl TransportOptions {
    /// Build options for one configured storage.
    ///
    /// # Errors
    ///
    /// Returns an error if `upload.image_types` does not compile.
    pub fn from_config(provider: &StorageProvider, upload: &UploadConfig) -> Result<Self, StorageError> {
        let image_types = Regex::new(&upload.image_types)
            .map_err(|e| StorageError::configuration(format!("image_types: {e}")))?;
        Ok(Self {
            versions: provider.image_versions(&upload.image_versions).clone(),
            image_types,
        })
    }

    /// True when versions are configured and the name looks like an image.
    #[must_use]
    pub fn has_versions(&self, raw: &RawUpload) -> bool {
        !self.versions.is_empty() && self.image_types.is_match(&raw.file_name)
    }
}

/// A storage backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;

    /// Versions this transport derives for images.
    fn version_specs(&self) -> &VersionSpecs;

    /// Rule used to build URLs for this transport's artifacts.
    fn addressing(&self) -> Addressing<'_>;

    /// Stored primary files, with URLs populated.
    async fn list(&self, ctx: &RequestContext) -> Result<Vec<Artifact>, StorageError>;

    /// Claims a collision-free name and builds the artifact.
    async fn create_artifact(
        &self,
        raw: &RawUpload,
        fields: &FormFields,
    ) -> Result<Artifact, StorageError>;

    /// Stores the file at `source`, then its versions, then sets URLs.
    ///
    /// `source` is only read; removing it is the caller's job.
    async fn store(&self, artifact: Artifact, source: &Path, ctx: &RequestContext) -> Settled;

    /// Removes a stored file and, best-effort, its versions.
    async fn delete(&self, identifier: &str) -> Result<(), StorageError>;

    /// Gives up a name claimed by [`Transport::create_artifact`] that will never be stored.
    fn discard(&self, artifact: &Artifact);
}

/// Builds the transport for one configured storage.
///
/// # Errors
///
/// Returns an error if the storage cannot be initialized.
pub fn from_provider(
    provider: &StorageProvider,
    upload: &UploadConfig,
) -> Result<Arc<dyn Transport>, StorageError> {
    let options = TransportOptions::from_config(provider, upload)?;
    let transport: Arc<dyn Transport> = match provider {
        StorageProvider::Local {
            upload_dir,
            upload_url,
            ..
        } => Arc::new(LocalTransport::new(
            upload_dir.clone(),
            upload_url.clone().unwrap_or_else(|| upload.upload_url.clone()),
            options,
        )),
        StorageProvider::S3 { .. } => Arc::new(ObjectTransport::from_s3(provider, upload, options)?),
    };
    Ok(transport)
}

/// Builds every configured transport, in configuration order.
///
/// # Errors
///
/// Returns the first initialization error.
pub fn from_config(
    storages: &[StorageProvider],
    upload: &UploadConfig,
) -> Result<Vec<Arc<dyn Transport>>, StorageError> {
    storages
        .iter()
        .map(|provider| from_provider(provider, upload))
        .collect()
}

/// Reduces a delete identifier (bare name, URL path or full URL) to a stored name.
pub(crate) fn resolve_name(identifier: &str) -> Result<String, StorageError> {
    let path = identifier.split(['?', '#']).next().unwrap_or_default();
    let name = decode_component(path.rsplit('/').next().unwrap_or_default());
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(StorageError::invalid_key(identifier));
    }
    Ok(name)
}

/// Marks the artifact processed and sets its URLs.
pub(crate) fn settle(mut artifact: Artifact, transport: &dyn Transport, ctx: &RequestContext) -> Settled {
    artifact.mark_processed();
    materialize(&mut artifact, transport.addressing(), transport.version_specs(), ctx);
    Settled {
        artifact,
        error: None,
    }
}

/// Records the same failure for every label.
pub(crate) fn fail_versions(artifact: &mut Artifact, specs: &VersionSpecs, error: &VersionError) {
    for label in specs.keys() {
        artifact.record_version(label, VersionInfo::failed(error.to_string()));
    }
}

/// Generates every version of `original` and persists the successful ones with `save`.
///
/// `save` returns the backend locator of the stored version, if any. Every
/// label ends up recorded on the artifact.
pub(crate) async fn apply_versions<F, Fut>(
    artifact: &mut Artifact,
    original: Bytes,
    specs: &VersionSpecs,
    token: &CancellationToken,
    mut save: F,
) where
    F: FnMut(String, Bytes) -> Fut,
    Fut: Future<Output = Result<Option<String>, StorageError>>,
{
    let batch = generate_versions(original, artifact.content_type(), None, specs, token).await;
    if let Some(source) = batch.source {
        artifact.set_dimensions(source.width, source.height);
    }

    let mut rendered = Vec::new();
    let mut writes = Vec::new();
    for (label, result) in batch.versions {
        match result {
            Ok(version) => {
                writes.push(save(label.clone(), version.buffer));
                rendered.push((label, version.dimensions));
            }
            Err(err) => {
                artifact.record_version(&label, VersionInfo::failed(err.to_string()));
            }
        }
    }

    for ((label, dimensions), outcome) in rendered.into_iter().zip(join_all(writes).await) {
        let info = match outcome {
            Ok(locator) => VersionInfo::stored(dimensions.width, dimensions.height, locator),
            Err(err) => {
                warn!(name = %artifact.name(), version = %label, error = %err, "Version store failed");
                VersionInfo::failed(VersionError::store(err.to_string()).to_string())
            }
        };
        artifact.record_version(&label, info);
    }
}
