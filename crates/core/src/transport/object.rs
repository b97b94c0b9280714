//! Object storage transport using Apache OpenDAL.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::layers::TimeoutLayer;
use opendal::{ErrorKind, Operator, services};
use stowage_shared::{StorageProvider, UploadConfig, VersionSpecs};
use tracing::{debug, info, warn};

use super::{
    Settled, StorageError, Transport, TransportOptions, apply_versions, resolve_name, settle,
};
use crate::artifact::{Artifact, FormFields, RawUpload, VersionInfo};
use crate::context::RequestContext;
use crate::naming::NameRegistry;
use crate::urls::{Addressing, encode_key, materialize};

/// Deadline for a single backend call.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// How retrieval URLs are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlMode {
    /// Presigned GET URLs valid for `ttl`.
    Signed {
        /// Lifetime of each URL.
        ttl: Duration,
    },
    /// Stable URLs under a public base.
    Public {
        /// Base such as `https://cdn.example.org`.
        base_url: String,
    },
}

/// Namespace and addressing of one bucket.
#[derive(Debug, Clone)]
pub struct ObjectSettings {
    /// Key prefix; empty for the bucket root.
    pub prefix: String,
    /// Retrieval URL mode.
    pub url_mode: UrlMode,
    /// Base of delete URLs.
    pub delete_url_base: String,
    /// `Cache-Control` stored with every object.
    pub cache_control: Option<String>,
}

/// Stores files under `prefix/<name>`, versions under `prefix/<label>/<name>`.
#[derive(Debug)]
pub struct ObjectTransport {
    operator: Operator,
    settings: ObjectSettings,
    options: TransportOptions,
    names: NameRegistry,
}

impl ObjectTransport {
    /// Wrap an existing operator.
    #[must_use]
    pub fn new(operator: Operator, mut settings: ObjectSettings, options: TransportOptions) -> Self {
        settings.prefix = settings.prefix.trim_matches('/').to_string();
        Self {
            operator,
            settings,
            options,
            names: NameRegistry::new(),
        }
    }

    /// Create a transport for an S3-compatible bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if `provider` is not an S3 entry or the operator cannot be built.
    pub fn from_s3(
        provider: &StorageProvider,
        upload: &UploadConfig,
        options: TransportOptions,
    ) -> Result<Self, StorageError> {
        let StorageProvider::S3 {
            endpoint,
            bucket,
            region,
            access_key_id,
            secret_access_key,
            prefix,
            signed_urls,
            signed_url_expires_secs,
            public_base_url,
            delete_url_base,
            cache_control,
            ..
        } = provider
        else {
            return Err(StorageError::configuration("not an s3 storage"));
        };

        let mut builder = services::S3::default()
            .bucket(bucket)
            .access_key_id(access_key_id)
            .secret_access_key(secret_access_key)
            .region(region);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint(endpoint);
        }

        let operator = Operator::new(builder)
            .map_err(|e| StorageError::configuration(e.to_string()))?
            .layer(TimeoutLayer::new().with_timeout(OPERATION_TIMEOUT))
            .finish();

        let url_mode = if *signed_urls {
            UrlMode::Signed {
                ttl: Duration::from_secs(*signed_url_expires_secs),
            }
        } else {
            UrlMode::Public {
                base_url: public_base_url.clone().ok_or_else(|| {
                    StorageError::configuration("public_base_url is required when signed_urls is false")
                })?,
            }
        };

        let settings = ObjectSettings {
            prefix: prefix.clone(),
            url_mode,
            delete_url_base: delete_url_base
                .clone()
                .unwrap_or_else(|| upload.upload_url.clone()),
            cache_control: cache_control.clone(),
        };
        Ok(Self::new(operator, settings, options))
    }

    /// The underlying operator.
    #[must_use]
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// Key of a primary object.
    #[must_use]
    pub fn key(&self, name: &str) -> String {
        if self.settings.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.settings.prefix)
        }
    }

    /// Key of one version of an object.
    #[must_use]
    pub fn version_key(&self, label: &str, name: &str) -> String {
        self.key(&format!("{label}/{name}"))
    }

    fn list_dir(&self) -> String {
        if self.settings.prefix.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", self.settings.prefix)
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.operator.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        let capability = self.operator.info().full_capability();
        let mut write = self.operator.write_with(key, body);
        if capability.write_with_content_type {
            write = write.content_type(content_type);
        }
        if let Some(cache_control) = &self.settings.cache_control
            && capability.write_with_cache_control
        {
            write = write.cache_control(cache_control);
        }
        write.await?;
        Ok(())
    }

    /// Retrieval URL of `key`, signed or public per configuration.
    async fn locator(&self, key: &str) -> Result<String, StorageError> {
        match &self.settings.url_mode {
            UrlMode::Signed { ttl } => {
                let presigned = self.operator.presign_read(key, *ttl).await.map_err(|e| {
                    if e.kind() == ErrorKind::Unsupported {
                        StorageError::PresignNotSupported
                    } else {
                        e.into()
                    }
                })?;
                Ok(presigned.uri().to_string())
            }
            UrlMode::Public { base_url } => Ok(format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                encode_key(key)
            )),
        }
    }

    /// Writes `key` and returns its locator. An object that cannot be
    /// addressed is removed again.
    async fn store_primary(&self, key: &str, body: Bytes, content_type: &str) -> Result<String, StorageError> {
        self.put(key, body, content_type).await?;
        match self.locator(key).await {
            Ok(locator) => Ok(locator),
            Err(err) => {
                if let Err(cleanup) = self.operator.delete(key).await {
                    warn!(key = %key, error = %cleanup, "Failed to remove unaddressable object");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Transport for ObjectTransport {
    fn kind(&self) -> &'static str {
        "object"
    }

    fn version_specs(&self) -> &VersionSpecs {
        &self.options.versions
    }

    fn addressing(&self) -> Addressing<'_> {
        Addressing::Object {
            delete_url_base: &self.settings.delete_url_base,
        }
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Vec<Artifact>, StorageError> {
        let dir = self.list_dir();
        let scope = dir.trim_start_matches('/');
        let entries = self.operator.list(&dir).await?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = entry.path();
            let relative = path.strip_prefix(scope).unwrap_or(path);
            if relative.is_empty()
                || relative.contains('/')
                || relative.starts_with('.')
                || entry.metadata().is_dir()
            {
                continue;
            }

            let metadata = self.operator.stat(path).await?;
            let raw = RawUpload::stored(relative, metadata.content_length(), None);
            let mut artifact = Artifact::new(relative, &raw, self.options.has_versions(&raw), FormFields::new());
            artifact.set_locator(self.locator(path).await?);

            if artifact.has_versions() {
                for label in self.options.versions.keys() {
                    let key = self.version_key(label, relative);
                    if self.exists(&key).await? {
                        let info = VersionInfo {
                            locator: Some(self.locator(&key).await?),
                            ..VersionInfo::existing()
                        };
                        artifact.record_version(label, info);
                    }
                }
            }
            artifact.mark_processed();
            materialize(&mut artifact, self.addressing(), &self.options.versions, ctx);
            artifacts.push(artifact);
        }

        artifacts.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(artifacts)
    }

    async fn create_artifact(
        &self,
        raw: &RawUpload,
        fields: &FormFields,
    ) -> Result<Artifact, StorageError> {
        let name = self
            .names
            .claim(&raw.file_name, |candidate| {
                let key = self.key(&candidate);
                async move { self.exists(&key).await }
            })
            .await?;
        debug!(requested = %raw.file_name, key = %self.key(&name), "Object name claimed");
        Ok(Artifact::new(
            name,
            raw,
            self.options.has_versions(raw),
            fields.clone(),
        ))
    }

    async fn store(&self, mut artifact: Artifact, source: &Path, ctx: &RequestContext) -> Settled {
        let name = artifact.name().to_string();
        let key = self.key(&name);
        let content_type = artifact.content_type().to_string();

        let stored = match tokio::fs::read(source).await {
            Ok(body) => {
                let body = Bytes::from(body);
                self.store_primary(&key, body.clone(), &content_type)
                    .await
                    .map(|locator| (locator, body))
            }
            Err(err) => Err(err.into()),
        };
        self.names.release(&name);

        let body = match stored {
            Ok((locator, body)) => {
                artifact.set_locator(locator);
                artifact.set_size(u64::try_from(body.len()).unwrap_or(u64::MAX));
                body
            }
            Err(err) => {
                warn!(transport = "object", key = %key, error = %err, "Primary store failed");
                return Settled::failed(artifact, err);
            }
        };

        if artifact.has_versions() {
            apply_versions(
                &mut artifact,
                body,
                &self.options.versions,
                ctx.token(),
                |label, buffer| {
                    let key = self.version_key(&label, &name);
                    let content_type = content_type.clone();
                    async move { self.store_primary(&key, buffer, &content_type).await.map(Some) }
                },
            )
            .await;
        }

        info!(transport = "object", key = %key, size = artifact.size(), "File stored");
        settle(artifact, self, ctx)
    }

    async fn delete(&self, identifier: &str) -> Result<(), StorageError> {
        let name = resolve_name(identifier)?;
        let key = self.key(&name);
        let existed = self.exists(&key).await?;
        if existed {
            self.operator.delete(&key).await?;
        }

        for label in self.options.versions.keys() {
            let version_key = self.version_key(label, &name);
            if let Err(err) = self.operator.delete(&version_key).await {
                warn!(key = %version_key, error = %err, "Version delete failed");
            }
        }

        if !existed {
            return Err(StorageError::not_found(name));
        }
        info!(transport = "object", key = %key, "File deleted");
        Ok(())
    }

    fn discard(&self, artifact: &Artifact) {
        self.names.release(artifact.name());
    }
}
