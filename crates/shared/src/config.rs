//! Application configuration management.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::types::VersionSpecs;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upload policy and URL settings shared by every storage.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Configured storages; the first one is the reporting storage.
    pub storages: Vec<StorageProvider>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Upload limits, type patterns and URL settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory receiving in-flight uploads before they are stored.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    /// URL path prefix under which stored files are served.
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    /// Cutoff for the whole request body in bytes.
    #[serde(default = "default_max_post_size")]
    pub max_post_size: u64,
    /// Minimum accepted file size in bytes (0 disables the check).
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,
    /// Maximum accepted file size in bytes (0 disables the check).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Pattern a file name must match to be accepted.
    #[serde(default = "default_accept_file_types")]
    pub accept_file_types: String,
    /// Pattern marking a file name as an image eligible for versions.
    #[serde(default = "default_image_types")]
    pub image_types: String,
    /// Build `https` URLs instead of `http`.
    #[serde(default)]
    pub use_ssl: bool,
    /// Default image versions for storages that do not declare their own.
    #[serde(default)]
    pub image_versions: VersionSpecs,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            upload_url: default_upload_url(),
            max_post_size: default_max_post_size(),
            min_file_size: default_min_file_size(),
            max_file_size: default_max_file_size(),
            accept_file_types: default_accept_file_types(),
            image_types: default_image_types(),
            use_ssl: false,
            image_versions: VersionSpecs::new(),
        }
    }
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("stowage")
}

fn default_upload_url() -> String {
    "/files/".to_string()
}

fn default_max_post_size() -> u64 {
    11_000_000 // 11 MB
}

fn default_min_file_size() -> u64 {
    1
}

fn default_max_file_size() -> u64 {
    10_000_000 // 10 MB
}

fn default_accept_file_types() -> String {
    ".+".to_string()
}

fn default_image_types() -> String {
    r"(?i)\.(gif|jpe?g|png)$".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_signed_urls() -> bool {
    true
}

fn default_signed_url_expires() -> u64 {
    900 // 15 minutes
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageProvider {
    /// Local filesystem directory.
    Local {
        /// Directory holding stored files; versions live in `<upload_dir>/<label>/`.
        upload_dir: PathBuf,
        /// Overrides `upload.upload_url` for this storage.
        #[serde(default)]
        upload_url: Option<String>,
        /// Overrides `upload.image_versions` for this storage.
        #[serde(default)]
        image_versions: Option<VersionSpecs>,
    },
    /// S3-compatible object storage.
    S3 {
        /// Custom endpoint (R2, MinIO, ...); AWS when absent.
        #[serde(default)]
        endpoint: Option<String>,
        /// Bucket name.
        bucket: String,
        /// Region.
        #[serde(default = "default_region")]
        region: String,
        /// Access key ID.
        access_key_id: String,
        /// Secret access key.
        secret_access_key: String,
        /// Key prefix inside the bucket.
        #[serde(default)]
        prefix: String,
        /// Hand out presigned GET URLs instead of public ones.
        #[serde(default = "default_signed_urls")]
        signed_urls: bool,
        /// Lifetime of presigned URLs in seconds.
        #[serde(default = "default_signed_url_expires")]
        signed_url_expires_secs: u64,
        /// Base of public object URLs, required when `signed_urls` is off.
        #[serde(default)]
        public_base_url: Option<String>,
        /// Base of delete URLs; defaults to `upload.upload_url`.
        #[serde(default)]
        delete_url_base: Option<String>,
        /// `Cache-Control` stored with every object.
        #[serde(default)]
        cache_control: Option<String>,
        /// Overrides `upload.image_versions` for this storage.
        #[serde(default)]
        image_versions: Option<VersionSpecs>,
    },
}

impl StorageProvider {
    /// Create a local filesystem provider.
    #[must_use]
    pub fn local(upload_dir: impl Into<PathBuf>) -> Self {
        Self::Local {
            upload_dir: upload_dir.into(),
            upload_url: None,
            image_versions: None,
        }
    }

    /// Create an S3-compatible provider with presigned URLs.
    #[must_use]
    pub fn s3(
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self::S3 {
            endpoint: None,
            bucket: bucket.into(),
            region: region.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            prefix: String::new(),
            signed_urls: true,
            signed_url_expires_secs: default_signed_url_expires(),
            public_base_url: None,
            delete_url_base: None,
            cache_control: None,
            image_versions: None,
        }
    }

    /// Get the provider name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3 { .. } => "s3",
        }
    }

    /// Image versions for this storage, falling back to the shared defaults.
    #[must_use]
    pub fn image_versions<'a>(&'a self, defaults: &'a VersionSpecs) -> &'a VersionSpecs {
        let own = match self {
            Self::Local { image_versions, .. } | Self::S3 { image_versions, .. } => image_versions,
        };
        own.as_ref().unwrap_or(defaults)
    }

    fn validate(&self, index: usize, defaults: &VersionSpecs) -> AppResult<()> {
        if let Self::S3 {
            bucket,
            access_key_id,
            secret_access_key,
            signed_urls,
            public_base_url,
            ..
        } = self
        {
            if bucket.is_empty() || access_key_id.is_empty() || secret_access_key.is_empty() {
                return Err(AppError::Configuration(format!(
                    "storages[{index}]: s3 storage needs bucket, access_key_id and secret_access_key"
                )));
            }
            if !signed_urls && public_base_url.is_none() {
                return Err(AppError::Configuration(format!(
                    "storages[{index}]: public_base_url is required when signed_urls is false"
                )));
            }
        }

        for (label, spec) in self.image_versions(defaults) {
            if label.is_empty() || label.contains(['/', '\\']) || label.starts_with('.') {
                return Err(AppError::Configuration(format!(
                    "storages[{index}]: invalid version label '{label}'"
                )));
            }
            if !spec.is_valid() {
                return Err(AppError::Configuration(format!(
                    "storages[{index}]: version '{label}' needs at least one non-zero pixel dimension"
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("STOWAGE").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Checks the loaded values for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error if no storage is configured, a pattern does not compile,
    /// or a storage entry is incomplete.
    pub fn validate(&self) -> AppResult<()> {
        if self.storages.is_empty() {
            return Err(AppError::Configuration(
                "at least one storage must be configured".to_string(),
            ));
        }
        for (name, pattern) in [
            ("accept_file_types", &self.upload.accept_file_types),
            ("image_types", &self.upload.image_types),
        ] {
            Regex::new(pattern).map_err(|e| {
                AppError::Configuration(format!("upload.{name} is not a valid pattern: {e}"))
            })?;
        }
        if self.upload.max_file_size != 0 && self.upload.min_file_size > self.upload.max_file_size
        {
            return Err(AppError::Configuration(
                "upload.min_file_size exceeds upload.max_file_size".to_string(),
            ));
        }
        for (index, storage) in self.storages.iter().enumerate() {
            storage.validate(index, &self.upload.image_versions)?;
        }
        Ok(())
    }

    /// Creates the temp directory, every local upload directory and one
    /// sub-directory per image version label.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn prepare_directories(&self) -> AppResult<()> {
        create_dir(&self.upload.tmp_dir)?;
        for storage in &self.storages {
            if let StorageProvider::Local { upload_dir, .. } = storage {
                create_dir(upload_dir)?;
                for label in storage.image_versions(&self.upload.image_versions).keys() {
                    create_dir(&upload_dir.join(label))?;
                }
            }
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> AppResult<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        AppError::Configuration(format!("cannot create directory {}: {e}", path.display()))
    })
}
