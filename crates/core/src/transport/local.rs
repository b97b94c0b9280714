//! Local filesystem transport.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use stowage_shared::VersionSpecs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Settled, StorageError, Transport, TransportOptions, apply_versions, fail_versions,
    resolve_name, settle,
};
use crate::artifact::{Artifact, FormFields, RawUpload, VersionInfo};
use crate::context::RequestContext;
use crate::naming::NameRegistry;
use crate::urls::{Addressing, materialize};
use crate::versions::VersionError;

/// Stores files in `upload_dir`, versions in `upload_dir/<label>/`.
#[derive(Debug)]
pub struct LocalTransport {
    upload_dir: PathBuf,
    upload_url: String,
    options: TransportOptions,
    names: NameRegistry,
}

impl LocalTransport {
    /// Create a transport rooted at `upload_dir`, served under `upload_url`.
    #[must_use]
    pub fn new(upload_dir: PathBuf, upload_url: String, options: TransportOptions) -> Self {
        Self {
            upload_dir,
            upload_url,
            options,
            names: NameRegistry::new(),
        }
    }

    /// Directory holding the primary files.
    #[must_use]
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    fn primary_path(&self, name: &str) -> PathBuf {
        self.upload_dir.join(name)
    }

    fn version_path(&self, label: &str, name: &str) -> PathBuf {
        self.upload_dir.join(label).join(name)
    }

    /// Copies `source` into a hidden staging file, then renames it into place.
    async fn store_primary(&self, name: &str, source: &Path) -> Result<u64, StorageError> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let staging = self
            .upload_dir
            .join(format!(".{}.part", Uuid::new_v4().simple()));

        let copied = match tokio::fs::copy(source, &staging).await {
            Ok(size) => tokio::fs::rename(&staging, self.primary_path(name))
                .await
                .map(|()| size),
            Err(err) => Err(err),
        };
        if copied.is_err() {
            if let Err(err) = tokio::fs::remove_file(&staging).await {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %staging.display(), error = %err, "Failed to remove staging file");
                }
            }
        }
        Ok(copied?)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn version_specs(&self) -> &VersionSpecs {
        &self.options.versions
    }

    fn addressing(&self) -> Addressing<'_> {
        Addressing::Local {
            upload_url: &self.upload_url,
        }
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Vec<Artifact>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.upload_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            let raw = RawUpload::stored(name, metadata.len(), modified);
            let mut artifact = Artifact::new(name, &raw, self.options.has_versions(&raw), FormFields::new());
            if artifact.has_versions() {
                for label in self.options.versions.keys() {
                    let exists = tokio::fs::try_exists(self.version_path(label, name))
                        .await
                        .unwrap_or(false);
                    if exists {
                        artifact.record_version(label, VersionInfo::existing());
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
                let path = self.primary_path(&candidate);
                async move { tokio::fs::try_exists(path).await }
            })
            .await?;
        debug!(requested = %raw.file_name, name = %name, "Local name claimed");
        Ok(Artifact::new(
            name,
            raw,
            self.options.has_versions(raw),
            fields.clone(),
        ))
    }

    async fn store(&self, mut artifact: Artifact, source: &Path, ctx: &RequestContext) -> Settled {
        let name = artifact.name().to_string();
        let stored = self.store_primary(&name, source).await;
        self.names.release(&name);

        match stored {
            Ok(size) => artifact.set_size(size),
            Err(err) => {
                warn!(transport = "local", name = %name, error = %err, "Primary store failed");
                return Settled::failed(artifact, err);
            }
        }

        if artifact.has_versions() {
            match tokio::fs::read(self.primary_path(&name)).await {
                Ok(original) => {
                    let root = self.upload_dir.clone();
                    apply_versions(
                        &mut artifact,
                        Bytes::from(original),
                        &self.options.versions,
                        ctx.token(),
                        |label, buffer| {
                            let dir = root.join(label);
                            let path = dir.join(&name);
                            async move {
                                tokio::fs::create_dir_all(&dir).await?;
                                tokio::fs::write(&path, &buffer).await?;
                                Ok::<_, StorageError>(None)
                            }
                        },
                    )
                    .await;
                }
                Err(err) => {
                    fail_versions(
                        &mut artifact,
                        &self.options.versions,
                        &VersionError::Decode(err.to_string()),
                    );
                }
            }
        }

        info!(transport = "local", name = %name, size = artifact.size(), "File stored");
        settle(artifact, self, ctx)
    }

    async fn delete(&self, identifier: &str) -> Result<(), StorageError> {
        let name = resolve_name(identifier)?;
        let primary = tokio::fs::remove_file(self.primary_path(&name)).await;

        // Versions go even when the primary is already missing.
        for label in self.options.versions.keys() {
            match tokio::fs::remove_file(self.version_path(label, &name)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(name = %name, version = %label, error = %err, "Version delete failed");
                }
            }
        }

        match primary {
            Ok(()) => {
                info!(transport = "local", name = %name, "File deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    fn discard(&self, artifact: &Artifact) {
        self.names.release(artifact.name());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use regex::Regex;
    use stowage_shared::VersionSpec;
    use tempfile::TempDir;

    fn transport(root: &TempDir, versions: VersionSpecs) -> LocalTransport {
        LocalTransport::new(
            root.path().join("files"),
            "/files/".to_string(),
            TransportOptions {
                versions,
                image_types: Regex::new(r"(?i)\.(gif|jpe?g|png)$").expect("valid regex"),
            },
        )
    }

    fn thumbnails() -> VersionSpecs {
        VersionSpecs::from([("thumbnail".to_string(), VersionSpec::width(99))])
    }

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_pixel(width, height, Rgb([120u8, 80, 40]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, ImageFormat::Jpeg)
            .expect("jpeg encodes");
        std::fs::write(path, buffer.into_inner()).expect("temp file written");
    }

    #[tokio::test]
    async fn test_store_image_with_thumbnail() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, thumbnails());
        let source = root.path().join("upload_1");
        write_jpeg(&source, 200, 150);
        let ctx = RequestContext::new("localhost:8080", false);

        let artifact = local
            .create_artifact(&RawUpload::new("photo.jpg", None), &FormFields::new())
            .await
            .expect("artifact");
        assert!(artifact.has_versions());
        let settled = local.store(artifact, &source, &ctx).await;

        assert!(settled.is_ok());
        let artifact = settled.artifact;
        assert!(artifact.is_processed());
        assert_eq!(artifact.dimensions(), Some((200, 150)));
        assert!(root.path().join("files/photo.jpg").is_file());
        assert!(root.path().join("files/thumbnail/photo.jpg").is_file());
        assert!(source.is_file(), "source is left for the caller");
        assert_eq!(artifact.url(), Some("http://localhost:8080/files/photo.jpg"));
        assert_eq!(
            artifact.version_url("thumbnail"),
            Some("http://localhost:8080/files/thumbnail/photo.jpg")
        );
        let thumb = &artifact.versions()["thumbnail"];
        assert_eq!((thumb.width, thumb.height), (Some(99), Some(74)));
    }

    #[tokio::test]
    async fn test_existing_name_gets_counter() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, VersionSpecs::new());
        std::fs::create_dir_all(local.upload_dir()).expect("dir");
        std::fs::write(local.upload_dir().join("photo.jpg"), b"old").expect("existing file");

        let first = local
            .create_artifact(&RawUpload::new("photo.jpg", None), &FormFields::new())
            .await
            .expect("artifact");
        let second = local
            .create_artifact(&RawUpload::new("photo.jpg", None), &FormFields::new())
            .await
            .expect("artifact");

        assert_eq!(first.name(), "photo (1).jpg");
        assert_eq!(second.name(), "photo (2).jpg");

        local.discard(&first);
        let third = local
            .create_artifact(&RawUpload::new("photo.jpg", None), &FormFields::new())
            .await
            .expect("artifact");
        assert_eq!(third.name(), "photo (1).jpg");
    }

    #[tokio::test]
    async fn test_non_image_is_processed_without_versions() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, thumbnails());
        let source = root.path().join("upload_2");
        std::fs::write(&source, b"hello").expect("temp file");

        let artifact = local
            .create_artifact(&RawUpload::new("notes.txt", None), &FormFields::new())
            .await
            .expect("artifact");
        let settled = local
            .store(artifact, &source, &RequestContext::new("localhost", false))
            .await;

        assert!(settled.artifact.is_processed());
        assert!(settled.artifact.versions().is_empty());
        assert!(settled.artifact.version_urls().is_empty());
        assert_eq!(settled.artifact.size(), 5);
    }

    #[tokio::test]
    async fn test_broken_image_keeps_primary() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, thumbnails());
        let source = root.path().join("upload_3");
        std::fs::write(&source, b"definitely not a jpeg").expect("temp file");

        let artifact = local
            .create_artifact(&RawUpload::new("broken.jpg", None), &FormFields::new())
            .await
            .expect("artifact");
        let settled = local
            .store(artifact, &source, &RequestContext::new("localhost", false))
            .await;

        assert!(settled.is_ok());
        let artifact = settled.artifact;
        assert!(artifact.is_processed());
        assert!(artifact.error().is_none());
        assert!(artifact.versions()["thumbnail"].error.is_some());
        assert_eq!(artifact.version_url("thumbnail"), artifact.url());
    }

    #[tokio::test]
    async fn test_missing_source_fails_artifact() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, VersionSpecs::new());

        let artifact = local
            .create_artifact(&RawUpload::new("gone.txt", None), &FormFields::new())
            .await
            .expect("artifact");
        let settled = local
            .store(
                artifact,
                &root.path().join("missing"),
                &RequestContext::new("localhost", false),
            )
            .await;

        assert!(!settled.is_ok());
        assert!(settled.artifact.error().is_some());
        assert!(!settled.artifact.is_processed());
        assert!(!local.names.is_reserved("gone.txt"));
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_version_dirs() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, thumbnails());
        let dir = local.upload_dir().to_path_buf();
        std::fs::create_dir_all(dir.join("thumbnail")).expect("dirs");
        std::fs::write(dir.join("b.png"), b"png").expect("file");
        std::fs::write(dir.join("thumbnail/b.png"), b"thumb").expect("file");
        std::fs::write(dir.join("a.txt"), b"text").expect("file");
        std::fs::write(dir.join(".gitignore"), b"*").expect("file");

        let listed = local
            .list(&RequestContext::new("localhost", false))
            .await
            .expect("listing");

        let names: Vec<_> = listed.iter().map(Artifact::name).collect();
        assert_eq!(names, ["a.txt", "b.png"]);
        assert_eq!(listed[1].size(), 3);
        assert_eq!(
            listed[1].version_url("thumbnail"),
            Some("http://localhost/files/thumbnail/b.png")
        );
        assert!(listed[0].version_urls().is_empty());
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, VersionSpecs::new());
        let listed = local
            .list(&RequestContext::new("localhost", false))
            .await
            .expect("listing");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_versions() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, thumbnails());
        let dir = local.upload_dir().to_path_buf();
        std::fs::create_dir_all(dir.join("thumbnail")).expect("dirs");
        std::fs::write(dir.join("photo (1).jpg"), b"jpg").expect("file");
        std::fs::write(dir.join("thumbnail/photo (1).jpg"), b"thumb").expect("file");

        local.delete("/files/photo%20(1).jpg").await.expect("deleted");

        assert!(!dir.join("photo (1).jpg").exists());
        assert!(!dir.join("thumbnail/photo (1).jpg").exists());
    }

    #[tokio::test]
    async fn test_delete_clears_orphaned_versions() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, thumbnails());
        let dir = local.upload_dir().to_path_buf();
        std::fs::create_dir_all(dir.join("thumbnail")).expect("dirs");
        std::fs::write(dir.join("thumbnail/gone.jpg"), b"thumb").expect("file");

        assert!(matches!(
            local.delete("gone.jpg").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(!dir.join("thumbnail/gone.jpg").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_and_invalid() {
        let root = TempDir::new().expect("tempdir");
        let local = transport(&root, VersionSpecs::new());

        assert!(matches!(
            local.delete("nothing.jpg").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            local.delete(".htaccess").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
