//! The record describing one stored file and its derived versions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Accompanying form fields, passed through unchanged.
pub type FormFields = BTreeMap<String, String>;

/// What the upstream form parser knows about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUpload {
    /// File name as sent by the client.
    pub file_name: String,
    /// MIME type of the file.
    pub content_type: String,
    /// Size in bytes (0 until fully received).
    pub size: u64,
    /// Last modification time, when known.
    pub modified_at: Option<DateTime<Utc>>,
}

impl RawUpload {
    /// Describe a file that is about to arrive.
    ///
    /// The MIME type is guessed from the name when the client sent none.
    #[must_use]
    pub fn new(file_name: impl Into<String>, content_type: Option<String>) -> Self {
        let file_name = file_name.into();
        let content_type = content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| guess_content_type(&file_name));
        Self {
            file_name,
            content_type,
            size: 0,
            modified_at: None,
        }
    }

    /// Describe a file already present in a backend.
    #[must_use]
    pub fn stored(file_name: impl Into<String>, size: u64, modified_at: Option<DateTime<Utc>>) -> Self {
        let mut raw = Self::new(file_name, None);
        raw.size = size;
        raw.modified_at = modified_at;
        raw
    }
}

/// MIME type for a file name, `application/octet-stream` when unknown.
#[must_use]
pub fn guess_content_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Outcome of one derived version.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    /// Why the version could not be produced or stored.
    #[serde(rename = "err", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Width in pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Height in pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Backend address of the stored version, when the backend has one.
    #[serde(skip)]
    pub locator: Option<String>,
}

impl VersionInfo {
    /// A stored version.
    #[must_use]
    pub fn stored(width: u32, height: u32, locator: Option<String>) -> Self {
        Self {
            error: None,
            width: Some(width),
            height: Some(height),
            locator,
        }
    }

    /// A version found in a backend listing, size unknown.
    #[must_use]
    pub fn existing() -> Self {
        Self::default()
    }

    /// A version that failed.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// True when the version is available.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Version URLs, serialized as `<label>Url` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionUrls(BTreeMap<String, String>);

impl VersionUrls {
    /// URL of one version.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    /// Number of version URLs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no version URL is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, label: &str, url: String) {
        self.0.insert(label.to_string(), url);
    }
}

impl Serialize for VersionUrls {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, url) in &self.0 {
            map.serialize_entry(&format!("{label}Url"), url)?;
        }
        map.end()
    }
}

/// One uploaded file as seen by one transport.
///
/// The name is fixed at creation. `processed` flips once, version entries are
/// written once per label, and nothing changes after the artifact settled
/// (processed or failed) except its URLs.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    name: String,
    #[serde(skip)]
    original_name: String,
    size: u64,
    #[serde(rename = "type")]
    content_type: String,
    #[serde(rename = "modified", skip_serializing_if = "Option::is_none")]
    modified_at: Option<DateTime<Utc>>,
    delete_type: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    versions: BTreeMap<String, VersionInfo>,
    processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    has_versions: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: FormFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delete_url: Option<String>,
    #[serde(flatten)]
    version_urls: VersionUrls,
    #[serde(skip)]
    locator: Option<String>,
}

impl Artifact {
    /// Create an artifact under an already chosen name.
    #[must_use]
    pub fn new(name: impl Into<String>, raw: &RawUpload, has_versions: bool, fields: FormFields) -> Self {
        Self {
            name: name.into(),
            original_name: raw.file_name.clone(),
            size: raw.size,
            content_type: raw.content_type.clone(),
            modified_at: raw.modified_at,
            delete_type: "DELETE",
            versions: BTreeMap::new(),
            processed: false,
            error: None,
            has_versions,
            fields,
            width: None,
            height: None,
            url: None,
            delete_url: None,
            version_urls: VersionUrls::default(),
            locator: None,
        }
    }

    /// Stored name, unique in the owning transport's namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name the client sent.
    #[must_use]
    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// MIME type.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Last modification time, when known.
    #[must_use]
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    /// Whether derived versions are produced for this artifact.
    #[must_use]
    pub fn has_versions(&self) -> bool {
        self.has_versions
    }

    /// Version outcomes by label.
    #[must_use]
    pub fn versions(&self) -> &BTreeMap<String, VersionInfo> {
        &self.versions
    }

    /// Whether the primary store and every version reached a terminal state.
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Terminal failure of the primary store or validation.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True once processed or failed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.processed || self.error.is_some()
    }

    /// Form fields that came with the upload.
    #[must_use]
    pub fn fields(&self) -> &FormFields {
        &self.fields
    }

    /// Original image dimensions, once decoded.
    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }

    /// Retrieval URL.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Delete URL.
    #[must_use]
    pub fn delete_url(&self) -> Option<&str> {
        self.delete_url.as_deref()
    }

    /// Retrieval URLs of the versions.
    #[must_use]
    pub fn version_urls(&self) -> &VersionUrls {
        &self.version_urls
    }

    /// URL of one version.
    #[must_use]
    pub fn version_url(&self, label: &str) -> Option<&str> {
        self.version_urls.get(label)
    }

    /// Backend address of the primary object, when the backend has one.
    #[must_use]
    pub fn locator(&self) -> Option<&str> {
        self.locator.as_deref()
    }

    /// Updates the size while the file is still in flight.
    pub fn set_size(&mut self, size: u64) {
        if !self.is_settled() {
            self.size = size;
        }
    }

    /// Marks the artifact as failed. The first failure wins.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.is_settled() {
            self.error = Some(error.into());
        }
    }

    /// Records the outcome of one version.
    ///
    /// Returns false when the label was already recorded or the artifact settled.
    pub fn record_version(&mut self, label: &str, info: VersionInfo) -> bool {
        if self.is_settled() || self.versions.contains_key(label) {
            return false;
        }
        self.versions.insert(label.to_string(), info);
        true
    }

    /// Marks the artifact processed. Returns false if it already was, or failed.
    pub fn mark_processed(&mut self) -> bool {
        if self.is_settled() {
            return false;
        }
        self.processed = true;
        true
    }

    pub(crate) fn set_dimensions(&mut self, width: u32, height: u32) {
        if !self.is_settled() {
            self.width = Some(width);
            self.height = Some(height);
        }
    }

    pub(crate) fn set_locator(&mut self, locator: String) {
        if !self.is_settled() {
            self.locator = Some(locator);
        }
    }

    pub(crate) fn set_urls(&mut self, url: String, delete_url: String, version_urls: VersionUrls) {
        self.url = Some(url);
        self.delete_url = Some(delete_url);
        self.version_urls = version_urls;
    }
}
