//! Retrieval and delete URLs for settled artifacts.
//!
//! Materializing is a pure function of the artifact, the owning transport's
//! addressing rule and the request context, so repeating it yields the same
//! strings.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use stowage_shared::VersionSpecs;
use url::Url;

use crate::artifact::{Artifact, VersionUrls};
use crate::context::RequestContext;

/// Characters left alone when encoding one path component.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// How a transport addresses its stored files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing<'a> {
    /// Files served by this service under a URL path prefix.
    Local {
        /// Path prefix such as `/files/`.
        upload_url: &'a str,
    },
    /// Files addressed by the backend; the artifact carries its locator.
    Object {
        /// Base prepended to the object's file name to form the delete URL.
        delete_url_base: &'a str,
    },
}

/// Percent-encodes one path component.
#[must_use]
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Percent-encodes every segment of a slash separated key.
#[must_use]
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// Decodes a percent-encoded component, keeping invalid UTF-8 lossy.
#[must_use]
pub fn decode_component(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn last_segment(url: &str) -> &str {
    strip_query(url).rsplit('/').next().unwrap_or_default()
}

fn with_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

/// Sets `url`, `deleteUrl` and, for versioned artifacts, one URL per label.
///
/// Failed artifacts get no URLs.
pub fn materialize(
    artifact: &mut Artifact,
    addressing: Addressing<'_>,
    specs: &VersionSpecs,
    ctx: &RequestContext,
) {
    if artifact.error().is_some() {
        return;
    }
    let urls = match addressing {
        Addressing::Local { upload_url } => local_urls(artifact, upload_url, specs, ctx),
        Addressing::Object { delete_url_base } => {
            match object_urls(artifact, delete_url_base, specs, ctx) {
                Some(urls) => urls,
                None => return,
            }
        }
    };
    let (url, delete_url, version_urls) = urls;
    artifact.set_urls(url, delete_url, version_urls);
}

fn local_urls(
    artifact: &Artifact,
    upload_url: &str,
    specs: &VersionSpecs,
    ctx: &RequestContext,
) -> (String, String, VersionUrls) {
    let base = format!("{}{}", ctx.origin(), with_trailing_slash(upload_url));
    let encoded = encode_component(artifact.name());
    let url = format!("{base}{encoded}");

    let mut version_urls = VersionUrls::default();
    if artifact.has_versions() {
        for label in specs.keys() {
            let version_url = match artifact.versions().get(label) {
                Some(info) if info.is_ok() => {
                    format!("{base}{}/{encoded}", encode_component(label))
                }
                _ => url.clone(),
            };
            version_urls.insert(label, version_url);
        }
    }

    (url.clone(), url, version_urls)
}

fn object_urls(
    artifact: &Artifact,
    delete_url_base: &str,
    specs: &VersionSpecs,
    ctx: &RequestContext,
) -> Option<(String, String, VersionUrls)> {
    let url = artifact.locator()?.to_string();

    let delete_base = if delete_url_base.starts_with('/') {
        format!("{}{}", ctx.origin(), with_trailing_slash(delete_url_base))
    } else {
        with_trailing_slash(delete_url_base)
    };
    let delete_url = format!("{delete_base}{}", last_segment(&url));

    let mut version_urls = VersionUrls::default();
    if artifact.has_versions() {
        for label in specs.keys() {
            let version_url = match artifact.versions().get(label) {
                Some(info) if info.is_ok() => info
                    .locator
                    .clone()
                    .or_else(|| derive_version_url(&url, label))
                    .unwrap_or_else(|| url.clone()),
                _ => url.clone(),
            };
            version_urls.insert(label, version_url);
        }
    }

    Some((url, delete_url, version_urls))
}

/// `https://host/prefix/photo.jpg?sig` becomes `https://host/prefix/<label>/photo.jpg`.
fn derive_version_url(url: &str, label: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let path = parsed.path().to_string();
    let (dir, file) = path.rsplit_once('/')?;
    parsed.set_path(&format!("{dir}/{}/{file}", encode_component(label)));
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}
