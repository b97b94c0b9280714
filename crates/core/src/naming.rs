//! Collision-safe names for stored files.
//!
//! A requested name is reduced to its last path component without leading
//! dots. When that name is taken in the target namespace a counter is
//! inserted before the extension: `photo.jpg`, `photo (1).jpg`,
//! `photo (2).jpg`, ...

use std::future::Future;

use dashmap::DashSet;
use uuid::Uuid;

/// Strips directory components and leading dots.
///
/// Returns a generated token when nothing usable is left.
#[must_use]
pub fn sanitize(requested: &str) -> String {
    let base = requested
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('.');

    if base.is_empty() {
        Uuid::new_v4().simple().to_string()
    } else {
        base.to_string()
    }
}

/// Returns the name following `name` in the disambiguation sequence.
#[must_use]
pub fn next_candidate(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    let (base, counter) = split_counter(stem);
    format!("{base} ({}){ext}", counter.saturating_add(1))
}

/// Every name `requested` may be stored under, in the order they are tried.
///
/// The sequence never ends.
#[derive(Debug, Clone)]
pub struct Candidates {
    upcoming: String,
}

impl Candidates {
    /// Starts at the sanitized `requested` name.
    #[must_use]
    pub fn new(requested: &str) -> Self {
        Self {
            upcoming: sanitize(requested),
        }
    }

    /// Returns the current candidate and moves to the following one.
    pub fn advance(&mut self) -> String {
        let following = next_candidate(&self.upcoming);
        std::mem::replace(&mut self.upcoming, following)
    }
}

impl Iterator for Candidates {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        Some(self.advance())
    }
}

/// `("photo (1)", ".jpg")` for `photo (1).jpg`; no extension for dot-less names.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    }
}

/// `("photo", 3)` for `photo (3)`, `(stem, 0)` when there is no counter.
fn split_counter(stem: &str) -> (&str, u64) {
    let Some(inner) = stem.strip_suffix(')') else {
        return (stem, 0);
    };
    let Some(open) = inner.rfind(" (") else {
        return (stem, 0);
    };
    let digits = &inner[open + 2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (stem, 0);
    }
    match digits.parse::<u64>() {
        Ok(counter) => (&stem[..open], counter),
        Err(_) => (stem, 0),
    }
}

/// Names handed out by one transport that are not yet visible in its backend.
///
/// Claiming inserts into the set atomically, so two uploads racing for the
/// same name inside this process never both get it.
#[derive(Debug, Default)]
pub struct NameRegistry {
    reserved: DashSet<String>,
}

impl NameRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the first free name for `requested`.
    ///
    /// `exists` asks the backend whether a candidate is already stored.
    pub async fn claim<F, Fut, E>(&self, requested: &str, mut exists: F) -> Result<String, E>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let mut names = Candidates::new(requested);
        loop {
            let name = names.advance();
            if !self.reserved.contains(&name)
                && !exists(name.clone()).await?
                && self.reserved.insert(name.clone())
            {
                return Ok(name);
            }
        }
    }

    /// Releases a claimed name once the backend holds it (or never will).
    pub fn release(&self, name: &str) {
        self.reserved.remove(name);
    }

    /// True while `name` is claimed but not released.
    #[must_use]
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::convert::Infallible;

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("photo.jpg", "photo.jpg")]
    #[case("../../etc/passwd", "passwd")]
    #[case("C:\\Users\\me\\report.pdf", "report.pdf")]
    #[case(".htaccess", "htaccess")]
    #[case("dir/..hidden.txt", "hidden.txt")]
    fn test_sanitize(#[case] requested: &str, #[case] expected: &str) {
        assert_eq!(sanitize(requested), expected);
    }

    #[rstest]
    #[case("")]
    #[case("...")]
    #[case("uploads/")]
    fn test_sanitize_empty_generates_token(#[case] requested: &str) {
        let name = sanitize(requested);
        assert_eq!(name.len(), 32);
        assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[rstest]
    #[case("photo.jpg", "photo (1).jpg")]
    #[case("photo (1).jpg", "photo (2).jpg")]
    #[case("photo (9).jpg", "photo (10).jpg")]
    #[case("archive.tar.gz", "archive.tar (1).gz")]
    #[case("README", "README (1)")]
    #[case("README (4)", "README (5)")]
    #[case("photo (x).jpg", "photo (x) (1).jpg")]
    fn test_next_candidate(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(next_candidate(name), expected);
    }

    #[test]
    fn test_candidates_skip_taken_names() {
        let existing: HashSet<&str> = ["photo.jpg", "photo (1).jpg"].into_iter().collect();
        let free = |requested: &str| Candidates::new(requested).find(|c| !existing.contains(c.as_str()));
        assert_eq!(free("photo.jpg").as_deref(), Some("photo (2).jpg"));
        assert_eq!(free("other.jpg").as_deref(), Some("other.jpg"));
    }

    #[tokio::test]
    async fn test_registry_claims_distinct_names() {
        let registry = NameRegistry::new();
        let none_exist = |_: String| async { Ok::<_, Infallible>(false) };

        let first = registry.claim("photo.jpg", none_exist).await.unwrap();
        let second = registry.claim("photo.jpg", none_exist).await.unwrap();

        assert_eq!(first, "photo.jpg");
        assert_eq!(second, "photo (1).jpg");
        assert!(registry.is_reserved("photo.jpg"));

        registry.release("photo.jpg");
        assert!(!registry.is_reserved("photo.jpg"));
    }

    #[tokio::test]
    async fn test_registry_consults_backend() {
        let registry = NameRegistry::new();
        let stored = |name: String| async move { Ok::<_, Infallible>(name == "photo.jpg") };

        let name = registry.claim("photo.jpg", stored).await.unwrap();
        assert_eq!(name, "photo (1).jpg");
    }

    #[tokio::test]
    async fn test_registry_propagates_backend_error() {
        let registry = NameRegistry::new();
        let failing = |_: String| async { Err::<bool, _>("backend down") };

        assert_eq!(registry.claim("photo.jpg", failing).await, Err("backend down"));
        assert!(!registry.is_reserved("photo.jpg"));
    }
}
