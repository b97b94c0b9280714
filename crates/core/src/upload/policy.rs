//! Size and type limits checked before a file reaches any transport.

use regex::Regex;
use stowage_shared::UploadConfig;

use super::error::{UploadError, ValidationError};

/// Compiled upload limits. A limit of 0 disables that check.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    min_file_size: u64,
    max_file_size: u64,
    max_post_size: u64,
    accept_file_types: Regex,
}

impl UploadPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(min_file_size: u64, max_file_size: u64, max_post_size: u64, accept_file_types: Regex) -> Self {
        Self {
            min_file_size,
            max_file_size,
            max_post_size,
            accept_file_types,
        }
    }

    /// Compile the policy from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `accept_file_types` is not a valid pattern.
    pub fn from_config(config: &UploadConfig) -> Result<Self, UploadError> {
        let accept_file_types = Regex::new(&config.accept_file_types)
            .map_err(|e| UploadError::InvalidPolicy(format!("accept_file_types: {e}")))?;
        Ok(Self::new(
            config.min_file_size,
            config.max_file_size,
            config.max_post_size,
            accept_file_types,
        ))
    }

    /// Checks a received file: too small, then too big, then type.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, name: &str, size: u64) -> Result<(), ValidationError> {
        if self.min_file_size != 0 && size < self.min_file_size {
            return Err(ValidationError::TooSmall);
        }
        if self.max_file_size != 0 && size > self.max_file_size {
            return Err(ValidationError::TooBig);
        }
        if !self.accept_file_types.is_match(name) {
            return Err(ValidationError::TypeNotAllowed);
        }
        Ok(())
    }

    /// Cutoff for a whole request body.
    #[must_use]
    pub fn max_post_size(&self) -> u64 {
        self.max_post_size
    }

    /// True once `received` body bytes pass the cutoff.
    #[must_use]
    pub fn exceeds_post_size(&self, received: u64) -> bool {
        self.max_post_size != 0 && received > self.max_post_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> UploadPolicy {
        UploadPolicy::new(1024, 10_000, 20_000, Regex::new(r"(?i)\.(jpe?g|png|txt)$").expect("valid regex"))
    }

    #[rstest]
    #[case("photo.jpg", 0, Err(ValidationError::TooSmall))]
    #[case("photo.jpg", 1023, Err(ValidationError::TooSmall))]
    #[case("photo.jpg", 1024, Ok(()))]
    #[case("photo.jpg", 10_000, Ok(()))]
    #[case("photo.jpg", 10_001, Err(ValidationError::TooBig))]
    #[case("script.exe", 2048, Err(ValidationError::TypeNotAllowed))]
    #[case("script.exe", 10, Err(ValidationError::TooSmall))]
    fn test_validate(
        #[case] name: &str,
        #[case] size: u64,
        #[case] expected: Result<(), ValidationError>,
    ) {
        assert_eq!(policy().validate(name, size), expected);
    }

    #[test]
    fn test_zero_limits_disable_checks() {
        let open = UploadPolicy::new(0, 0, 0, Regex::new(".+").expect("valid regex"));
        assert!(open.validate("empty.bin", 0).is_ok());
        assert!(open.validate("huge.bin", u64::MAX).is_ok());
        assert!(!open.exceeds_post_size(u64::MAX));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = UploadPolicy::from_config(&UploadConfig::default()).expect("policy");
        assert_eq!(policy.max_post_size(), 11_000_000);
        assert!(policy.exceeds_post_size(11_000_001));
        assert_eq!(policy.validate("a.txt", 0), Err(ValidationError::TooSmall));
    }

    #[test]
    fn test_from_config_rejects_bad_pattern() {
        let config = UploadConfig {
            accept_file_types: "(".to_string(),
            ..UploadConfig::default()
        };
        assert!(matches!(
            UploadPolicy::from_config(&config),
            Err(UploadError::InvalidPolicy(_))
        ));
    }
}
