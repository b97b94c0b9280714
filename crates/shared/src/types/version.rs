//! Resize targets for derived image versions.
//!
//! A version spec is configured as `{ width = 99, height = "auto" }`; at most one
//! side may be `"auto"`, which keeps the aspect ratio of the original image.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version specs keyed by label (e.g. `thumbnail`), ordered by label.
pub type VersionSpecs = BTreeMap<String, VersionSpec>;

/// One side of a resize target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "DimensionRepr", into = "DimensionRepr")]
pub enum Dimension {
    /// Derive this side from the other one and the original aspect ratio.
    Auto,
    /// Fixed size in pixels.
    Pixels(u32),
}

impl Dimension {
    /// Returns the fixed pixel size, if any.
    #[must_use]
    pub const fn pixels(self) -> Option<u32> {
        match self {
            Self::Auto => None,
            Self::Pixels(px) => Some(px),
        }
    }

    /// Returns true for `"auto"`.
    #[must_use]
    pub const fn is_auto(self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Pixels(px) => write!(f, "{px}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DimensionRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<DimensionRepr> for Dimension {
    type Error = String;

    fn try_from(repr: DimensionRepr) -> Result<Self, Self::Error> {
        match repr {
            DimensionRepr::Number(px) => Ok(Self::Pixels(px)),
            DimensionRepr::Text(text) if text.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            DimensionRepr::Text(text) => Err(format!(
                "invalid dimension '{text}': expected a pixel count or \"auto\""
            )),
        }
    }
}

impl From<Dimension> for DimensionRepr {
    fn from(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Auto => Self::Text("auto".to_string()),
            Dimension::Pixels(px) => Self::Number(px),
        }
    }
}

/// Resize target for one derived version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSpec {
    /// Target width.
    pub width: Dimension,
    /// Target height.
    pub height: Dimension,
}

impl VersionSpec {
    /// Create a spec from two dimensions.
    #[must_use]
    pub const fn new(width: Dimension, height: Dimension) -> Self {
        Self { width, height }
    }

    /// Fixed width, height follows the aspect ratio.
    #[must_use]
    pub const fn width(px: u32) -> Self {
        Self::new(Dimension::Pixels(px), Dimension::Auto)
    }

    /// Fixed height, width follows the aspect ratio.
    #[must_use]
    pub const fn height(px: u32) -> Self {
        Self::new(Dimension::Auto, Dimension::Pixels(px))
    }

    /// Fixed box.
    #[must_use]
    pub const fn exact(width: u32, height: u32) -> Self {
        Self::new(Dimension::Pixels(width), Dimension::Pixels(height))
    }

    /// A spec is usable when at least one side is a non-zero pixel count
    /// and neither side is zero.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        match (self.width, self.height) {
            (Dimension::Auto, Dimension::Auto) => false,
            (Dimension::Pixels(0), _) | (_, Dimension::Pixels(0)) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_dimension_deserializes_number_and_auto() {
        let spec: VersionSpec =
            serde_json::from_str(r#"{"width": 99, "height": "auto"}"#).expect("valid spec");
        assert_eq!(spec, VersionSpec::width(99));

        let spec: VersionSpec =
            serde_json::from_str(r#"{"width": "AUTO", "height": 40}"#).expect("valid spec");
        assert_eq!(spec, VersionSpec::height(40));
    }

    #[test]
    fn test_dimension_rejects_unknown_text() {
        let result: Result<VersionSpec, _> =
            serde_json::from_str(r#"{"width": "wide", "height": 40}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_dimension_serializes_back() {
        let json = serde_json::to_string(&VersionSpec::width(80)).expect("serializable");
        assert_eq!(json, r#"{"width":80,"height":"auto"}"#);
    }

    #[rstest]
    #[case(VersionSpec::width(99), true)]
    #[case(VersionSpec::height(99), true)]
    #[case(VersionSpec::exact(10, 20), true)]
    #[case(VersionSpec::new(Dimension::Auto, Dimension::Auto), false)]
    #[case(VersionSpec::width(0), false)]
    #[case(VersionSpec::exact(10, 0), false)]
    fn test_spec_validity(#[case] spec: VersionSpec, #[case] expected: bool) {
        assert_eq!(spec.is_valid(), expected);
    }
}
