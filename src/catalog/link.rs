//! Download link types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a related URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// The granule's data file (`GET DATA`).
    PrimaryData,
    /// Documentation or metadata about the granule (`VIEW RELATED INFORMATION`).
    RelatedInfo,
    /// Browse imagery (`GET RELATED VISUALIZATION`).
    Visualization,
}

impl LinkRole {
    /// Maps a UMM `RelatedUrls[].Type` value to a role.
    ///
    /// Returns `None` for every type that is not downloaded.
    #[must_use]
    pub fn from_umm_type(value: &str) -> Option<Self> {
        match value {
            "GET DATA" => Some(Self::PrimaryData),
            "VIEW RELATED INFORMATION" => Some(Self::RelatedInfo),
            "GET RELATED VISUALIZATION" => Some(Self::Visualization),
            _ => None,
        }
    }

    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryData => "primary_data",
            Self::RelatedInfo => "related_info",
            Self::Visualization => "visualization",
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One downloadable URL of an asset. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    url: String,
    role: LinkRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected_size_bytes: Option<u64>,
}

impl DownloadLink {
    /// Creates a link with unknown size.
    #[must_use]
    pub fn new(url: impl Into<String>, role: LinkRole) -> Self {
        Self {
            url: url.into(),
            role,
            expected_size_bytes: None,
        }
    }

    /// Creates a link with a known size in bytes.
    #[must_use]
    pub fn with_expected_size(url: impl Into<String>, role: LinkRole, bytes: u64) -> Self {
        Self {
            url: url.into(),
            role,
            expected_size_bytes: Some(bytes),
        }
    }

    /// The link URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The link role.
    #[must_use]
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Size advertised by the catalog, when known.
    #[must_use]
    pub fn expected_size_bytes(&self) -> Option<u64> {
        self.expected_size_bytes
    }
}
